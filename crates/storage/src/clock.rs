use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::ServerTimestamp;

/// Time source owned by the store; callers never supply timestamps.
pub trait ServerClock: Send + Sync {
    fn now(&self) -> ServerTimestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ServerClock for SystemClock {
    fn now(&self) -> ServerTimestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0_i64, |duration| {
                i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
            });
        ServerTimestamp::from_unix_micros(micros)
    }
}

/// Hand-driven clock for deterministic ordering scenarios.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: ServerTimestamp) -> Self {
        Self {
            micros: AtomicI64::new(start.unix_micros()),
        }
    }

    pub fn set(&self, at: ServerTimestamp) {
        self.micros.store(at.unix_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) -> ServerTimestamp {
        let previous = self.micros.fetch_add(micros, Ordering::SeqCst);
        ServerTimestamp::from_unix_micros(previous + micros)
    }
}

impl ServerClock for ManualClock {
    fn now(&self) -> ServerTimestamp {
        ServerTimestamp::from_unix_micros(self.micros.load(Ordering::SeqCst))
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Discussion thread key: the integer id of the art piece the thread belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub i64);

impl TopicId {
    pub const fn new(art_piece_id: i64) -> Self {
        Self(art_piece_id)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<i64> for TopicId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

/// Store-assigned message identifier.
///
/// UUIDv7 values sort by creation time, and `Ord` on the wrapped UUID matches the
/// ordering of the hyphenated lowercase string, so typed and raw comparisons agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-message-id",
            id_type: "message-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl From<MessageId> for Uuid {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl FromStr for MessageId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trips_through_display() {
        let id = MessageId::new_v7();
        let parsed: MessageId = id.to_string().parse().expect("valid id");
        assert_eq!(parsed, id);
    }

    #[test]
    fn message_id_rejects_garbage() {
        let error = MessageId::parse("not-a-message").expect_err("invalid id");
        assert!(matches!(error, StorageError::InvalidId { .. }));
    }

    #[test]
    fn typed_order_matches_string_order() {
        let low = MessageId::parse("01890000-0000-7000-8000-000000000001").expect("valid id");
        let high = MessageId::parse("01890000-0000-7000-8000-00000000000a").expect("valid id");
        assert!(low < high);
        assert!(low.to_string() < high.to_string());
    }
}

use std::sync::Arc;

use arc_swap::ArcSwap;
use gallery_storage::{MessageStore, StorageResult, StoredDocument, TopicId, TopicWatch};
use snafu::ResultExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::{
    ChangeFeedClosedSnafu, ChannelRejectedSnafu, ChatError, ChatResult, NoRuntimeSnafu,
    StoreSnafu, WorkerJoinSnafu,
};
use crate::message::TopicSnapshot;

/// Lifecycle of one topic subscription.
///
/// `generation` identifies the `subscribe` call that produced the state, so a worker
/// from an older subscription can never move a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    Listening {
        generation: u64,
    },
    Error {
        generation: u64,
        message: String,
    },
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTransition {
    Subscribe { generation: u64 },
    Fail { generation: u64, message: String },
    Dispose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRejection {
    AlreadyListening { active: u64 },
    Disposed,
    StaleGeneration { active: u64, attempted: u64 },
    NotListening,
}

pub type ChannelTransitionResult = Result<ChannelState, ChannelRejection>;

impl ChannelState {
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Listening { generation } | Self::Error { generation, .. } => Some(*generation),
            Self::Idle | Self::Disposed => None,
        }
    }

    pub fn apply(&self, transition: ChannelTransition) -> ChannelTransitionResult {
        match transition {
            ChannelTransition::Subscribe { generation } => self.apply_subscribe(generation),
            ChannelTransition::Fail {
                generation,
                message,
            } => self.apply_fail(generation, message),
            ChannelTransition::Dispose => Ok(Self::Disposed),
        }
    }

    fn apply_subscribe(&self, generation: u64) -> ChannelTransitionResult {
        match self {
            Self::Idle | Self::Error { .. } => Ok(Self::Listening { generation }),
            Self::Listening { generation: active } => {
                Err(ChannelRejection::AlreadyListening { active: *active })
            }
            Self::Disposed => Err(ChannelRejection::Disposed),
        }
    }

    fn apply_fail(&self, generation: u64, message: String) -> ChannelTransitionResult {
        match self {
            Self::Listening { generation: active } if *active == generation => Ok(Self::Error {
                generation,
                message,
            }),
            Self::Listening { generation: active } => Err(ChannelRejection::StaleGeneration {
                active: *active,
                attempted: generation,
            }),
            Self::Error {
                generation: active, ..
            } if *active != generation => Err(ChannelRejection::StaleGeneration {
                active: *active,
                attempted: generation,
            }),
            Self::Disposed => Err(ChannelRejection::Disposed),
            Self::Idle | Self::Error { .. } => Err(ChannelRejection::NotListening),
        }
    }
}

/// Applies a transition atomically against the shared state.
fn transition_shared(
    state: &ArcSwap<ChannelState>,
    transition: ChannelTransition,
) -> ChannelTransitionResult {
    let mut outcome = Err(ChannelRejection::NotListening);
    state.rcu(|current| match current.apply(transition.clone()) {
        Ok(next) => {
            outcome = Ok(next.clone());
            Arc::new(next)
        }
        Err(rejection) => {
            outcome = Err(rejection);
            Arc::clone(current)
        }
    });
    outcome
}

#[derive(Debug)]
pub enum ChannelEvent {
    /// Full ordered content of the topic; replaces whatever was delivered before.
    Snapshot(TopicSnapshot),
    /// Transport failure. No further events follow for this subscription.
    Failed(ChatError),
}

/// Push-based subscription to one topic of a [`MessageStore`].
///
/// At most one subscription is active at a time. Events are produced on a runtime
/// task, never from inside `subscribe` itself.
pub struct LiveChannel {
    topic_id: TopicId,
    store: Arc<dyn MessageStore>,
    state: Arc<ArcSwap<ChannelState>>,
    next_generation: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl LiveChannel {
    pub fn new(topic_id: TopicId, store: Arc<dyn MessageStore>) -> Self {
        Self {
            topic_id,
            store,
            state: Arc::new(ArcSwap::from_pointee(ChannelState::Idle)),
            next_generation: 0,
            cancel_tx: None,
        }
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    pub fn state(&self) -> ChannelState {
        self.state.load().as_ref().clone()
    }

    pub fn subscribe(&mut self) -> ChatResult<SnapshotSubscription> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu {
            stage: "channel-subscribe",
        })?;

        let generation = self.next_generation + 1;
        transition_shared(&self.state, ChannelTransition::Subscribe { generation }).map_err(
            |rejection| {
                ChannelRejectedSnafu {
                    stage: "channel-subscribe",
                    topic_id: self.topic_id,
                    rejection,
                }
                .build()
            },
        )?;
        self.next_generation = generation;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        // A previous subscription that ended in `Error` has already stopped.
        self.cancel_tx = Some(cancel_tx);

        let listener = Listener {
            topic_id: self.topic_id,
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            generation,
            events: event_tx,
        };
        runtime.spawn(listener.run(cancel_rx));

        tracing::debug!(topic_id = %self.topic_id, generation, "live channel subscribed");

        Ok(SnapshotSubscription {
            topic_id: self.topic_id,
            generation,
            events: event_rx,
            state: Arc::clone(&self.state),
        })
    }

    /// Tears the channel down. Idempotent; no events are delivered afterwards.
    pub fn dispose(&mut self) {
        if self.state.load().is_disposed() {
            return;
        }

        let _ = transition_shared(&self.state, ChannelTransition::Dispose);
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        tracing::debug!(topic_id = %self.topic_id, "live channel disposed");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Receiving side of one `subscribe` call.
pub struct SnapshotSubscription {
    topic_id: TopicId,
    generation: u64,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    state: Arc<ArcSwap<ChannelState>>,
}

impl SnapshotSubscription {
    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next event, or `None` once the subscription was disposed, replaced, or ended.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.events.recv().await?;
        self.is_current().then_some(event)
    }

    fn is_current(&self) -> bool {
        self.state.load().generation() == Some(self.generation)
    }
}

struct Listener {
    topic_id: TopicId,
    store: Arc<dyn MessageStore>,
    state: Arc<ArcSwap<ChannelState>>,
    generation: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Listener {
    async fn run(self, mut cancel_rx: oneshot::Receiver<()>) {
        let mut watch = tokio::select! {
            _ = &mut cancel_rx => return,
            watch = self.open_watch() => match watch {
                Ok(watch) => watch,
                Err(error) => return self.fail(error),
            },
        };

        loop {
            // Mark the current revision seen before reading so a write racing the read
            // still wakes the next iteration.
            watch.borrow_and_update();

            let documents = tokio::select! {
                _ = &mut cancel_rx => return,
                documents = self.load_documents() => documents,
            };
            let snapshot = match documents {
                Ok(documents) => TopicSnapshot::from_documents(self.topic_id, &documents),
                Err(error) => return self.fail(error),
            };

            if !self.is_current() {
                return;
            }
            tracing::trace!(
                topic_id = %self.topic_id,
                messages = snapshot.len(),
                dropped = snapshot.dropped,
                "delivering topic snapshot"
            );
            if self.events.send(ChannelEvent::Snapshot(snapshot)).is_err() {
                tracing::debug!(
                    topic_id = %self.topic_id,
                    "snapshot receiver dropped, stopping listener"
                );
                return;
            }

            let changed = tokio::select! {
                _ = &mut cancel_rx => return,
                changed = watch.changed() => changed,
            };
            if changed.is_err() {
                let error = ChangeFeedClosedSnafu {
                    stage: "channel-wait-change",
                    topic_id: self.topic_id,
                }
                .build();
                return self.fail(error);
            }
        }
    }

    async fn open_watch(&self) -> ChatResult<TopicWatch> {
        let store = Arc::clone(&self.store);
        let topic_id = self.topic_id;
        run_store_call("channel-watch-topic", move || store.watch_topic(topic_id)).await
    }

    async fn load_documents(&self) -> ChatResult<Vec<StoredDocument>> {
        let store = Arc::clone(&self.store);
        let topic_id = self.topic_id;
        run_store_call("channel-load-topic", move || store.load_documents(topic_id)).await
    }

    fn is_current(&self) -> bool {
        **self.state.load() == (ChannelState::Listening {
            generation: self.generation,
        })
    }

    fn fail(&self, error: ChatError) {
        let transition = ChannelTransition::Fail {
            generation: self.generation,
            message: error.to_string(),
        };
        match transition_shared(&self.state, transition) {
            Ok(_) => {
                tracing::warn!(
                    topic_id = %self.topic_id,
                    generation = self.generation,
                    error = %error,
                    "live channel subscription failed"
                );
                let _ = self.events.send(ChannelEvent::Failed(error));
            }
            Err(rejection) => {
                tracing::debug!(
                    topic_id = %self.topic_id,
                    ?rejection,
                    error = %error,
                    "ignoring failure from inactive subscription"
                );
            }
        }
    }
}

/// Runs a synchronous store call on the blocking pool.
pub(crate) async fn run_store_call<T, F>(stage: &'static str, call: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .context(WorkerJoinSnafu { stage })?
        .context(StoreSnafu { stage })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gallery_storage::{MemoryMessageStore, NewMessage};

    use super::*;

    const TOPIC: TopicId = TopicId::new(21);

    #[test]
    fn subscribe_moves_idle_to_listening() {
        let next = ChannelState::Idle
            .apply(ChannelTransition::Subscribe { generation: 1 })
            .expect("legal");
        assert_eq!(next, ChannelState::Listening { generation: 1 });
    }

    #[test]
    fn second_subscribe_while_listening_is_rejected() {
        let rejection = ChannelState::Listening { generation: 1 }
            .apply(ChannelTransition::Subscribe { generation: 2 })
            .expect_err("already listening");
        assert_eq!(rejection, ChannelRejection::AlreadyListening { active: 1 });
    }

    #[test]
    fn error_can_be_resubscribed_but_disposed_cannot() {
        let failed = ChannelState::Error {
            generation: 1,
            message: "offline".to_string(),
        };
        assert_eq!(
            failed.apply(ChannelTransition::Subscribe { generation: 2 }),
            Ok(ChannelState::Listening { generation: 2 })
        );
        assert_eq!(
            ChannelState::Disposed.apply(ChannelTransition::Subscribe { generation: 3 }),
            Err(ChannelRejection::Disposed)
        );
    }

    #[test]
    fn stale_failures_do_not_touch_newer_subscription() {
        let state = ChannelState::Listening { generation: 4 };
        let rejection = state
            .apply(ChannelTransition::Fail {
                generation: 3,
                message: "old".to_string(),
            })
            .expect_err("stale");
        assert_eq!(
            rejection,
            ChannelRejection::StaleGeneration {
                active: 4,
                attempted: 3
            }
        );
    }

    #[test]
    fn failure_requires_listening() {
        assert_eq!(
            ChannelState::Idle.apply(ChannelTransition::Fail {
                generation: 1,
                message: "x".to_string(),
            }),
            Err(ChannelRejection::NotListening)
        );
        assert_eq!(
            ChannelState::Disposed.apply(ChannelTransition::Fail {
                generation: 1,
                message: "x".to_string(),
            }),
            Err(ChannelRejection::Disposed)
        );
    }

    async fn next_snapshot(subscription: &mut SnapshotSubscription) -> TopicSnapshot {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("event within timeout")
            .expect("subscription open");
        match event {
            ChannelEvent::Snapshot(snapshot) => snapshot,
            ChannelEvent::Failed(error) => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn delivers_initial_and_updated_snapshots() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut channel = LiveChannel::new(TOPIC, store.clone());
        let mut subscription = channel.subscribe().expect("subscribes");

        assert!(next_snapshot(&mut subscription).await.is_empty());

        store
            .append_message(TOPIC, NewMessage::new("hello", None))
            .expect("append succeeds");
        let snapshot = next_snapshot(&mut subscription).await;
        assert_eq!(snapshot.texts(), vec!["hello"]);
    }

    #[tokio::test]
    async fn subscribe_requires_dispose_or_error_first() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut channel = LiveChannel::new(TOPIC, store);
        let _subscription = channel.subscribe().expect("subscribes");

        let error = channel.subscribe().err().expect("second subscribe rejected");
        assert!(matches!(error, ChatError::ChannelRejected { .. }));
    }

    #[tokio::test]
    async fn outage_moves_channel_to_error() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut channel = LiveChannel::new(TOPIC, store.clone());
        let mut subscription = channel.subscribe().expect("subscribes");
        next_snapshot(&mut subscription).await;

        store.set_offline(true);
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("event within timeout")
            .expect("failure is delivered");
        match event {
            ChannelEvent::Failed(error) => assert!(error.is_transport()),
            ChannelEvent::Snapshot(_) => panic!("expected failure"),
        }
        assert!(channel.state().is_error());
    }

    #[tokio::test]
    async fn dispose_ends_the_subscription() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut channel = LiveChannel::new(TOPIC, store.clone());
        let mut subscription = channel.subscribe().expect("subscribes");
        next_snapshot(&mut subscription).await;

        channel.dispose();
        store
            .append_message(TOPIC, NewMessage::new("after", None))
            .expect("append succeeds");

        let next = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("stream ends within timeout");
        assert!(next.is_none());
        assert_eq!(channel.state(), ChannelState::Disposed);
    }

    #[test]
    fn subscribe_outside_runtime_fails() {
        let mut channel = LiveChannel::new(TOPIC, Arc::new(MemoryMessageStore::new()));
        let error = channel.subscribe().err().expect("no runtime");
        assert!(matches!(error, ChatError::NoRuntime { .. }));
        assert_eq!(channel.state(), ChannelState::Idle);
    }
}

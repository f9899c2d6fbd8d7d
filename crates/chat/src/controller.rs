use std::future::Future;
use std::sync::Arc;

use gallery_storage::{MessageId, MessageStore, NewMessage, TopicId};
use snafu::ResultExt;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::channel::{
    ChannelEvent, ChannelState, LiveChannel, SnapshotSubscription, run_store_call,
};
use crate::error::{ChatResult, CompletionDroppedSnafu, NoRuntimeSnafu};
use crate::identity::IdentityBinder;
use crate::message::TopicSnapshot;
use crate::moderation::ModerationFilter;

/// Log target for authorization decisions on message deletion.
pub const AUDIT_TARGET: &str = "gallery_chat::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Sent(MessageId),
    Deleted(MessageId),
    /// Nothing reached the store: blank input or an unauthorized delete.
    Skipped,
}

/// Completion signal of a fire-and-forget `send` or `delete`.
#[must_use = "dropping a completion discards the outcome, not the action"]
pub struct Completion {
    receiver: oneshot::Receiver<ChatResult<ActionOutcome>>,
}

impl Completion {
    fn resolved(outcome: ChatResult<ActionOutcome>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(outcome);
        Self { receiver }
    }

    pub async fn outcome(self) -> ChatResult<ActionOutcome> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => CompletionDroppedSnafu {
                stage: "completion-await",
            }
            .fail(),
        }
    }
}

/// Per-topic discussion: compose, moderate, stamp, persist, and reflect the live list.
///
/// The observable list only ever changes through LiveChannel snapshots, so a sent
/// message shows up once the store has it, never as a local echo.
pub struct ChatController {
    topic_id: TopicId,
    store: Arc<dyn MessageStore>,
    identity: IdentityBinder,
    moderation: Arc<ModerationFilter>,
    channel: LiveChannel,
    messages_tx: Arc<watch::Sender<TopicSnapshot>>,
    pump: Option<JoinHandle<()>>,
    runtime: Handle,
}

impl ChatController {
    pub fn open(
        topic_id: TopicId,
        store: Arc<dyn MessageStore>,
        identity: IdentityBinder,
        moderation: Arc<ModerationFilter>,
    ) -> ChatResult<Self> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu {
            stage: "controller-open",
        })?;
        let (messages_tx, _) = watch::channel(TopicSnapshot::empty(topic_id));

        let mut controller = Self {
            topic_id,
            channel: LiveChannel::new(topic_id, Arc::clone(&store)),
            store,
            identity,
            moderation,
            messages_tx: Arc::new(messages_tx),
            pump: None,
            runtime,
        };
        controller.start_listening()?;

        tracing::info!(topic_id = %topic_id, "chat controller opened");
        Ok(controller)
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    pub fn identity(&self) -> &IdentityBinder {
        &self.identity
    }

    /// Receiver of the observable message list; every value is a full snapshot.
    pub fn messages(&self) -> watch::Receiver<TopicSnapshot> {
        self.messages_tx.subscribe()
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        self.messages_tx.borrow().clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Starts a fresh subscription after a transport failure.
    pub fn resubscribe(&mut self) -> ChatResult<()> {
        self.start_listening()?;
        tracing::info!(topic_id = %self.topic_id, "chat controller resubscribed");
        Ok(())
    }

    pub fn send(&self, raw_text: &str) -> Completion {
        let trimmed = raw_text.trim();
        if trimmed.is_empty() {
            tracing::debug!(topic_id = %self.topic_id, "ignoring blank message");
            return Completion::resolved(Ok(ActionOutcome::Skipped));
        }

        let text = self.moderation.apply(trimmed);
        let identity = self.identity.clone();
        let store = Arc::clone(&self.store);
        let topic_id = self.topic_id;

        self.spawn_action(append_as_current_author(store, identity, topic_id, text))
    }

    pub fn delete(&self, message_id: MessageId) -> Completion {
        let topic_id = self.topic_id;
        let actor = self
            .identity
            .audit_actor()
            .unwrap_or_else(|| "anonymous".to_string());

        if !self.identity.is_privileged() {
            tracing::warn!(
                target: AUDIT_TARGET,
                topic_id = %topic_id,
                message_id = %message_id,
                actor = %actor,
                "unauthorized delete ignored"
            );
            return Completion::resolved(Ok(ActionOutcome::Skipped));
        }

        let store = Arc::clone(&self.store);
        self.spawn_action(async move {
            let deleted = run_store_call("controller-delete", move || {
                store.delete_message(topic_id, message_id)
            })
            .await;

            match deleted {
                Ok(()) => {
                    tracing::info!(
                        target: AUDIT_TARGET,
                        topic_id = %topic_id,
                        message_id = %message_id,
                        actor = %actor,
                        "message deleted"
                    );
                    Ok(ActionOutcome::Deleted(message_id))
                }
                Err(error) => {
                    tracing::warn!(
                        topic_id = %topic_id,
                        message_id = %message_id,
                        error = %error,
                        "message delete failed"
                    );
                    Err(error)
                }
            }
        })
    }

    /// Stops delivering snapshots. In-flight sends and deletes still reach the store.
    pub fn dispose(&mut self) {
        self.channel.dispose();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn start_listening(&mut self) -> ChatResult<()> {
        let subscription = self.channel.subscribe()?;
        if let Some(previous) = self.pump.take() {
            previous.abort();
        }
        self.pump = Some(
            self.runtime
                .spawn(pump_snapshots(subscription, Arc::clone(&self.messages_tx))),
        );
        Ok(())
    }

    fn spawn_action<F>(&self, action: F) -> Completion
    where
        F: Future<Output = ChatResult<ActionOutcome>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.runtime.spawn(async move {
            let _ = sender.send(action.await);
        });
        Completion { receiver }
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn append_as_current_author(
    store: Arc<dyn MessageStore>,
    identity: IdentityBinder,
    topic_id: TopicId,
    text: String,
) -> ChatResult<ActionOutcome> {
    let author = identity.current_author()?;
    let record = run_store_call("controller-send", move || {
        store.append_message(topic_id, NewMessage::new(text, author))
    })
    .await?;

    tracing::info!(
        topic_id = %topic_id,
        message_id = %record.id,
        timestamp = record.timestamp.unix_micros(),
        "message appended"
    );
    Ok(ActionOutcome::Sent(record.id))
}

async fn pump_snapshots(
    mut subscription: SnapshotSubscription,
    messages_tx: Arc<watch::Sender<TopicSnapshot>>,
) {
    while let Some(event) = subscription.recv().await {
        match event {
            ChannelEvent::Snapshot(snapshot) => {
                messages_tx.send_replace(snapshot);
            }
            // The channel has logged it and moved to `Error`; the list keeps its last value.
            ChannelEvent::Failed(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use gallery_storage::MemoryMessageStore;
    use tracing::Level;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::identity::{Session, SessionAuth};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    struct BufferWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedBuffer {
        type Writer = BufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            BufferWriter(Arc::clone(&self.0))
        }
    }

    impl io::Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut guard = self
                .0
                .lock()
                .map_err(|_| io::Error::other("lock poisoned"))?;
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn open_controller(store: Arc<MemoryMessageStore>) -> ChatController {
        ChatController::open(
            TopicId::new(8),
            store,
            IdentityBinder::new(Arc::new(SessionAuth::new())),
            Arc::new(ModerationFilter::with_defaults().expect("defaults compile")),
        )
        .expect("controller opens")
    }

    #[tokio::test]
    async fn blank_input_never_reaches_the_store() {
        let store = Arc::new(MemoryMessageStore::new());
        let controller = open_controller(store.clone());

        for blank in ["", "   ", "\n\t"] {
            let outcome = controller.send(blank).outcome().await.expect("resolves");
            assert_eq!(outcome, ActionOutcome::Skipped);
        }
        assert_eq!(store.message_count(TopicId::new(8)), 0);
    }

    #[tokio::test]
    async fn anonymous_sends_are_stored_without_author() {
        let store = Arc::new(MemoryMessageStore::new());
        let controller = open_controller(store.clone());

        let outcome = controller.send(" hi ").outcome().await.expect("resolves");
        assert!(matches!(outcome, ActionOutcome::Sent(_)));

        let documents = store.load_documents(TopicId::new(8)).expect("load");
        assert_eq!(documents.len(), 1);
        assert!(!documents[0].body.contains("authorDisplayName"));
        assert!(documents[0].body.contains("\"text\":\"hi\""));
    }

    #[test]
    fn open_outside_runtime_fails() {
        let result = ChatController::open(
            TopicId::new(8),
            Arc::new(MemoryMessageStore::new()),
            IdentityBinder::new(Arc::new(SessionAuth::new())),
            Arc::new(ModerationFilter::with_defaults().expect("defaults compile")),
        );
        assert!(matches!(
            result.err(),
            Some(crate::error::ChatError::NoRuntime { .. })
        ));
    }

    #[tokio::test]
    async fn unauthorized_delete_is_written_to_the_audit_log() {
        let auth = SessionAuth::signed_in(Session::new("member-7", None));
        let controller = ChatController::open(
            TopicId::new(8),
            Arc::new(MemoryMessageStore::new()),
            IdentityBinder::new(Arc::new(auth)),
            Arc::new(ModerationFilter::with_defaults().expect("defaults compile")),
        )
        .expect("controller opens");
        let message_id = MessageId::new_v7();

        let sink = SharedBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink.clone())
            .with_ansi(false)
            .with_max_level(Level::TRACE)
            .finish();
        let completion =
            tracing::subscriber::with_default(subscriber, || controller.delete(message_id));

        assert_eq!(
            completion.outcome().await.expect("resolves"),
            ActionOutcome::Skipped
        );

        let bytes = sink.0.lock().expect("lock output").clone();
        let text = String::from_utf8(bytes).expect("utf8 log output");
        let line = text
            .lines()
            .find(|line| line.contains(AUDIT_TARGET))
            .expect("audit line");
        assert!(line.contains("WARN"), "{line}");
        assert!(line.contains(&format!("message_id={message_id}")), "{line}");
        assert!(line.contains("actor=member-7"), "{line}");
        assert!(line.contains("unauthorized delete ignored"), "{line}");
    }
}

pub mod clock;
pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use clock::{ManualClock, ServerClock, SystemClock};
pub use error::{StorageError, StorageResult};
pub use feed::{ChangeFeed, TopicWatch};
pub use ids::{MessageId, TopicId};
pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;
pub use types::{MessageDocument, MessageRecord, NewMessage, ServerTimestamp, StoredDocument};

/// Durable per-topic append-only log.
///
/// The store is the only authority on message ids and timestamps. Calls are
/// synchronous; async callers are expected to run them on a blocking worker.
pub trait MessageStore: Send + Sync {
    fn append_message(&self, topic_id: TopicId, input: NewMessage) -> StorageResult<MessageRecord>;
    fn delete_message(&self, topic_id: TopicId, message_id: MessageId) -> StorageResult<()>;
    /// Full, undecoded content of one topic.
    fn load_documents(&self, topic_id: TopicId) -> StorageResult<Vec<StoredDocument>>;
    /// Revision stream that ticks on every create or delete in the topic.
    fn watch_topic(&self, topic_id: TopicId) -> StorageResult<TopicWatch>;
}

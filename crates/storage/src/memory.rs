use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::clock::{ServerClock, SystemClock};
use super::error::{NotFoundSnafu, StorageResult, UnavailableSnafu};
use super::feed::{ChangeFeed, TopicWatch};
use super::ids::{MessageId, TopicId};
use super::types::{MessageRecord, NewMessage, ServerTimestamp, StoredDocument};
use super::MessageStore;

#[derive(Debug, Clone)]
struct StoredRow {
    id: String,
    timestamp: ServerTimestamp,
    body: String,
}

/// Process-local message store.
///
/// Used for embedding and tests; offline mode simulates a lost connection.
pub struct MemoryMessageStore {
    topics: RwLock<HashMap<TopicId, Vec<StoredRow>>>,
    feed: ChangeFeed,
    clock: Arc<dyn ServerClock>,
    offline: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn ServerClock>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        let previous = self.offline.swap(offline, Ordering::SeqCst);
        if previous != offline {
            tracing::debug!(offline, "memory message store connectivity changed");
            // Listeners re-read on wake-up, which is how they learn about the outage.
            self.feed.publish_all();
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Seeds a record verbatim, bypassing id and timestamp assignment.
    pub fn insert_raw_document(
        &self,
        topic_id: TopicId,
        id: impl Into<String>,
        timestamp: ServerTimestamp,
        body: impl Into<String>,
    ) {
        self.topics
            .write()
            .entry(topic_id)
            .or_default()
            .push(StoredRow {
                id: id.into(),
                timestamp,
                body: body.into(),
            });
        self.feed.publish(topic_id);
    }

    pub fn message_count(&self, topic_id: TopicId) -> usize {
        self.topics.read().get(&topic_id).map_or(0, Vec::len)
    }

    fn ensure_online(&self, stage: &'static str) -> StorageResult<()> {
        if self.is_offline() {
            return UnavailableSnafu {
                stage,
                details: "memory store is offline".to_string(),
            }
            .fail();
        }

        Ok(())
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append_message(&self, topic_id: TopicId, input: NewMessage) -> StorageResult<MessageRecord> {
        self.ensure_online("memory-append")?;

        let record = {
            let mut topics = self.topics.write();
            let rows = topics.entry(topic_id).or_default();
            let high_water = rows.iter().map(|row| row.timestamp).max();
            let now = self.clock.now();
            // Never order a new message before one that is already visible.
            let timestamp = high_water.map_or(now, |high| high.max(now));

            let record = MessageRecord {
                id: MessageId::new_v7(),
                topic_id,
                text: input.text,
                timestamp,
                author_display_name: input.author_display_name,
            };
            let body = record.document().to_json("memory-append-encode")?;
            rows.push(StoredRow {
                id: record.id.to_string(),
                timestamp,
                body,
            });
            record
        };

        self.feed.publish(topic_id);
        Ok(record)
    }

    fn delete_message(&self, topic_id: TopicId, message_id: MessageId) -> StorageResult<()> {
        self.ensure_online("memory-delete")?;

        let raw_id = message_id.to_string();
        let removed = {
            let mut topics = self.topics.write();
            topics.get_mut(&topic_id).is_some_and(|rows| {
                let before = rows.len();
                rows.retain(|row| row.id != raw_id);
                rows.len() != before
            })
        };

        if !removed {
            return NotFoundSnafu {
                stage: "memory-delete-missing",
                entity: "message",
                id: raw_id,
            }
            .fail();
        }

        self.feed.publish(topic_id);
        Ok(())
    }

    fn load_documents(&self, topic_id: TopicId) -> StorageResult<Vec<StoredDocument>> {
        self.ensure_online("memory-load")?;

        let topics = self.topics.read();
        Ok(topics
            .get(&topic_id)
            .map(|rows| {
                rows.iter()
                    .map(|row| StoredDocument {
                        id: row.id.clone(),
                        topic_id,
                        body: row.body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn watch_topic(&self, topic_id: TopicId) -> StorageResult<TopicWatch> {
        self.ensure_online("memory-watch")?;
        Ok(self.feed.watch(topic_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StorageError;
    use crate::types::MessageDocument;

    const TOPIC: TopicId = TopicId::new(11);

    fn manual_store(start: i64) -> (MemoryMessageStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(ServerTimestamp::from_unix_micros(start)));
        (MemoryMessageStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn append_assigns_id_and_clock_timestamp() {
        let (store, _clock) = manual_store(1_000);
        let record = store
            .append_message(TOPIC, NewMessage::new("hello", Some("Ada".to_string())))
            .expect("append succeeds");

        assert_eq!(record.timestamp, ServerTimestamp::from_unix_micros(1_000));
        assert_eq!(record.topic_id, TOPIC);

        let documents = store.load_documents(TOPIC).expect("load succeeds");
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].id, record.id.to_string());
        let body: MessageDocument = serde_json::from_str(&documents[0].body).expect("decodes");
        assert_eq!(body, record.document());
    }

    #[test]
    fn timestamps_never_go_backwards_within_a_topic() {
        let (store, clock) = manual_store(5_000);
        let first = store
            .append_message(TOPIC, NewMessage::new("first", None))
            .expect("append succeeds");

        clock.set(ServerTimestamp::from_unix_micros(4_000));
        let second = store
            .append_message(TOPIC, NewMessage::new("second", None))
            .expect("append succeeds");

        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn deleting_unknown_id_reports_not_found() {
        let store = MemoryMessageStore::new();
        store
            .append_message(TOPIC, NewMessage::new("keep", None))
            .expect("append succeeds");

        let error = store
            .delete_message(TOPIC, MessageId::new_v7())
            .expect_err("missing id");
        assert!(error.is_not_found());
        assert_eq!(store.message_count(TOPIC), 1);
    }

    #[test]
    fn delete_removes_the_record_permanently() {
        let store = MemoryMessageStore::new();
        let record = store
            .append_message(TOPIC, NewMessage::new("gone soon", None))
            .expect("append succeeds");

        store
            .delete_message(TOPIC, record.id)
            .expect("delete succeeds");
        assert_eq!(store.message_count(TOPIC), 0);
        assert!(store.delete_message(TOPIC, record.id).is_err());
    }

    #[test]
    fn offline_store_fails_every_call_as_transport_error() {
        let store = MemoryMessageStore::new();
        store.set_offline(true);

        let error = store
            .append_message(TOPIC, NewMessage::new("lost", None))
            .expect_err("offline");
        assert!(matches!(error, StorageError::Unavailable { .. }));
        assert!(error.is_transport());
        assert!(store.load_documents(TOPIC).is_err());
        assert!(store.watch_topic(TOPIC).is_err());

        store.set_offline(false);
        assert!(store.load_documents(TOPIC).expect("online again").is_empty());
    }

    #[test]
    fn watchers_see_appends_deletes_and_outages() {
        let store = MemoryMessageStore::new();
        let mut watch = store.watch_topic(TOPIC).expect("watch succeeds");

        let record = store
            .append_message(TOPIC, NewMessage::new("tick", None))
            .expect("append succeeds");
        assert!(watch.has_changed().expect("feed open"));
        watch.borrow_and_update();

        store
            .delete_message(TOPIC, record.id)
            .expect("delete succeeds");
        assert!(watch.has_changed().expect("feed open"));
        watch.borrow_and_update();

        store.set_offline(true);
        assert!(watch.has_changed().expect("feed open"));
    }

    #[test]
    fn unknown_topic_loads_as_empty() {
        let store = MemoryMessageStore::new();
        assert!(store.load_documents(TopicId::new(404)).expect("load").is_empty());
    }
}

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::ids::TopicId;

/// Receives a new revision number whenever the watched topic changes.
pub type TopicWatch = watch::Receiver<u64>;

/// Per-topic change revisions shared by a store and its listeners.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    topics: Mutex<HashMap<TopicId, watch::Sender<u64>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self, topic_id: TopicId) -> TopicWatch {
        let mut topics = self.topics.lock();
        topics
            .entry(topic_id)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    pub fn publish(&self, topic_id: TopicId) {
        let mut topics = self.topics.lock();
        let Some(sender) = topics.get(&topic_id) else {
            return;
        };

        if sender.receiver_count() == 0 {
            topics.remove(&topic_id);
        } else {
            sender.send_modify(|revision| *revision += 1);
        }
    }

    /// Wakes every listener, e.g. after connectivity changed.
    pub fn publish_all(&self) {
        let mut topics = self.topics.lock();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        for sender in topics.values() {
            sender.send_modify(|revision| *revision += 1);
        }
    }
}

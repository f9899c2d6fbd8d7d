use gallery_storage::{MessageId, ServerTimestamp};
use tokio::sync::watch;

use crate::error::{ChatResult, SnapshotFeedClosedSnafu};
use crate::identity::DEFAULT_ANONYMOUS_LABEL;
use crate::message::{Message, TopicSnapshot};

/// Stable identity of a rendered row.
pub type RowKey = MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingChange {
    NewTrailing,
    TrailingRemoved,
}

/// Request to bring the newest row into view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollToLatest {
    /// Row to scroll to; `None` when the list became empty.
    pub latest: Option<RowKey>,
    pub reason: TrailingChange,
}

/// Fires when the identity of the last element differs between two ordered lists.
pub fn trailing_change(previous: &[Message], next: &[Message]) -> Option<ScrollToLatest> {
    let previous_last = previous.last().map(|message| message.id);
    let next_last = next.last().map(|message| message.id);
    if previous_last == next_last {
        return None;
    }

    let reason = match next_last {
        Some(latest) if !previous.iter().any(|message| message.id == latest) => {
            TrailingChange::NewTrailing
        }
        _ => TrailingChange::TrailingRemoved,
    };

    Some(ScrollToLatest {
        latest: next_last,
        reason,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub key: RowKey,
    pub author: String,
    pub text: String,
    pub timestamp: ServerTimestamp,
}

/// Read-only view model over the controller's message list.
#[derive(Debug, Clone)]
pub struct PresentationQueue {
    anonymous_label: String,
    messages: Vec<Message>,
    pending_scroll: Option<ScrollToLatest>,
}

impl Default for PresentationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ANONYMOUS_LABEL)
    }
}

impl PresentationQueue {
    pub fn new(anonymous_label: impl Into<String>) -> Self {
        Self {
            anonymous_label: anonymous_label.into(),
            messages: Vec::new(),
            pending_scroll: None,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: &TopicSnapshot) -> Option<ScrollToLatest> {
        let change = trailing_change(&self.messages, &snapshot.messages);
        self.messages = snapshot.messages.clone();
        if change.is_some() {
            self.pending_scroll = change;
        }
        change
    }

    /// Waits for the next list published by a controller and applies it.
    pub async fn sync(
        &mut self,
        messages: &mut watch::Receiver<TopicSnapshot>,
    ) -> ChatResult<Option<ScrollToLatest>> {
        messages
            .changed()
            .await
            .map_err(|_| {
                SnapshotFeedClosedSnafu {
                    stage: "presentation-sync",
                }
                .build()
            })?;
        let snapshot = messages.borrow_and_update().clone();
        Ok(self.apply_snapshot(&snapshot))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn rows(&self) -> Vec<MessageRow> {
        self.messages
            .iter()
            .map(|message| MessageRow {
                key: message.id,
                author: message.author_label(&self.anonymous_label).to_string(),
                text: message.text.clone(),
                timestamp: message.timestamp,
            })
            .collect()
    }

    pub fn row_keys(&self) -> Vec<RowKey> {
        self.messages.iter().map(|message| message.id).collect()
    }

    pub fn take_pending_scroll(&mut self) -> Option<ScrollToLatest> {
        self.pending_scroll.take()
    }
}

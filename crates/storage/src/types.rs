use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{EncodeDocumentSnafu, StorageResult};
use super::ids::{MessageId, TopicId};

/// Store-assigned instant in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerTimestamp(pub i64);

impl ServerTimestamp {
    pub const fn from_unix_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn unix_micros(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub text: String,
    pub author_display_name: Option<String>,
}

impl NewMessage {
    pub fn new(text: impl Into<String>, author_display_name: Option<String>) -> Self {
        Self {
            text: text.into(),
            author_display_name,
        }
    }
}

/// Acknowledgement returned by a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub topic_id: TopicId,
    pub text: String,
    pub timestamp: ServerTimestamp,
    pub author_display_name: Option<String>,
}

impl MessageRecord {
    pub fn document(&self) -> MessageDocument {
        MessageDocument {
            text: self.text.clone(),
            timestamp: self.timestamp,
            topic_id: self.topic_id,
            author_display_name: self.author_display_name.clone(),
        }
    }
}

/// Persisted message body. The record itself is addressed by `(topic_id, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDocument {
    pub text: String,
    pub timestamp: ServerTimestamp,
    pub topic_id: TopicId,
    // Legacy rows predate author binding, so the field stays optional on read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_display_name: Option<String>,
}

impl MessageDocument {
    pub fn to_json(&self, stage: &'static str) -> StorageResult<String> {
        serde_json::to_string(self).context(EncodeDocumentSnafu { stage })
    }
}

/// Raw record as handed out by a store; readers decode and may reject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub topic_id: TopicId,
    pub body: String,
}

use std::collections::HashSet;

use gallery_storage::{MessageDocument, MessageId, ServerTimestamp, StoredDocument, TopicId};

/// One decoded discussion entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub topic_id: TopicId,
    pub text: String,
    pub timestamp: ServerTimestamp,
    pub author_display_name: Option<String>,
}

/// Why a stored record was left out of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeRejection {
    InvalidId(String),
    MalformedBody(String),
    TopicMismatch { expected: TopicId, found: TopicId },
}

impl Message {
    /// Total order within a topic; the id breaks timestamp ties.
    pub fn ordering_key(&self) -> (ServerTimestamp, MessageId) {
        (self.timestamp, self.id)
    }

    pub fn author_label<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.author_display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(fallback)
    }

    pub fn decode(document: &StoredDocument, topic_id: TopicId) -> Result<Self, DecodeRejection> {
        let raw_id = document.id.trim();
        if raw_id.is_empty() {
            return Err(DecodeRejection::InvalidId(document.id.clone()));
        }
        let id = MessageId::parse(raw_id)
            .map_err(|_| DecodeRejection::InvalidId(document.id.clone()))?;

        let body: MessageDocument = serde_json::from_str(&document.body)
            .map_err(|error| DecodeRejection::MalformedBody(error.to_string()))?;

        if body.topic_id != topic_id || document.topic_id != topic_id {
            return Err(DecodeRejection::TopicMismatch {
                expected: topic_id,
                found: body.topic_id,
            });
        }

        Ok(Self {
            id,
            topic_id,
            text: body.text,
            timestamp: body.timestamp,
            author_display_name: body.author_display_name,
        })
    }
}

/// Complete, ordered content of one topic at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSnapshot {
    pub topic_id: TopicId,
    pub messages: Vec<Message>,
    /// Records that could not be decoded and were left out.
    pub dropped: usize,
}

impl TopicSnapshot {
    pub fn empty(topic_id: TopicId) -> Self {
        Self {
            topic_id,
            messages: Vec::new(),
            dropped: 0,
        }
    }

    pub fn from_documents(topic_id: TopicId, documents: &[StoredDocument]) -> Self {
        let mut dropped = 0;
        let mut messages = Vec::with_capacity(documents.len());

        for document in documents {
            match Message::decode(document, topic_id) {
                Ok(message) => messages.push(message),
                Err(rejection) => {
                    dropped += 1;
                    tracing::debug!(
                        topic_id = %topic_id,
                        document_id = %document.id,
                        ?rejection,
                        "dropping undecodable message record"
                    );
                }
            }
        }

        messages.sort_by_key(Message::ordering_key);
        let mut seen = HashSet::with_capacity(messages.len());
        messages.retain(|message| seen.insert(message.id));

        Self {
            topic_id,
            messages,
            dropped,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.messages
            .iter()
            .map(|message| message.text.as_str())
            .collect()
    }
}

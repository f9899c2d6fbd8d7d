use gallery_storage::{StorageError, TopicId};
use snafu::Snafu;

use crate::channel::ChannelRejection;
use crate::identity::AuthError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("message store call failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("active identity could not be resolved on `{stage}`: {source}"))]
    IdentityUnavailable {
        stage: &'static str,
        source: AuthError,
    },
    #[snafu(display("moderation config is invalid: {details}"))]
    InvalidModerationConfig {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to compile moderation deny-list on `{stage}`: {source}"))]
    CompileDenyList {
        stage: &'static str,
        source: regex::Error,
    },
    #[snafu(display("live channel for topic {topic_id} rejected transition: {rejection:?}"))]
    ChannelRejected {
        stage: &'static str,
        topic_id: TopicId,
        rejection: ChannelRejection,
    },
    #[snafu(display("change feed for topic {topic_id} closed"))]
    ChangeFeedClosed {
        stage: &'static str,
        topic_id: TopicId,
    },
    #[snafu(display("no tokio runtime available on `{stage}`"))]
    NoRuntime {
        stage: &'static str,
        source: tokio::runtime::TryCurrentError,
    },
    #[snafu(display("blocking store worker failed on `{stage}`: {source}"))]
    WorkerJoin {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("`{stage}` finished without reporting an outcome"))]
    CompletionDropped { stage: &'static str },
    #[snafu(display("snapshot feed closed on `{stage}`"))]
    SnapshotFeedClosed { stage: &'static str },
}

impl ChatError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_not_found())
    }

    /// Transport-level failures: the store or its change feed could not be reached.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.is_transport(),
            Self::ChangeFeedClosed { .. } => true,
            _ => false,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#![deny(unsafe_code)]

pub mod channel;
pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod moderation;
pub mod presentation;
pub mod settings;

pub use channel::{
    ChannelEvent, ChannelRejection, ChannelState, ChannelTransition, LiveChannel,
    SnapshotSubscription,
};
pub use controller::{AUDIT_TARGET, ActionOutcome, ChatController, Completion};
pub use error::{ChatError, ChatResult};
pub use identity::{
    AuthError, AuthProvider, DEFAULT_ANONYMOUS_LABEL, IdentityBinder, Session, SessionAuth,
    SessionRole,
};
pub use message::{DecodeRejection, Message, TopicSnapshot};
pub use moderation::{DEFAULT_DENY_LIST, MASK_TOKEN, ModerationFilter};
pub use presentation::{
    MessageRow, PresentationQueue, RowKey, ScrollToLatest, TrailingChange, trailing_change,
};
pub use settings::ChatSettings;

pub use gallery_storage::{
    ManualClock, MemoryMessageStore, MessageId, MessageStore, ServerClock, ServerTimestamp,
    SqliteMessageStore, StorageError, SystemClock, TopicId,
};

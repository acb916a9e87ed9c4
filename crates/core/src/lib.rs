//! Mandi Core Library
//!
//! Models, redaction, conversation lifecycle, message pipeline, read state
//! and delivery for moderated farmer/buyer deal chat.

pub mod delivery;
pub mod error;
pub mod invariants;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod read_state;
pub mod redact;
pub mod service;
pub mod storage;

pub use delivery::{DeliveryHub, SubscriberId, Subscription};
pub use error::{Error, Result};
pub use lifecycle::{CloseReason, ConversationManager, Opened, CONVERSATION_STARTED};
pub use models::*;
pub use pipeline::{
    validate_content, MessagePipeline, RedactionWarning, SendReceipt, MAX_MESSAGES_PER_CONVERSATION,
    MAX_MESSAGE_CHARS,
};
pub use read_state::ReadStateTracker;
pub use redact::{contains_sensitive, redact, Redaction, RedactionCategory};
pub use service::ChatService;
pub use storage::{
    ConversationRepository, Database, MessageRepository, SharedStore, Storage,
};

//! Error types for Mandi Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Conversation is closed and read-only")]
    ConversationClosed,

    #[error("Conversation has reached its message limit")]
    MessageLimitExceeded,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message too long: {length} characters (max {max})")]
    MessageTooLong { length: usize, max: usize },

    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    /// Another session created the conversation first. Recovered inside
    /// `ConversationManager::get_or_create` and never returned to callers.
    #[error("Conversation was created concurrently")]
    ConversationCreateRace,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Errors the user can act on, as opposed to store/transport failures
    /// that surface as a generic delivery failure.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::ConversationClosed
                | Error::MessageLimitExceeded
                | Error::EmptyMessage
                | Error::MessageTooLong { .. }
                | Error::InvalidOffer(_)
                | Error::PermissionDenied(_)
                | Error::NotFound(_)
        )
    }

    /// Stable machine-readable name used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConversationClosed => "conversation_closed",
            Error::MessageLimitExceeded => "message_limit_exceeded",
            Error::EmptyMessage => "empty_message",
            Error::MessageTooLong { .. } => "message_too_long",
            Error::InvalidOffer(_) => "invalid_offer",
            Error::ConversationCreateRace => "conversation_create_race",
            Error::PermissionDenied(_) => "permission_denied",
            Error::NotFound(_) => "not_found",
            Error::Database(_) | Error::Storage(_) | Error::Io(_) | Error::Serialization(_) => {
                "delivery_failed"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Message model for negotiation chat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConversationId, MessageId, UserId};

/// Role a message is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Farmer,
    Buyer,
    Admin,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Farmer => "farmer",
            SenderRole::Buyer => "buyer",
            SenderRole::Admin => "admin",
            SenderRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "farmer" => Some(SenderRole::Farmer),
            "buyer" => Some(SenderRole::Buyer),
            "admin" => Some(SenderRole::Admin),
            "system" => Some(SenderRole::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for SenderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kind as stored in the `message_type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Offer,
    System,
    Blocked,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Offer => "offer",
            MessageKind::System => "system",
            MessageKind::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageKind::Text),
            "offer" => Some(MessageKind::Offer),
            "system" => Some(MessageKind::System),
            "blocked" => Some(MessageKind::Blocked),
            _ => None,
        }
    }
}

/// Price terms carried by an offer message
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OfferTerms {
    pub price_per_ton: u64,
    pub quantity_tons: f64,
}

/// Kind-specific message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text {
        content: String,
    },
    Offer {
        content: String,
        terms: OfferTerms,
    },
    System {
        content: String,
    },
    /// Content had contact details removed. `original_content` is the audit
    /// copy and is only ever present in admin-facing views.
    Blocked {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_content: Option<String>,
    },
}

impl MessageBody {
    /// Displayed (post-redaction) content
    pub fn content(&self) -> &str {
        match self {
            MessageBody::Text { content }
            | MessageBody::Offer { content, .. }
            | MessageBody::System { content }
            | MessageBody::Blocked { content, .. } => content,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Offer { .. } => MessageKind::Offer,
            MessageBody::System { .. } => MessageKind::System,
            MessageBody::Blocked { .. } => MessageKind::Blocked,
        }
    }

    pub fn was_filtered(&self) -> bool {
        matches!(self, MessageBody::Blocked { .. })
    }

    pub fn original_content(&self) -> Option<&str> {
        match self {
            MessageBody::Blocked {
                original_content, ..
            } => original_content.as_deref(),
            _ => None,
        }
    }

    pub fn offer_terms(&self) -> Option<OfferTerms> {
        match self {
            MessageBody::Offer { terms, .. } => Some(*terms),
            _ => None,
        }
    }
}

/// A persisted chat message. Immutable apart from `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// 1-based insertion order within the conversation
    pub sequence: u64,
    pub sender_id: UserId,
    pub sender_role: SenderRole,
    pub body: MessageBody,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an unsaved message. The store assigns `sequence` on insert.
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_role: SenderRole,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sequence: 0,
            sender_id,
            sender_role,
            body,
            is_read: false,
            created_at,
        }
    }

    /// Build an unsaved system notice
    pub fn system(
        conversation_id: ConversationId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            conversation_id,
            UserId::from(SYSTEM_SENDER_ID),
            SenderRole::System,
            MessageBody::System {
                content: content.into(),
            },
            created_at,
        )
    }

    pub fn content(&self) -> &str {
        self.body.content()
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn was_filtered(&self) -> bool {
        self.body.was_filtered()
    }

    pub fn is_system(&self) -> bool {
        self.sender_role == SenderRole::System
    }

    /// Projection of this message for a viewer with the given role.
    /// Only admins see the unredacted audit copy.
    pub fn for_viewer(&self, viewer: SenderRole) -> Message {
        let mut view = self.clone();
        if viewer != SenderRole::Admin {
            if let MessageBody::Blocked {
                original_content, ..
            } = &mut view.body
            {
                *original_content = None;
            }
        }
        view
    }
}

/// Sender id recorded on system notices
pub const SYSTEM_SENDER_ID: &str = "system";

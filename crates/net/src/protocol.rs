//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.

use serde::{Deserialize, Serialize};

use mandi_core::{
    BidId, CloseReason, Conversation, ConversationId, DealContext, ListingId, Message,
    SenderRole, UnreadCounters, UserId,
};

/// Messages sent by a client session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Must be the first frame of every connection
    Hello { user_id: UserId, role: SenderRole },

    /// Open the conversation for a deal, creating it if needed
    Open {
        farmer_id: UserId,
        buyer_id: UserId,
        #[serde(default)]
        listing_id: Option<ListingId>,
        #[serde(default)]
        bid_id: Option<BidId>,
        #[serde(default)]
        context: Option<DealContext>,
    },

    /// Start receiving a conversation; replies with a `SyncBatch` of
    /// everything after `after_sequence`, then live `Delivered` frames
    Subscribe {
        conversation_id: ConversationId,
        #[serde(default)]
        after_sequence: u64,
    },

    Unsubscribe { conversation_id: ConversationId },

    Send {
        conversation_id: ConversationId,
        client_ref: String,
        content: String,
    },

    Offer {
        conversation_id: ConversationId,
        client_ref: String,
        price_per_ton: u64,
        quantity_tons: f64,
        #[serde(default)]
        note: Option<String>,
    },

    MarkRead { conversation_id: ConversationId },

    Close {
        conversation_id: ConversationId,
        reason: CloseReason,
    },

    /// List the conversations this user takes part in
    Inbox,

    Ping,
}

/// Messages sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome { user_id: UserId, role: SenderRole },

    Opened {
        conversation: Conversation,
        created: bool,
    },

    /// A live message on a subscribed conversation
    Delivered { message: Message },

    /// Messages missed since the sequence given in `Subscribe`
    SyncBatch {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },

    Sent {
        client_ref: String,
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },

    SendFailed {
        client_ref: String,
        reason: String,
        kind: String,
    },

    Unread {
        conversation_id: ConversationId,
        counters: UnreadCounters,
    },

    Closed {
        conversation_id: ConversationId,
        /// False if the conversation was already closed
        changed: bool,
    },

    Inbox { conversations: Vec<Conversation> },

    Error { reason: String, kind: String },

    Pong,

    /// Server is shutting down
    ServerShutdown,
}

impl ServerMessage {
    /// Error reply for a failed request. Store and transport failures are
    /// reported generically.
    pub fn error(e: &mandi_core::Error) -> Self {
        ServerMessage::Error {
            reason: describe(e),
            kind: e.kind().to_string(),
        }
    }

    pub fn send_failed(client_ref: String, e: &mandi_core::Error) -> Self {
        ServerMessage::SendFailed {
            client_ref,
            reason: describe(e),
            kind: e.kind().to_string(),
        }
    }
}

fn describe(e: &mandi_core::Error) -> String {
    if e.is_user_facing() {
        e.to_string()
    } else {
        "Message could not be delivered, please try again".to_string()
    }
}

/// Wire encoding shared by both directions
pub trait Frame: Serialize + for<'de> Deserialize<'de> {
    /// Serialize message to JSON bytes
    fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Frame for ClientMessage {}
impl Frame for ServerMessage {}

#[cfg(test)]
mod tests {
    use super::*;
    use mandi_core::Error as CoreError;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::Subscribe {
            conversation_id: ConversationId::new(),
            after_sequence: 7,
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "Subscribe");
        assert_eq!(json["after_sequence"], 7);
    }

    #[test]
    fn test_optional_fields_default() {
        let raw = br#"{"type":"Open","farmer_id":"F1","buyer_id":"B1"}"#;
        match ClientMessage::from_bytes(raw).unwrap() {
            ClientMessage::Open {
                listing_id, context, ..
            } => {
                assert!(listing_id.is_none());
                assert!(context.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        let raw = br#"{"type":"Hello","user_id":"B1","role":"buyer"}"#;
        assert!(matches!(
            ClientMessage::from_bytes(raw).unwrap(),
            ClientMessage::Hello {
                role: SenderRole::Buyer,
                ..
            }
        ));
    }

    #[test]
    fn test_close_reason_encoding() {
        let raw = br#"{"type":"Close","conversation_id":"6f1c1a52-43a4-4b8e-9a1c-2f0a4f1f3c11","reason":"deal_completed"}"#;
        assert!(matches!(
            ClientMessage::from_bytes(raw).unwrap(),
            ClientMessage::Close {
                reason: CloseReason::DealCompleted,
                ..
            }
        ));
    }

    #[test]
    fn test_internal_errors_are_generic() {
        match ServerMessage::send_failed("r1".into(), &CoreError::Storage("disk".into())) {
            ServerMessage::SendFailed { reason, kind, .. } => {
                assert_eq!(kind, "delivery_failed");
                assert!(!reason.contains("disk"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        match ServerMessage::error(&CoreError::ConversationClosed) {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, "conversation_closed"),
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}

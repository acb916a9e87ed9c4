//! Outbound message pipeline: validate, redact, persist, publish

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::delivery::DeliveryHub;
use crate::error::{Error, Result};
use crate::invariants::assert_message_invariants;
use crate::lifecycle::{authorize_participant, is_writable};
use crate::models::{
    ConversationId, Message, MessageBody, OfferTerms, SenderRole, UserId,
};
use crate::read_state::ReadStateTracker;
use crate::redact::{redact, RedactionCategory};
use crate::storage::{lock, SharedStore, Storage};

/// Hard cap on non-system messages per conversation
pub const MAX_MESSAGES_PER_CONVERSATION: u64 = 100;

/// Maximum message length, in characters, after trimming
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Transient notice for the sender when redaction changed their message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionWarning {
    pub categories: Vec<RedactionCategory>,
}

impl RedactionWarning {
    pub fn text(&self) -> &'static str {
        "Contact details were hidden from your message. Please keep the deal on the platform."
    }
}

/// Result of a successful send
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// The message as persisted
    pub message: Message,
    pub warning: Option<RedactionWarning>,
}

/// Trim and check message content. Clients may call this before sending;
/// the pipeline always re-checks.
pub fn validate_content(raw: &str) -> Result<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyMessage);
    }
    let length = trimmed.chars().count();
    if length > MAX_MESSAGE_CHARS {
        return Err(Error::MessageTooLong {
            length,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(trimmed)
}

fn validate_terms(terms: &OfferTerms) -> Result<()> {
    if terms.price_per_ton == 0 {
        return Err(Error::InvalidOffer("price per ton must be positive".into()));
    }
    if !terms.quantity_tons.is_finite() || terms.quantity_tons <= 0.0 {
        return Err(Error::InvalidOffer("quantity must be a positive number".into()));
    }
    Ok(())
}

fn offer_content(terms: &OfferTerms, note: Option<&str>) -> String {
    let base = format!(
        "Offer: {} per ton for {} t",
        terms.price_per_ton, terms.quantity_tons
    );
    match note.map(str::trim).filter(|n| !n.is_empty()) {
        Some(note) => format!("{base}. {note}"),
        None => base,
    }
}

/// Accepts outbound messages and runs them through redaction, persistence
/// and delivery
pub struct MessagePipeline<S: Storage> {
    store: SharedStore<S>,
    hub: DeliveryHub,
}

impl<S: Storage> Clone for MessagePipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            hub: self.hub.clone(),
        }
    }
}

impl<S: Storage> MessagePipeline<S> {
    pub fn new(store: SharedStore<S>, hub: DeliveryHub) -> Self {
        Self { store, hub }
    }

    /// Send a text message
    #[instrument(skip(self, raw), fields(conversation_id = %conversation_id, sender = %sender_id))]
    pub fn send(
        &self,
        conversation_id: ConversationId,
        sender_id: &UserId,
        sender_role: SenderRole,
        raw: &str,
    ) -> Result<SendReceipt> {
        self.append(conversation_id, sender_id, sender_role, || {
            Ok((validate_content(raw)?.to_string(), None))
        })
    }

    /// Send a structured price offer with an optional note.
    ///
    /// The length limit applies to the composed text, so a note near
    /// `MAX_MESSAGE_CHARS` fails with `MessageTooLong` once the terms are
    /// prefixed.
    #[instrument(skip(self, note), fields(conversation_id = %conversation_id, sender = %sender_id))]
    pub fn send_offer(
        &self,
        conversation_id: ConversationId,
        sender_id: &UserId,
        sender_role: SenderRole,
        terms: OfferTerms,
        note: Option<&str>,
    ) -> Result<SendReceipt> {
        if !matches!(sender_role, SenderRole::Farmer | SenderRole::Buyer) {
            return Err(Error::PermissionDenied(
                "only the farmer or the buyer can make offers".into(),
            ));
        }
        self.append(conversation_id, sender_id, sender_role, || {
            validate_terms(&terms)?;
            let content = offer_content(&terms, note);
            Ok((validate_content(&content)?.to_string(), Some(terms)))
        })
    }

    fn append<F>(
        &self,
        conversation_id: ConversationId,
        sender_id: &UserId,
        sender_role: SenderRole,
        compose: F,
    ) -> Result<SendReceipt>
    where
        F: FnOnce() -> Result<(String, Option<OfferTerms>)>,
    {
        // Held until the message is published so delivery order matches
        // persistence order
        let store = lock(&self.store)?;

        let conversation = store
            .find_conversation_by_id(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
        authorize_participant(&conversation, sender_id, sender_role)?;
        if !is_writable(&conversation) {
            return Err(Error::ConversationClosed);
        }

        let (content, terms) = compose()?;

        if store.count_user_messages(conversation_id)? >= MAX_MESSAGES_PER_CONVERSATION {
            warn!("Message limit reached");
            return Err(Error::MessageLimitExceeded);
        }

        let redaction = redact(&content);
        let body = if redaction.was_filtered {
            MessageBody::Blocked {
                content: redaction.sanitized,
                original_content: Some(content),
            }
        } else {
            match terms {
                Some(terms) => MessageBody::Offer { content, terms },
                None => MessageBody::Text { content },
            }
        };

        let now = Utc::now();
        let created_at = match store.last_message(conversation_id)? {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };

        let draft = Message::new(
            conversation_id,
            sender_id.clone(),
            sender_role,
            body,
            created_at,
        );
        let message = store.insert_message(&draft, MAX_MESSAGES_PER_CONVERSATION)?;
        assert_message_invariants(&message);

        let delivered = self.hub.publish(&message);
        debug!(sequence = message.sequence, delivered, "Message published");

        // The message is already persisted and delivered; a counter failure
        // must not turn the send into an error the user would retry
        if let Err(e) = ReadStateTracker::record_delivery_in(&*store, &message) {
            warn!(error = %e, "Failed to update unread counters");
        }

        let warning = if redaction.was_filtered {
            info!(categories = ?redaction.categories, "Message redacted");
            Some(RedactionWarning {
                categories: redaction.categories,
            })
        } else {
            None
        };

        Ok(SendReceipt { message, warning })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{CloseReason, ConversationManager};
    use crate::models::{ConversationKey, MessageKind};
    use crate::storage::{shared, Database, MessageRepository};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct Fixture {
        store: SharedStore<Database>,
        hub: DeliveryHub,
        manager: ConversationManager<Database>,
        pipeline: MessagePipeline<Database>,
        conversation_id: ConversationId,
    }

    fn fixture() -> Fixture {
        let store = shared(Database::open_in_memory().unwrap());
        let hub = DeliveryHub::new();
        let manager = ConversationManager::new(store.clone(), hub.clone());
        let opened = manager
            .get_or_create(
                ConversationKey::new("F1".into(), "B1".into(), Some("L1".into())),
                None,
                None,
            )
            .unwrap();
        Fixture {
            pipeline: MessagePipeline::new(store.clone(), hub.clone()),
            store,
            hub,
            manager,
            conversation_id: opened.conversation.id,
        }
    }

    fn message_count(fx: &Fixture) -> usize {
        lock(&fx.store)
            .unwrap()
            .list_messages(fx.conversation_id)
            .unwrap()
            .len()
    }

    #[test]
    fn test_plain_text_is_stored_as_text() {
        let fx = fixture();
        let receipt = fx
            .pipeline
            .send(fx.conversation_id, &"F1".into(), SenderRole::Farmer, "  price is 1500 per ton ")
            .unwrap();

        assert!(receipt.warning.is_none());
        assert_eq!(receipt.message.kind(), MessageKind::Text);
        assert_eq!(receipt.message.content(), "price is 1500 per ton");
        assert_eq!(receipt.message.sequence, 2);
    }

    #[test]
    fn test_redacted_message_keeps_audit_copy() {
        let fx = fixture();
        let receipt = fx
            .pipeline
            .send(fx.conversation_id, &"B1".into(), SenderRole::Buyer, "call me at 9876543210")
            .unwrap();

        assert_eq!(receipt.message.kind(), MessageKind::Blocked);
        assert_eq!(receipt.message.content(), "call me at [phone hidden]");
        assert_eq!(
            receipt.message.body.original_content(),
            Some("call me at 9876543210")
        );
        assert_eq!(
            receipt.warning.unwrap().categories,
            vec![RedactionCategory::Phone]
        );

        let stored = lock(&fx.store)
            .unwrap()
            .find_message_by_id(receipt.message.id)
            .unwrap()
            .unwrap();
        assert!(stored.was_filtered());
    }

    #[test]
    fn test_closed_conversation_rejects_every_send() {
        let fx = fixture();
        fx.manager
            .close(fx.conversation_id, CloseReason::DealCancelled)
            .unwrap();
        let before = message_count(&fx);

        for content in ["hello", "", "call 9876543210"] {
            let err = fx
                .pipeline
                .send(fx.conversation_id, &"F1".into(), SenderRole::Farmer, content)
                .unwrap_err();
            assert!(matches!(err, Error::ConversationClosed), "{content:?}");
        }
        assert_eq!(message_count(&fx), before);
    }

    #[test]
    fn test_message_cap() {
        let fx = fixture();
        for i in 0..MAX_MESSAGES_PER_CONVERSATION {
            let (sender, role) = if i % 2 == 0 {
                ("F1", SenderRole::Farmer)
            } else {
                ("B1", SenderRole::Buyer)
            };
            fx.pipeline
                .send(fx.conversation_id, &sender.into(), role, &format!("bid {i}"))
                .unwrap();
        }

        let err = fx
            .pipeline
            .send(fx.conversation_id, &"F1".into(), SenderRole::Farmer, "one more")
            .unwrap_err();
        assert!(matches!(err, Error::MessageLimitExceeded));
        // 100 user messages plus the start notice
        assert_eq!(message_count(&fx), 101);
    }

    #[test]
    fn test_close_on_other_connection_stops_sends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chat.db");

        // Separate connections, as two server processes would have
        let pipeline = MessagePipeline::new(
            shared(Database::open(&path).unwrap()),
            DeliveryHub::new(),
        );
        let closer = ConversationManager::new(
            shared(Database::open(&path).unwrap()),
            DeliveryHub::new(),
        );

        for round in 0..40 {
            let opened = closer
                .get_or_create(
                    ConversationKey::new(
                        "F1".into(),
                        "B1".into(),
                        Some(format!("L{round}").into()),
                    ),
                    None,
                    None,
                )
                .unwrap();
            let id = opened.conversation.id;
            let barrier = Arc::new(Barrier::new(2));

            let send = {
                let pipeline = pipeline.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pipeline.send(id, &"F1".into(), SenderRole::Farmer, "still on?")
                })
            };
            let close = {
                let closer = closer.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    closer.close(id, CloseReason::DealCancelled).unwrap()
                })
            };

            let sent = send.join().unwrap();
            let notice = close.join().unwrap().unwrap();
            match &sent {
                Ok(receipt) => assert!(receipt.message.sequence < notice.sequence),
                Err(e) => assert!(matches!(e, Error::ConversationClosed), "{e:?}"),
            }

            let messages = Database::open(&path).unwrap().list_messages(id).unwrap();
            let last = messages.last().unwrap();
            assert_eq!(last.id, notice.id, "round {round}");
            assert_eq!(messages.len(), if sent.is_ok() { 3 } else { 2 });
        }
    }

    #[test]
    fn test_content_validation() {
        let fx = fixture();
        let sender = UserId::from("F1");

        let err = fx
            .pipeline
            .send(fx.conversation_id, &sender, SenderRole::Farmer, "   \n ")
            .unwrap_err();
        assert!(matches!(err, Error::EmptyMessage));

        let exactly_max = "a".repeat(MAX_MESSAGE_CHARS);
        fx.pipeline
            .send(fx.conversation_id, &sender, SenderRole::Farmer, &exactly_max)
            .unwrap();

        let too_long = "अ".repeat(MAX_MESSAGE_CHARS + 1);
        let err = fx
            .pipeline
            .send(fx.conversation_id, &sender, SenderRole::Farmer, &too_long)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MessageTooLong {
                length: 501,
                max: 500
            }
        ));
    }

    #[test]
    fn test_sender_authorization() {
        let fx = fixture();
        let err = fx
            .pipeline
            .send(fx.conversation_id, &"B1".into(), SenderRole::Farmer, "hi")
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let err = fx
            .pipeline
            .send(fx.conversation_id, &"F1".into(), SenderRole::System, "hi")
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        fx.pipeline
            .send(fx.conversation_id, &"ops".into(), SenderRole::Admin, "please confirm")
            .unwrap();
    }

    #[test]
    fn test_unknown_conversation() {
        let fx = fixture();
        let err = fx
            .pipeline
            .send(ConversationId::new(), &"F1".into(), SenderRole::Farmer, "hi")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_offer() {
        let fx = fixture();
        let terms = OfferTerms {
            price_per_ton: 21_500,
            quantity_tons: 40.0,
        };
        let receipt = fx
            .pipeline
            .send_offer(
                fx.conversation_id,
                &"B1".into(),
                SenderRole::Buyer,
                terms,
                Some("pickup Friday"),
            )
            .unwrap();
        assert_eq!(receipt.message.body.offer_terms(), Some(terms));
        assert_eq!(
            receipt.message.content(),
            "Offer: 21500 per ton for 40 t. pickup Friday"
        );
    }

    #[test]
    fn test_offer_with_contact_in_note_is_blocked() {
        let fx = fixture();
        let terms = OfferTerms {
            price_per_ton: 21_500,
            quantity_tons: 12.5,
        };
        let receipt = fx
            .pipeline
            .send_offer(
                fx.conversation_id,
                &"F1".into(),
                SenderRole::Farmer,
                terms,
                Some("or mail me x@y.com"),
            )
            .unwrap();
        assert_eq!(receipt.message.kind(), MessageKind::Blocked);
        assert!(receipt.message.content().ends_with("[email hidden]"));
    }

    #[test]
    fn test_offer_note_counts_toward_length() {
        let fx = fixture();
        let terms = OfferTerms {
            price_per_ton: 21_500,
            quantity_tons: 40.0,
        };
        let note = "n".repeat(MAX_MESSAGE_CHARS);
        assert!(validate_content(&note).is_ok());

        let err = fx
            .pipeline
            .send_offer(
                fx.conversation_id,
                &"B1".into(),
                SenderRole::Buyer,
                terms,
                Some(&note),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { max: 500, .. }));
        assert_eq!(message_count(&fx), 1);
    }

    #[test]
    fn test_invalid_offers() {
        let fx = fixture();
        let zero_price = OfferTerms {
            price_per_ton: 0,
            quantity_tons: 1.0,
        };
        assert!(matches!(
            fx.pipeline.send_offer(
                fx.conversation_id,
                &"F1".into(),
                SenderRole::Farmer,
                zero_price,
                None
            ),
            Err(Error::InvalidOffer(_))
        ));

        let ok_terms = OfferTerms {
            price_per_ton: 100,
            quantity_tons: 1.0,
        };
        assert!(matches!(
            fx.pipeline.send_offer(
                fx.conversation_id,
                &"ops".into(),
                SenderRole::Admin,
                ok_terms,
                None
            ),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_delivery_counts_unread_for_recipient() {
        let fx = fixture();
        fx.pipeline
            .send(fx.conversation_id, &"F1".into(), SenderRole::Farmer, "fresh onions")
            .unwrap();
        let tracker = ReadStateTracker::new(fx.store.clone());
        let unread = tracker.unread_counts(fx.conversation_id).unwrap();
        assert_eq!((unread.farmer, unread.buyer), (0, 1));
    }

    #[tokio::test]
    async fn test_subscriber_sees_persisted_content() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = fx.hub.subscribe(fx.conversation_id, SenderRole::Buyer, move |m| {
            let _ = tx.send(m);
        });

        let receipt = fx
            .pipeline
            .send(fx.conversation_id, &"F1".into(), SenderRole::Farmer, "see www.x.in")
            .unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.id, receipt.message.id);
        assert_eq!(pushed.content(), receipt.message.content());
        assert_eq!(pushed.content(), "see [link hidden]");
        assert_eq!(pushed.body.original_content(), None);
    }

    #[test]
    fn test_order_matches_persistence() {
        let fx = fixture();
        for i in 0..10 {
            fx.pipeline
                .send(fx.conversation_id, &"F1".into(), SenderRole::Farmer, &format!("m{i}"))
                .unwrap();
        }
        let messages = lock(&fx.store)
            .unwrap()
            .list_messages(fx.conversation_id)
            .unwrap();
        for pair in messages.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn test_validate_content() {
        assert_eq!(validate_content("  ok  ").unwrap(), "ok");
        assert!(matches!(validate_content(""), Err(Error::EmptyMessage)));
    }
}

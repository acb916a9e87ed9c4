//! Conversation lifecycle
//!
//! Creates conversations lazily per (farmer, buyer, listing), gates writes on
//! the open/closed status and closes conversations when the deal concludes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::delivery::DeliveryHub;
use crate::error::{Error, Result};
use crate::models::{
    BidId, Conversation, ConversationId, ConversationKey, DealContext, Message, SenderRole,
    UserId,
};
use crate::storage::{lock, SharedStore, Storage};

/// Fixed notice appended when a conversation is created
pub const CONVERSATION_STARTED: &str =
    "Conversation started. Contact details are hidden automatically; keep the deal on the platform.";

/// Why a conversation was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    DealCompleted,
    DealCancelled,
}

impl CloseReason {
    pub fn notice(&self) -> &'static str {
        match self {
            CloseReason::DealCompleted => "Deal completed. This conversation is now read-only.",
            CloseReason::DealCancelled => "Deal cancelled. This conversation is now read-only.",
        }
    }
}

/// Outcome of `get_or_create`
#[derive(Debug, Clone)]
pub struct Opened {
    pub conversation: Conversation,
    /// The start notice, present only if this call created the conversation
    pub opening: Option<Message>,
}

impl Opened {
    pub fn created(&self) -> bool {
        self.opening.is_some()
    }
}

/// True iff the conversation accepts new messages
pub fn is_writable(conversation: &Conversation) -> bool {
    conversation.is_open()
}

/// Check that `user_id` acting as `role` may take part in `conversation`.
/// Admins may act on any conversation; the system role is never granted.
pub fn authorize_participant(
    conversation: &Conversation,
    user_id: &UserId,
    role: SenderRole,
) -> Result<()> {
    let allowed = match role {
        SenderRole::Farmer => *user_id == conversation.farmer_id,
        SenderRole::Buyer => *user_id == conversation.buyer_id,
        SenderRole::Admin => true,
        SenderRole::System => {
            return Err(Error::PermissionDenied(
                "the system role is reserved for automated notices".into(),
            ))
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "{} is not the {} in conversation {}",
            user_id, role, conversation.id
        )))
    }
}

/// Owns conversation creation, lookup and closing. System notices are
/// published to `hub` while the store lock is held.
pub struct ConversationManager<S: Storage> {
    store: SharedStore<S>,
    hub: DeliveryHub,
}

impl<S: Storage> Clone for ConversationManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            hub: self.hub.clone(),
        }
    }
}

impl<S: Storage> ConversationManager<S> {
    pub fn new(store: SharedStore<S>, hub: DeliveryHub) -> Self {
        Self { store, hub }
    }

    /// Return the conversation for `key`, creating it with a start notice if
    /// none exists. A concurrent creation by another session is resolved by
    /// returning the conversation that session created.
    #[instrument(skip(self, context), fields(farmer = %key.farmer_id, buyer = %key.buyer_id))]
    pub fn get_or_create(
        &self,
        key: ConversationKey,
        bid_id: Option<BidId>,
        context: Option<DealContext>,
    ) -> Result<Opened> {
        if key.farmer_id == key.buyer_id {
            return Err(Error::PermissionDenied(
                "farmer and buyer must be different participants".into(),
            ));
        }

        let store = lock(&self.store)?;
        if let Some(conversation) = store.find_conversation(&key)? {
            debug!(conversation_id = %conversation.id, "Found existing conversation");
            return Ok(Opened {
                conversation,
                opening: None,
            });
        }

        let mut conversation = Conversation::new(key.clone(), bid_id);
        if let Some(context) = context {
            conversation = conversation.with_context(context);
        }
        let opening = Message::system(
            conversation.id,
            CONVERSATION_STARTED,
            conversation.created_at,
        );

        match store.insert_conversation(&conversation, &opening) {
            Ok(opening) => {
                info!(conversation_id = %conversation.id, "Conversation created");
                self.hub.publish(&opening);
                Ok(Opened {
                    conversation,
                    opening: Some(opening),
                })
            }
            Err(Error::ConversationCreateRace) => {
                debug!("Lost conversation create race, using the winner");
                let conversation = store.find_conversation(&key)?.ok_or_else(|| {
                    warn!("Conversation missing after create race");
                    Error::Storage("conversation missing after create race".into())
                })?;
                Ok(Opened {
                    conversation,
                    opening: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Find a conversation by ID
    pub fn find(&self, id: ConversationId) -> Result<Conversation> {
        let store = lock(&self.store)?;
        store
            .find_conversation_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))
    }

    /// Close a conversation, appending a notice with the reason.
    /// Returns the notice, or None if it was already closed.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn close(&self, id: ConversationId, reason: CloseReason) -> Result<Option<Message>> {
        let store = lock(&self.store)?;
        let last = store
            .find_conversation_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))
            .and_then(|_| store.last_message(id))?;

        let created_at = match last {
            Some(last) => last.created_at.max(Utc::now()),
            None => Utc::now(),
        };
        let notice = Message::system(id, reason.notice(), created_at);
        let closed = store.close_conversation(id, &notice)?;
        match &closed {
            Some(notice) => {
                info!(?reason, "Conversation closed");
                self.hub.publish(notice);
            }
            None => debug!("Conversation already closed"),
        }
        Ok(closed)
    }

    /// Conversations a user takes part in, most recent activity first
    pub fn list_for_participant(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        lock(&self.store)?.list_conversations_for(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationStatus, ListingId, MessageKind};
    use crate::storage::{shared, ConversationRepository, Database, MessageRepository};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    fn manager() -> (ConversationManager<Database>, SharedStore<Database>) {
        let store = shared(Database::open_in_memory().unwrap());
        (
            ConversationManager::new(store.clone(), DeliveryHub::new()),
            store,
        )
    }

    fn key(listing: Option<&str>) -> ConversationKey {
        ConversationKey::new("F1".into(), "B1".into(), listing.map(ListingId::from))
    }

    #[test]
    fn test_creates_once_with_start_notice() {
        let (manager, store) = manager();

        let first = manager.get_or_create(key(Some("L1")), None, None).unwrap();
        assert!(first.created());
        assert!(is_writable(&first.conversation));

        let second = manager.get_or_create(key(Some("L1")), None, None).unwrap();
        assert!(!second.created());
        assert_eq!(second.conversation.id, first.conversation.id);

        let messages = lock(&store)
            .unwrap()
            .list_messages(first.conversation.id)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind(), MessageKind::System);
        assert_eq!(messages[0].content(), CONVERSATION_STARTED);
    }

    #[test]
    fn test_general_inquiry_is_its_own_key() {
        let (manager, _) = manager();
        let general = manager.get_or_create(key(None), None, None).unwrap();
        let listed = manager.get_or_create(key(Some("L1")), None, None).unwrap();
        assert_ne!(general.conversation.id, listed.conversation.id);

        let again = manager.get_or_create(key(None), None, None).unwrap();
        assert_eq!(again.conversation.id, general.conversation.id);
    }

    #[test]
    fn test_rejects_self_conversation() {
        let (manager, _) = manager();
        let key = ConversationKey::new("F1".into(), "F1".into(), None);
        assert!(matches!(
            manager.get_or_create(key, None, None),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_concurrent_get_or_create_yields_one_conversation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("race.db");

        // Separate connections, as two server processes would have
        let managers: Vec<_> = (0..2)
            .map(|_| {
                ConversationManager::new(
                    shared(Database::open(&path).unwrap()),
                    DeliveryHub::new(),
                )
            })
            .collect();
        let barrier = Arc::new(Barrier::new(managers.len()));

        let handles: Vec<_> = managers
            .into_iter()
            .map(|manager| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.get_or_create(key(Some("L1")), None, None).unwrap()
                })
            })
            .collect();
        let results: Vec<Opened> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results[0].conversation.id, results[1].conversation.id);
        assert_eq!(results.iter().filter(|r| r.created()).count(), 1);

        let db = Database::open(&path).unwrap();
        let messages = db.list_messages(results[0].conversation.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(db.list_conversations_for(&"F1".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_close_gates_writes() {
        let (manager, store) = manager();
        let opened = manager.get_or_create(key(Some("L1")), None, None).unwrap();
        let id = opened.conversation.id;

        let notice = manager.close(id, CloseReason::DealCompleted).unwrap();
        assert_eq!(
            notice.map(|n| n.content().to_string()),
            Some(CloseReason::DealCompleted.notice().to_string())
        );

        let conversation = manager.find(id).unwrap();
        assert_eq!(conversation.status, ConversationStatus::Closed);
        assert!(!is_writable(&conversation));

        // Second close is a no-op
        assert!(manager.close(id, CloseReason::DealCancelled).unwrap().is_none());
        assert_eq!(lock(&store).unwrap().list_messages(id).unwrap().len(), 2);
    }

    #[test]
    fn test_close_unknown_conversation() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.close(ConversationId::new(), CloseReason::DealCancelled),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_authorize_participant() {
        let conversation = Conversation::new(key(None), None);
        assert!(authorize_participant(&conversation, &"F1".into(), SenderRole::Farmer).is_ok());
        assert!(authorize_participant(&conversation, &"B1".into(), SenderRole::Buyer).is_ok());
        assert!(authorize_participant(&conversation, &"ops".into(), SenderRole::Admin).is_ok());
        assert!(authorize_participant(&conversation, &"B1".into(), SenderRole::Farmer).is_err());
        assert!(authorize_participant(&conversation, &"F1".into(), SenderRole::System).is_err());
    }
}

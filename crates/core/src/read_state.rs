//! Read/unread tracking per conversation participant

use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::invariants::assert_unread_bounds;
use crate::models::{ConversationId, Message, ParticipantSide, SenderRole, UnreadCounters, UserId};
use crate::storage::{lock, SharedStore, Storage, UnreadUpdate};

/// Maintains unread counters and read flags
pub struct ReadStateTracker<S: Storage> {
    store: SharedStore<S>,
}

impl<S: Storage> Clone for ReadStateTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Storage> ReadStateTracker<S> {
    pub fn new(store: SharedStore<S>) -> Self {
        Self { store }
    }

    /// Mark everything the reader did not send as read and zero the reader's
    /// unread counter. Calling it again with nothing new is a no-op.
    /// Returns the number of messages newly marked read.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, reader = %reader_id))]
    pub fn mark_read(&self, conversation_id: ConversationId, reader_id: &UserId) -> Result<usize> {
        let store = lock(&self.store)?;
        let conversation = store
            .find_conversation_by_id(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
        let side = conversation.side_of(reader_id).ok_or_else(|| {
            Error::PermissionDenied(format!(
                "{} is not a participant in conversation {}",
                reader_id, conversation_id
            ))
        })?;

        let marked = store.mark_conversation_read(conversation_id, reader_id, side)?;
        if marked > 0 {
            debug!(marked, "Messages marked read");
        }
        Ok(marked)
    }

    /// Count a delivered message against the recipient's unread counter
    pub fn record_delivery(&self, message: &Message) -> Result<()> {
        let store = lock(&self.store)?;
        Self::record_delivery_in(&*store, message)
    }

    /// Counter update for a delivered message, for callers already holding
    /// the store lock
    pub(crate) fn record_delivery_in(store: &S, message: &Message) -> Result<()> {
        for side in recipients(message.sender_role) {
            store.update_unread_counter(message.conversation_id, *side, UnreadUpdate::Increment)?;
        }
        if cfg!(debug_assertions) {
            if let Some(conversation) = store.find_conversation_by_id(message.conversation_id)? {
                let user_messages = store.count_user_messages(message.conversation_id)?;
                assert_unread_bounds(&conversation, user_messages);
            }
        }
        Ok(())
    }

    /// Current unread counters for a conversation
    pub fn unread_counts(&self, conversation_id: ConversationId) -> Result<UnreadCounters> {
        let store = lock(&self.store)?;
        store
            .find_conversation_by_id(conversation_id)?
            .map(|c| c.unread)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))
    }
}

/// Sides whose unread counter a message from `role` increments
fn recipients(role: SenderRole) -> &'static [ParticipantSide] {
    match role {
        SenderRole::Farmer => &[ParticipantSide::Buyer],
        SenderRole::Buyer => &[ParticipantSide::Farmer],
        SenderRole::Admin => &[ParticipantSide::Farmer, ParticipantSide::Buyer],
        SenderRole::System => &[],
    }
}

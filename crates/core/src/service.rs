//! Chat aggregate
//!
//! Ties the lifecycle manager, message pipeline, read-state tracker and
//! delivery hub together over one shared store. This is the surface the
//! network layer talks to.

use tracing::{debug, instrument};

use crate::delivery::{DeliveryHub, Subscription};
use crate::error::{Error, Result};
use crate::invariants::assert_sequence_order;
use crate::lifecycle::{authorize_participant, CloseReason, ConversationManager, Opened};
use crate::models::{
    BidId, Conversation, ConversationId, ConversationKey, DealContext, Message, OfferTerms,
    SenderRole, UnreadCounters, UserId,
};
use crate::pipeline::{MessagePipeline, SendReceipt};
use crate::read_state::ReadStateTracker;
use crate::storage::{lock, shared, SharedStore, Storage};

pub struct ChatService<S: Storage> {
    store: SharedStore<S>,
    hub: DeliveryHub,
    conversations: ConversationManager<S>,
    pipeline: MessagePipeline<S>,
    read_state: ReadStateTracker<S>,
}

impl<S: Storage> Clone for ChatService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            hub: self.hub.clone(),
            conversations: self.conversations.clone(),
            pipeline: self.pipeline.clone(),
            read_state: self.read_state.clone(),
        }
    }
}

impl<S: Storage> ChatService<S> {
    pub fn new(store: S) -> Self {
        Self::from_shared(shared(store))
    }

    pub fn from_shared(store: SharedStore<S>) -> Self {
        let hub = DeliveryHub::new();
        Self {
            conversations: ConversationManager::new(store.clone(), hub.clone()),
            pipeline: MessagePipeline::new(store.clone(), hub.clone()),
            read_state: ReadStateTracker::new(store.clone()),
            store,
            hub,
        }
    }

    pub fn hub(&self) -> &DeliveryHub {
        &self.hub
    }

    /// Open (or reopen the existing) conversation for a deal
    pub fn open(
        &self,
        key: ConversationKey,
        bid_id: Option<BidId>,
        context: Option<DealContext>,
    ) -> Result<Opened> {
        self.conversations.get_or_create(key, bid_id, context)
    }

    /// Fetch a conversation the viewer is allowed to see
    pub fn conversation(
        &self,
        conversation_id: ConversationId,
        viewer_id: &UserId,
        viewer_role: SenderRole,
    ) -> Result<Conversation> {
        let conversation = self.conversations.find(conversation_id)?;
        authorize_participant(&conversation, viewer_id, viewer_role)?;
        Ok(conversation)
    }

    pub fn close(
        &self,
        conversation_id: ConversationId,
        reason: CloseReason,
    ) -> Result<Option<Message>> {
        self.conversations.close(conversation_id, reason)
    }

    pub fn send(
        &self,
        conversation_id: ConversationId,
        sender_id: &UserId,
        sender_role: SenderRole,
        content: &str,
    ) -> Result<SendReceipt> {
        self.pipeline.send(conversation_id, sender_id, sender_role, content)
    }

    pub fn send_offer(
        &self,
        conversation_id: ConversationId,
        sender_id: &UserId,
        sender_role: SenderRole,
        terms: OfferTerms,
        note: Option<&str>,
    ) -> Result<SendReceipt> {
        self.pipeline
            .send_offer(conversation_id, sender_id, sender_role, terms, note)
    }

    pub fn mark_read(&self, conversation_id: ConversationId, reader_id: &UserId) -> Result<usize> {
        self.read_state.mark_read(conversation_id, reader_id)
    }

    pub fn unread_counts(&self, conversation_id: ConversationId) -> Result<UnreadCounters> {
        self.read_state.unread_counts(conversation_id)
    }

    /// Conversations a user takes part in, most recent activity first
    pub fn inbox(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        self.conversations.list_for_participant(user_id)
    }

    /// Every message after `after_sequence`, as the viewer may see it
    pub fn messages_since(
        &self,
        conversation_id: ConversationId,
        viewer_id: &UserId,
        viewer_role: SenderRole,
        after_sequence: u64,
    ) -> Result<Vec<Message>> {
        let store = lock(&self.store)?;
        Self::backlog_in(&*store, conversation_id, viewer_id, viewer_role, after_sequence)
    }

    /// Full history as the viewer may see it
    pub fn history(
        &self,
        conversation_id: ConversationId,
        viewer_id: &UserId,
        viewer_role: SenderRole,
    ) -> Result<Vec<Message>> {
        self.messages_since(conversation_id, viewer_id, viewer_role, 0)
    }

    /// Attach `handler` to a conversation after handing everything persisted
    /// after `after_sequence` to `on_backlog`. Both run under the store lock
    /// and publishing needs that lock too, so every message lands in exactly
    /// one of the backlog or the live stream, and the backlog comes first.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(
        skip(self, on_backlog, handler),
        fields(conversation_id = %conversation_id, viewer = %viewer_id)
    )]
    pub fn subscribe<B, F>(
        &self,
        conversation_id: ConversationId,
        viewer_id: &UserId,
        viewer_role: SenderRole,
        after_sequence: u64,
        on_backlog: B,
        handler: F,
    ) -> Result<Subscription>
    where
        B: FnOnce(Vec<Message>),
        F: FnMut(Message) + Send + 'static,
    {
        let store = lock(&self.store)?;
        let backlog =
            Self::backlog_in(&*store, conversation_id, viewer_id, viewer_role, after_sequence)?;
        debug!(backlog = backlog.len(), "Subscribing");
        on_backlog(backlog);
        Ok(self.hub.subscribe(conversation_id, viewer_role, handler))
    }

    fn backlog_in(
        store: &S,
        conversation_id: ConversationId,
        viewer_id: &UserId,
        viewer_role: SenderRole,
        after_sequence: u64,
    ) -> Result<Vec<Message>> {
        let conversation = store
            .find_conversation_by_id(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
        authorize_participant(&conversation, viewer_id, viewer_role)?;

        let messages = store.list_messages_since(conversation_id, after_sequence)?;
        assert_sequence_order(&messages);
        Ok(messages.iter().map(|m| m.for_viewer(viewer_role)).collect())
    }
}

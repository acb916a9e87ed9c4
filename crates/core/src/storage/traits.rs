//! Storage repository traits
//!
//! These traits define the persistence interface the chat core depends on,
//! allowing for different implementations (SQLite, mock, remote store).

use crate::error::Result;
use crate::models::{
    Conversation, ConversationId, ConversationKey, ConversationStatus, Message, MessageId,
    ParticipantSide, UserId,
};
use crate::storage::UnreadUpdate;

/// Conversation repository operations
pub trait ConversationRepository {
    /// Find a conversation by its (farmer, buyer, listing) key
    fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>>;

    /// Find a conversation by ID
    fn find_conversation_by_id(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// Insert a conversation together with its opening notice, atomically.
    /// Fails with `Error::ConversationCreateRace` if the key already exists.
    fn insert_conversation(&self, conversation: &Conversation, opening: &Message)
        -> Result<Message>;

    /// Conditionally change status; false if the current status is not `from`
    fn update_conversation_status(
        &self,
        id: ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> Result<bool>;

    /// Close an open conversation and append a notice, atomically.
    /// Returns None if the conversation was not open.
    fn close_conversation(&self, id: ConversationId, notice: &Message) -> Result<Option<Message>>;

    /// Increment or reset one side's unread counter
    fn update_unread_counter(
        &self,
        id: ConversationId,
        side: ParticipantSide,
        update: UnreadUpdate,
    ) -> Result<()>;

    /// Mark messages from others read and reset the reader's counter,
    /// atomically. Returns the number of messages marked.
    fn mark_conversation_read(
        &self,
        id: ConversationId,
        reader: &UserId,
        side: ParticipantSide,
    ) -> Result<usize>;

    /// Conversations a user takes part in, most recent activity first
    fn list_conversations_for(&self, user_id: &UserId) -> Result<Vec<Conversation>>;
}

/// Message repository operations
pub trait MessageRepository {
    /// Append a message; returns it with its assigned sequence.
    ///
    /// The conversation must still be open, and a non-system message is
    /// refused once `max_user_messages` non-system messages exist. Both are
    /// checked in the same write transaction as the insert.
    fn insert_message(&self, message: &Message, max_user_messages: u64) -> Result<Message>;

    /// Find message by ID
    fn find_message_by_id(&self, id: MessageId) -> Result<Option<Message>>;

    /// All messages in a conversation, in creation order
    fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    /// Messages persisted after `after_sequence`, in creation order
    fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        after_sequence: u64,
    ) -> Result<Vec<Message>>;

    /// Most recent message
    fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>>;

    /// Number of non-system messages
    fn count_user_messages(&self, conversation_id: ConversationId) -> Result<u64>;

    /// Mark messages not sent by `except_sender` as read
    fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        except_sender: &UserId,
    ) -> Result<usize>;
}

/// Combined storage interface
///
/// Provides access to all repository operations.
/// Implementations may be backed by SQLite, mocks, or network.
pub trait Storage: ConversationRepository + MessageRepository {}

// Blanket implementation: any type implementing all traits implements Storage
impl<T> Storage for T where T: ConversationRepository + MessageRepository {}

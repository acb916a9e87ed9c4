//! SQLite storage layer for Mandi

mod conversations;
mod messages;
mod migrations;
mod parse;
mod traits;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::models::{
    Conversation, ConversationId, ConversationKey, ConversationStatus, Message, MessageId,
    ParticipantSide, SenderRole, UserId,
};

pub use conversations::{ConversationStore, UnreadUpdate};
pub use messages::MessageStore;
pub use traits::{ConversationRepository, MessageRepository, Storage};

/// Default time a connection waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store handle shared by the chat services. The mutex serializes every
/// read-check-write sequence issued from this process.
pub type SharedStore<S> = Arc<Mutex<S>>;

/// Wrap a store for sharing between services
pub fn shared<S: Storage>(store: S) -> SharedStore<S> {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store, mapping poisoning to a storage error
pub fn lock<S>(store: &SharedStore<S>) -> Result<MutexGuard<'_, S>> {
    store
        .lock()
        .map_err(|_| Error::Storage("store lock poisoned".into()))
}

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create database, waiting up to `busy_timeout` on locks held
    /// by other connections
    pub fn open_with_busy_timeout<P: AsRef<Path>>(
        path: P,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    /// Get conversation store
    pub fn conversations(&self) -> ConversationStore<'_> {
        ConversationStore::new(&self.conn)
    }

    /// Get message store
    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(&self.conn)
    }

    /// Begin a write transaction that takes the database write lock up front
    fn write_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

// Implement repository traits for Database
// This enables using Database through the trait interface

impl ConversationRepository for Database {
    fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.conversations().find_by_key(key)
    }

    fn find_conversation_by_id(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.conversations().find_by_id(id)
    }

    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    fn insert_conversation(
        &self,
        conversation: &Conversation,
        opening: &Message,
    ) -> Result<Message> {
        let tx = self.write_transaction()?;
        ConversationStore::new(&tx).create(conversation)?;
        let sequence = MessageStore::new(&tx).create(opening)?;
        tx.commit()?;
        debug!("Conversation inserted");
        Ok(Message {
            sequence,
            ..opening.clone()
        })
    }

    fn update_conversation_status(
        &self,
        id: ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> Result<bool> {
        self.conversations().update_status(id, from, to)
    }

    #[instrument(skip(self, notice), fields(conversation_id = %id))]
    fn close_conversation(&self, id: ConversationId, notice: &Message) -> Result<Option<Message>> {
        let tx = self.write_transaction()?;
        let closed = ConversationStore::new(&tx).update_status(
            id,
            ConversationStatus::Open,
            ConversationStatus::Closed,
        )?;
        if !closed {
            // Dropping the transaction rolls it back
            return Ok(None);
        }
        let sequence = MessageStore::new(&tx).create(notice)?;
        tx.commit()?;
        Ok(Some(Message {
            sequence,
            ..notice.clone()
        }))
    }

    fn update_unread_counter(
        &self,
        id: ConversationId,
        side: ParticipantSide,
        update: UnreadUpdate,
    ) -> Result<()> {
        self.conversations().update_unread(id, side, update)
    }

    #[instrument(skip(self, reader), fields(conversation_id = %id, reader = %reader))]
    fn mark_conversation_read(
        &self,
        id: ConversationId,
        reader: &UserId,
        side: ParticipantSide,
    ) -> Result<usize> {
        let tx = self.write_transaction()?;
        let marked = MessageStore::new(&tx).mark_read_except(id, reader)?;
        ConversationStore::new(&tx).update_unread(id, side, UnreadUpdate::Reset)?;
        tx.commit()?;
        Ok(marked)
    }

    fn list_conversations_for(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        self.conversations().list_for_participant(user_id)
    }
}

impl MessageRepository for Database {
    #[instrument(skip_all, fields(conversation_id = %message.conversation_id))]
    fn insert_message(&self, message: &Message, max_user_messages: u64) -> Result<Message> {
        let tx = self.write_transaction()?;
        let conversation = ConversationStore::new(&tx)
            .find_by_id(message.conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", message.conversation_id)))?;
        if conversation.status != ConversationStatus::Open {
            return Err(Error::ConversationClosed);
        }
        let messages = MessageStore::new(&tx);
        if message.sender_role != SenderRole::System
            && messages.count_non_system(message.conversation_id)? >= max_user_messages
        {
            return Err(Error::MessageLimitExceeded);
        }
        let sequence = messages.create(message)?;
        ConversationStore::new(&tx).touch(message.conversation_id, message.created_at)?;
        tx.commit()?;
        Ok(Message {
            sequence,
            ..message.clone()
        })
    }

    fn find_message_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        self.messages().find_by_id(id)
    }

    fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.messages().list(conversation_id)
    }

    fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        after_sequence: u64,
    ) -> Result<Vec<Message>> {
        self.messages().list_since(conversation_id, after_sequence)
    }

    fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        self.messages().last(conversation_id)
    }

    fn count_user_messages(&self, conversation_id: ConversationId) -> Result<u64> {
        self.messages().count_non_system(conversation_id)
    }

    fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        except_sender: &UserId,
    ) -> Result<usize> {
        self.messages().mark_read_except(conversation_id, except_sender)
    }
}

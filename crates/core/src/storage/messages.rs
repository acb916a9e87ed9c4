//! Message storage operations

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::models::{
    ConversationId, Message, MessageBody, MessageId, MessageKind, OfferTerms, SenderRole, UserId,
};
use crate::storage::parse::{
    format_datetime, parse_datetime, parse_kind, parse_role, parse_uuid, OptionalExt,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sequence, sender_id, sender_role,
    message_type, content, original_content, offer_price, offer_quantity, is_read, created_at";

pub struct MessageStore<'a> {
    conn: &'a Connection,
}

impl<'a> MessageStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a message and return the sequence number it was given.
    ///
    /// The sequence is computed inside the INSERT so concurrent writers on
    /// other connections cannot hand out the same number.
    pub fn create(&self, message: &Message) -> Result<u64> {
        let terms = message.body.offer_terms();
        self.conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence, sender_id, sender_role,
                message_type, content, original_content, was_filtered, offer_price,
                offer_quantity, is_read, created_at)
             SELECT ?1, ?2, COALESCE(MAX(sequence), 0) + 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
             FROM messages WHERE conversation_id = ?2",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id.as_str(),
                message.sender_role.as_str(),
                message.kind().as_str(),
                message.content(),
                message.body.original_content(),
                message.was_filtered() as i32,
                terms.map(|t| t.price_per_ton),
                terms.map(|t| t.quantity_tons),
                message.is_read as i32,
                format_datetime(message.created_at),
            ],
        )?;

        let sequence = self.conn.query_row(
            "SELECT sequence FROM messages WHERE id = ?1",
            params![message.id.to_string()],
            |row| row.get(0),
        )?;
        Ok(sequence)
    }

    /// Get message by ID
    pub fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let message = self
            .conn
            .query_row(&sql, params![id.to_string()], map_message)
            .optional()?;
        Ok(message)
    }

    /// All messages in a conversation, oldest first
    pub fn list(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.list_since(conversation_id, 0)
    }

    /// Messages with a sequence greater than `after_sequence`, oldest first
    pub fn list_since(
        &self,
        conversation_id: ConversationId,
        after_sequence: u64,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let messages = stmt
            .query_map(
                params![conversation_id.to_string(), after_sequence],
                map_message,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Most recent message in a conversation
    pub fn last(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY sequence DESC LIMIT 1"
        );
        let message = self
            .conn
            .query_row(&sql, params![conversation_id.to_string()], map_message)
            .optional()?;
        Ok(message)
    }

    /// Count messages that were not posted by the system
    pub fn count_non_system(&self, conversation_id: ConversationId) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND sender_role != ?2",
            params![conversation_id.to_string(), SenderRole::System.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Mark every unread message not sent by `reader` as read.
    /// Returns the number of messages that changed.
    pub fn mark_read_except(
        &self,
        conversation_id: ConversationId,
        reader: &UserId,
    ) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
            params![conversation_id.to_string(), reader.as_str()],
        )?;
        Ok(changed)
    }
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind = parse_kind(&row.get::<_, String>(5)?)?;
    let content: String = row.get(6)?;
    let body = match kind {
        MessageKind::Text => MessageBody::Text { content },
        MessageKind::System => MessageBody::System { content },
        MessageKind::Blocked => MessageBody::Blocked {
            content,
            original_content: row.get(7)?,
        },
        MessageKind::Offer => {
            let price: Option<u64> = row.get(8)?;
            let quantity: Option<f64> = row.get(9)?;
            match (price, quantity) {
                (Some(price_per_ton), Some(quantity_tons)) => MessageBody::Offer {
                    content,
                    terms: OfferTerms {
                        price_per_ton,
                        quantity_tons,
                    },
                },
                _ => {
                    return Err(rusqlite::Error::FromSqlConversionFailure(
                        8,
                        Type::Null,
                        "offer message without terms".into(),
                    ))
                }
            }
        }
    };

    Ok(Message {
        id: MessageId(parse_uuid(&row.get::<_, String>(0)?)?),
        conversation_id: ConversationId(parse_uuid(&row.get::<_, String>(1)?)?),
        sequence: row.get(2)?,
        sender_id: UserId(row.get(3)?),
        sender_role: parse_role(&row.get::<_, String>(4)?)?,
        body,
        is_read: row.get::<_, i32>(10)? != 0,
        created_at: parse_datetime(&row.get::<_, String>(11)?)?,
    })
}

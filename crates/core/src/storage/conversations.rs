//! Conversation storage operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{
    BidId, Conversation, ConversationId, ConversationKey, ConversationStatus, ListingId,
    ParticipantSide, UnreadCounters, UserId,
};
use crate::storage::parse::{
    format_datetime, is_unique_violation, parse_datetime, parse_json_opt, parse_status,
    parse_uuid, OptionalExt,
};

const CONVERSATION_COLUMNS: &str = "id, farmer_id, buyer_id, listing_id, bid_id, status,
    farmer_unread, buyer_unread, context, created_at, updated_at";

/// Adjustment applied to one side's unread counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadUpdate {
    Increment,
    Reset,
}

pub struct ConversationStore<'a> {
    conn: &'a Connection,
}

impl<'a> ConversationStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new conversation. A key collision maps to
    /// `Error::ConversationCreateRace`.
    pub fn create(&self, conversation: &Conversation) -> Result<()> {
        let context = conversation
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = self.conn.execute(
            "INSERT INTO conversations (id, farmer_id, buyer_id, listing_id, bid_id, status,
                farmer_unread, buyer_unread, context, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                conversation.id.to_string(),
                conversation.farmer_id.as_str(),
                conversation.buyer_id.as_str(),
                conversation.listing_id.as_ref().map(|l| l.as_str()),
                conversation.bid_id.as_ref().map(|b| b.as_str()),
                conversation.status.as_str(),
                conversation.unread.farmer,
                conversation.unread.buyer,
                context,
                format_datetime(conversation.created_at),
                format_datetime(conversation.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::ConversationCreateRace),
            Err(e) => Err(e.into()),
        }
    }

    /// Find a conversation by its uniqueness key
    pub fn find_by_key(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE farmer_id = ?1 AND buyer_id = ?2 AND IFNULL(listing_id, '') = IFNULL(?3, '')"
        );
        let conversation = self
            .conn
            .query_row(
                &sql,
                params![
                    key.farmer_id.as_str(),
                    key.buyer_id.as_str(),
                    key.listing_id.as_ref().map(|l| l.as_str()),
                ],
                map_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    /// Find a conversation by ID
    pub fn find_by_id(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
        let conversation = self
            .conn
            .query_row(&sql, params![id.to_string()], map_conversation)
            .optional()?;
        Ok(conversation)
    }

    /// Conditionally move a conversation from `from` to `to`.
    /// Returns false if the conversation was not in `from`.
    pub fn update_status(
        &self,
        id: ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                to.as_str(),
                format_datetime(Utc::now()),
                id.to_string(),
                from.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Apply an unread counter update in a single statement
    pub fn update_unread(
        &self,
        id: ConversationId,
        side: ParticipantSide,
        update: UnreadUpdate,
    ) -> Result<()> {
        let sql = match (side, update) {
            (ParticipantSide::Farmer, UnreadUpdate::Increment) => {
                "UPDATE conversations SET farmer_unread = farmer_unread + 1 WHERE id = ?1"
            }
            (ParticipantSide::Buyer, UnreadUpdate::Increment) => {
                "UPDATE conversations SET buyer_unread = buyer_unread + 1 WHERE id = ?1"
            }
            (ParticipantSide::Farmer, UnreadUpdate::Reset) => {
                "UPDATE conversations SET farmer_unread = 0 WHERE id = ?1 AND farmer_unread != 0"
            }
            (ParticipantSide::Buyer, UnreadUpdate::Reset) => {
                "UPDATE conversations SET buyer_unread = 0 WHERE id = ?1 AND buyer_unread != 0"
            }
        };
        self.conn.execute(sql, params![id.to_string()])?;
        Ok(())
    }

    /// Bump the activity timestamp used for inbox ordering
    pub fn touch(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2 AND updated_at < ?1",
            params![format_datetime(at), id.to_string()],
        )?;
        Ok(())
    }

    /// List conversations a user takes part in, most recent activity first
    pub fn list_for_participant(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE farmer_id = ?1 OR buyer_id = ?1
             ORDER BY updated_at DESC, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let conversations = stmt
            .query_map(params![user_id.as_str()], map_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conversations)
    }
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(parse_uuid(&row.get::<_, String>(0)?)?),
        farmer_id: UserId(row.get(1)?),
        buyer_id: UserId(row.get(2)?),
        listing_id: row.get::<_, Option<String>>(3)?.map(ListingId),
        bid_id: row.get::<_, Option<String>>(4)?.map(BidId),
        status: parse_status(&row.get::<_, String>(5)?)?,
        unread: UnreadCounters {
            farmer: row.get(6)?,
            buyer: row.get(7)?,
        },
        context: parse_json_opt(row.get(8)?)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?)?,
        updated_at: parse_datetime(&row.get::<_, String>(10)?)?,
    })
}

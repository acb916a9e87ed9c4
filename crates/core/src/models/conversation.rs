//! Conversation model - one negotiation thread between a farmer and a buyer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BidId, ConversationId, ListingId, UserId};

/// Uniqueness key of a conversation. An absent listing is a general inquiry
/// and still collides with other general inquiries between the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub farmer_id: UserId,
    pub buyer_id: UserId,
    pub listing_id: Option<ListingId>,
}

impl ConversationKey {
    pub fn new(farmer_id: UserId, buyer_id: UserId, listing_id: Option<ListingId>) -> Self {
        Self {
            farmer_id,
            buyer_id,
            listing_id,
        }
    }
}

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ConversationStatus::Open),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the deal a participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantSide {
    Farmer,
    Buyer,
}

impl ParticipantSide {
    pub fn counterpart(self) -> Self {
        match self {
            ParticipantSide::Farmer => ParticipantSide::Buyer,
            ParticipantSide::Buyer => ParticipantSide::Farmer,
        }
    }
}

/// Unread message counters, one per side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounters {
    pub farmer: u32,
    pub buyer: u32,
}

impl UnreadCounters {
    pub fn for_side(&self, side: ParticipantSide) -> u32 {
        match side {
            ParticipantSide::Farmer => self.farmer,
            ParticipantSide::Buyer => self.buyer,
        }
    }
}

/// Display-only deal details attached when the conversation is opened
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealContext {
    pub crop: String,
    pub quantity_tons: f64,
    pub price_per_ton: u64,
    pub location: String,
    #[serde(default)]
    pub bid_amount: Option<u64>,
}

/// A negotiation conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub farmer_id: UserId,
    pub buyer_id: UserId,
    pub listing_id: Option<ListingId>,
    pub bid_id: Option<BidId>,
    pub status: ConversationStatus,
    pub unread: UnreadCounters,
    pub context: Option<DealContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(key: ConversationKey, bid_id: Option<BidId>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            farmer_id: key.farmer_id,
            buyer_id: key.buyer_id,
            listing_id: key.listing_id,
            bid_id,
            status: ConversationStatus::Open,
            unread: UnreadCounters::default(),
            context: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_context(mut self, context: DealContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(
            self.farmer_id.clone(),
            self.buyer_id.clone(),
            self.listing_id.clone(),
        )
    }

    pub fn is_open(&self) -> bool {
        self.status == ConversationStatus::Open
    }

    /// Side of the deal `user_id` is on, if a participant at all
    pub fn side_of(&self, user_id: &UserId) -> Option<ParticipantSide> {
        if *user_id == self.farmer_id {
            Some(ParticipantSide::Farmer)
        } else if *user_id == self.buyer_id {
            Some(ParticipantSide::Buyer)
        } else {
            None
        }
    }

    pub fn participant(&self, side: ParticipantSide) -> &UserId {
        match side {
            ParticipantSide::Farmer => &self.farmer_id,
            ParticipantSide::Buyer => &self.buyer_id,
        }
    }
}

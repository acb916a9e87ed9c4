//! Data models for Mandi negotiation chat

mod conversation;
mod ids;
mod message;

pub use conversation::*;
pub use ids::*;
pub use message::*;

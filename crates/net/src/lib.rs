//! Mandi Network Library
//!
//! Exposes the chat service to client sessions over TCP.
//!
//! # Architecture
//!
//! - **Server**: Owns a `ChatService`, one session per connection
//! - **Client**: One user session, tracks sync position per conversation
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(ServerConfig::default(), service).await?;
//!
//! let mut client = Client::connect(server.addr(), "F1".into(), SenderRole::Farmer).await?;
//! client.subscribe(conversation_id).await?;
//!
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         ClientEvent::Message(msg) => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientEvent, ConnectionState};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{Server, ServerConfig};

/// Default port for Mandi servers
pub const DEFAULT_PORT: u16 = 7440;

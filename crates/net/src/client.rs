//! TCP client for a chat session
//!
//! Tracks the last sequence seen per conversation so a reconnecting client
//! asks only for what it missed, drops duplicate deliveries, and marks
//! incoming messages read for conversations the user has focused.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use mandi_core::{
    BidId, CloseReason, Conversation, ConversationId, DealContext, ListingId, Message,
    OfferTerms, SenderRole, UnreadCounters, UserId,
};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ClientMessage, ServerMessage};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Event received from the server
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Opened {
        conversation: Conversation,
        created: bool,
    },
    /// A message not seen before, from the backlog or the live stream
    Message(Message),
    /// Backlog for a subscription has been fully replayed
    Synced {
        conversation_id: ConversationId,
        count: usize,
    },
    Sent {
        client_ref: String,
        message: Message,
        warning: Option<String>,
    },
    SendFailed {
        client_ref: String,
        reason: String,
        kind: String,
    },
    Unread {
        conversation_id: ConversationId,
        counters: UnreadCounters,
    },
    Closed {
        conversation_id: ConversationId,
        changed: bool,
    },
    Inbox(Vec<Conversation>),
    Error {
        reason: String,
        kind: String,
    },
    /// Connection lost
    Disconnected,
    /// Server is shutting down
    ServerShutdown,
}

struct ClientState {
    connection: ConnectionState,
    user_id: UserId,
    role: SenderRole,
    /// Highest sequence seen per conversation
    last_seen: HashMap<ConversationId, u64>,
    subscribed: HashSet<ConversationId>,
    focused: HashSet<ConversationId>,
}

impl ClientState {
    /// Record a message; false if it was already seen
    fn observe(&mut self, message: &Message) -> bool {
        let last = self.last_seen.entry(message.conversation_id).or_insert(0);
        if message.sequence <= *last {
            return false;
        }
        *last = message.sequence;
        true
    }

    fn wants_mark_read(&self, message: &Message) -> bool {
        self.focused.contains(&message.conversation_id)
            && message.sender_id != self.user_id
            && matches!(self.role, SenderRole::Farmer | SenderRole::Buyer)
    }
}

enum ClientCommand {
    Send(ClientMessage),
    Disconnect,
}

/// Client handle for network operations
pub struct Client {
    state: Arc<RwLock<ClientState>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl Client {
    /// Connect and identify as `user_id` acting as `role`
    pub async fn connect(addr: SocketAddr, user_id: UserId, role: SenderRole) -> Result<Self> {
        let state = ClientState {
            connection: ConnectionState::Connected,
            user_id,
            role,
            last_seen: HashMap::new(),
            subscribed: HashSet::new(),
            focused: HashSet::new(),
        };
        Self::establish(addr, state).await
    }

    /// Drop this connection and open a new one, re-subscribing to every
    /// conversation from the last sequence seen
    pub async fn reconnect(self, addr: SocketAddr) -> Result<Self> {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
        let state = {
            let s = self.state.read().await;
            ClientState {
                connection: ConnectionState::Connected,
                user_id: s.user_id.clone(),
                role: s.role,
                last_seen: s.last_seen.clone(),
                subscribed: s.subscribed.clone(),
                focused: s.focused.clone(),
            }
        };
        let client = Self::establish(addr, state).await?;

        let resume: Vec<_> = client.state.read().await.subscribed.iter().copied().collect();
        for conversation_id in resume {
            client.subscribe(conversation_id).await?;
        }
        Ok(client)
    }

    async fn establish(addr: SocketAddr, state: ClientState) -> Result<Self> {
        info!(addr = %addr, user_id = %state.user_id, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let hello = ClientMessage::Hello {
            user_id: state.user_id.clone(),
            role: state.role,
        };
        write_frame(&mut writer, &hello).await?;

        let welcome: ServerMessage = read_frame(&mut reader).await?;
        match welcome {
            ServerMessage::Welcome { .. } => debug!("Session accepted"),
            ServerMessage::Error { reason, .. } => return Err(Error::Rejected(reason)),
            other => {
                return Err(Error::Protocol(format!(
                    "Expected Welcome, got {:?}",
                    other
                )))
            }
        }

        let state = Arc::new(RwLock::new(state));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            reader,
            writer,
            state.clone(),
            event_tx,
            cmd_rx,
        ));

        Ok(Client {
            state,
            event_rx,
            cmd_tx,
        })
    }

    /// Get the next server event
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn open(
        &self,
        farmer_id: UserId,
        buyer_id: UserId,
        listing_id: Option<ListingId>,
        bid_id: Option<BidId>,
        context: Option<DealContext>,
    ) -> Result<()> {
        self.send(ClientMessage::Open {
            farmer_id,
            buyer_id,
            listing_id,
            bid_id,
            context,
        })
        .await
    }

    /// Subscribe from the last sequence seen
    pub async fn subscribe(&self, conversation_id: ConversationId) -> Result<()> {
        let after_sequence = {
            let mut s = self.state.write().await;
            s.subscribed.insert(conversation_id);
            s.last_seen.get(&conversation_id).copied().unwrap_or(0)
        };
        self.send(ClientMessage::Subscribe {
            conversation_id,
            after_sequence,
        })
        .await
    }

    pub async fn unsubscribe(&self, conversation_id: ConversationId) -> Result<()> {
        {
            let mut s = self.state.write().await;
            s.subscribed.remove(&conversation_id);
            s.focused.remove(&conversation_id);
        }
        self.send(ClientMessage::Unsubscribe { conversation_id }).await
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        client_ref: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        self.send(ClientMessage::Send {
            conversation_id,
            client_ref: client_ref.into(),
            content: content.into(),
        })
        .await
    }

    pub async fn send_offer(
        &self,
        conversation_id: ConversationId,
        client_ref: impl Into<String>,
        terms: OfferTerms,
        note: Option<String>,
    ) -> Result<()> {
        self.send(ClientMessage::Offer {
            conversation_id,
            client_ref: client_ref.into(),
            price_per_ton: terms.price_per_ton,
            quantity_tons: terms.quantity_tons,
            note,
        })
        .await
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.send(ClientMessage::MarkRead { conversation_id }).await
    }

    pub async fn close(&self, conversation_id: ConversationId, reason: CloseReason) -> Result<()> {
        self.send(ClientMessage::Close {
            conversation_id,
            reason,
        })
        .await
    }

    pub async fn inbox(&self) -> Result<()> {
        self.send(ClientMessage::Inbox).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(ClientMessage::Ping).await
    }

    /// Mark the conversation as on screen: incoming messages from others are
    /// marked read as they arrive, and anything pending is marked now
    pub async fn focus(&self, conversation_id: ConversationId) -> Result<()> {
        self.state.write().await.focused.insert(conversation_id);
        self.mark_read(conversation_id).await
    }

    pub async fn unfocus(&self, conversation_id: ConversationId) {
        self.state.write().await.focused.remove(&conversation_id);
    }

    /// Highest sequence seen in a conversation
    pub async fn last_seen(&self, conversation_id: ConversationId) -> u64 {
        self.state
            .read()
            .await
            .last_seen
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    state: Arc<RwLock<ClientState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    loop {
        tokio::select! {
            // Incoming message from server
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => {
                        let follow_ups = handle_server_message(msg, &state, &event_tx).await;
                        if let Err(e) = write_frames(&mut writer, &follow_ups).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    {
        let mut s = state.write().await;
        s.connection = ConnectionState::Disconnected;
    }
    let _ = event_tx.send(ClientEvent::Disconnected).await;
    info!("Disconnected from server");
}

async fn write_frames(
    writer: &mut WriteHalf<TcpStream>,
    frames: &[ClientMessage],
) -> Result<()> {
    for frame in frames {
        write_frame(writer, frame).await?;
    }
    Ok(())
}

/// Handle a message from the server. Returns frames to send back.
async fn handle_server_message(
    msg: ServerMessage,
    state: &Arc<RwLock<ClientState>>,
    event_tx: &mpsc::Sender<ClientEvent>,
) -> Vec<ClientMessage> {
    let mut follow_ups = Vec::new();
    match msg {
        ServerMessage::Delivered { message } => {
            let (fresh, mark) = {
                let mut s = state.write().await;
                let fresh = s.observe(&message);
                (fresh, fresh && s.wants_mark_read(&message))
            };
            if !fresh {
                debug!(sequence = message.sequence, "Dropping duplicate delivery");
                return follow_ups;
            }
            if mark {
                follow_ups.push(ClientMessage::MarkRead {
                    conversation_id: message.conversation_id,
                });
            }
            let _ = event_tx.send(ClientEvent::Message(message)).await;
        }
        ServerMessage::SyncBatch {
            conversation_id,
            messages,
        } => {
            let (fresh, mark): (Vec<Message>, bool) = {
                let mut s = state.write().await;
                let fresh: Vec<_> = messages.into_iter().filter(|m| s.observe(m)).collect();
                let mark = fresh.iter().any(|m| s.wants_mark_read(m));
                (fresh, mark)
            };
            debug!(conversation_id = %conversation_id, count = fresh.len(), "Received sync batch");
            if mark {
                follow_ups.push(ClientMessage::MarkRead { conversation_id });
            }
            let count = fresh.len();
            for message in fresh {
                let _ = event_tx.send(ClientEvent::Message(message)).await;
            }
            let _ = event_tx
                .send(ClientEvent::Synced {
                    conversation_id,
                    count,
                })
                .await;
        }
        ServerMessage::Opened {
            conversation,
            created,
        } => {
            let _ = event_tx
                .send(ClientEvent::Opened {
                    conversation,
                    created,
                })
                .await;
        }
        ServerMessage::Sent {
            client_ref,
            message,
            warning,
        } => {
            let _ = event_tx
                .send(ClientEvent::Sent {
                    client_ref,
                    message,
                    warning,
                })
                .await;
        }
        ServerMessage::SendFailed {
            client_ref,
            reason,
            kind,
        } => {
            let _ = event_tx
                .send(ClientEvent::SendFailed {
                    client_ref,
                    reason,
                    kind,
                })
                .await;
        }
        ServerMessage::Unread {
            conversation_id,
            counters,
        } => {
            let _ = event_tx
                .send(ClientEvent::Unread {
                    conversation_id,
                    counters,
                })
                .await;
        }
        ServerMessage::Closed {
            conversation_id,
            changed,
        } => {
            let _ = event_tx
                .send(ClientEvent::Closed {
                    conversation_id,
                    changed,
                })
                .await;
        }
        ServerMessage::Inbox { conversations } => {
            let _ = event_tx.send(ClientEvent::Inbox(conversations)).await;
        }
        ServerMessage::Error { reason, kind } => {
            let _ = event_tx.send(ClientEvent::Error { reason, kind }).await;
        }
        ServerMessage::ServerShutdown => {
            let _ = event_tx.send(ClientEvent::ServerShutdown).await;
        }
        ServerMessage::Pong => {
            debug!("Received pong");
        }
        ServerMessage::Welcome { .. } => {
            debug!("Ignoring repeated Welcome");
        }
    }
    follow_ups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerConfig};
    use mandi_core::{ChatService, ConversationKey, Database, MessageKind};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn start(service: ChatService<Database>) -> Server {
        let config = ServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            idle_timeout: Duration::from_secs(5),
        };
        Server::start(config, service).await.unwrap()
    }

    async fn next(client: &mut Client) -> ClientEvent {
        timeout(Duration::from_secs(2), client.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    /// Skip events until one matches
    async fn wait_for<F>(client: &mut Client, mut pred: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        loop {
            let event = next(client).await;
            if pred(&event) {
                return event;
            }
        }
    }

    fn open(service: &ChatService<Database>) -> ConversationId {
        service
            .open(
                ConversationKey::new("F1".into(), "B1".into(), Some("L7".into())),
                None,
                None,
            )
            .unwrap()
            .conversation
            .id
    }

    #[tokio::test]
    async fn test_client_connect() {
        let server = start(ChatService::new(Database::open_in_memory().unwrap())).await;

        let mut client = Client::connect(server.addr(), "F1".into(), SenderRole::Farmer)
            .await
            .unwrap();
        assert_eq!(client.connection_state().await, ConnectionState::Connected);

        client.disconnect().await;
        assert!(matches!(next(&mut client).await, ClientEvent::Disconnected));
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Disconnected
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn test_system_role_rejected() {
        let server = start(ChatService::new(Database::open_in_memory().unwrap())).await;
        let result = Client::connect(server.addr(), "bot".into(), SenderRole::System).await;
        assert!(matches!(result, Err(Error::Rejected(_))));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_open_and_subscribe() {
        let server = start(ChatService::new(Database::open_in_memory().unwrap())).await;
        let mut buyer = Client::connect(server.addr(), "B1".into(), SenderRole::Buyer)
            .await
            .unwrap();

        buyer
            .open("F1".into(), "B1".into(), Some("L7".into()), Some("BID1".into()), None)
            .await
            .unwrap();
        let conversation = match next(&mut buyer).await {
            ClientEvent::Opened {
                conversation,
                created,
            } => {
                assert!(created);
                conversation
            }
            other => panic!("Unexpected {:?}", other),
        };

        buyer.subscribe(conversation.id).await.unwrap();
        match next(&mut buyer).await {
            ClientEvent::Message(message) => assert_eq!(message.kind(), MessageKind::System),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(matches!(
            next(&mut buyer).await,
            ClientEvent::Synced { count: 1, .. }
        ));
        assert_eq!(buyer.last_seen(conversation.id).await, 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_live_delivery_matches_sender_copy() {
        let service = ChatService::new(Database::open_in_memory().unwrap());
        let id = open(&service);
        let server = start(service).await;

        let mut farmer = Client::connect(server.addr(), "F1".into(), SenderRole::Farmer)
            .await
            .unwrap();
        let mut buyer = Client::connect(server.addr(), "B1".into(), SenderRole::Buyer)
            .await
            .unwrap();

        buyer.subscribe(id).await.unwrap();
        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Synced { .. })).await;

        farmer
            .send_message(id, "r1", "mail me on ravi@example.in")
            .await
            .unwrap();
        let sent = match next(&mut farmer).await {
            ClientEvent::Sent {
                message, warning, ..
            } => {
                assert!(warning.is_some());
                message
            }
            other => panic!("Unexpected {:?}", other),
        };

        match next(&mut buyer).await {
            ClientEvent::Message(message) => {
                assert_eq!(message.id, sent.id);
                assert_eq!(message.content(), sent.content());
                assert_eq!(message.content(), "mail me on [email hidden]");
            }
            other => panic!("Unexpected {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_focus_marks_incoming_read() {
        let service = ChatService::new(Database::open_in_memory().unwrap());
        let id = open(&service);
        let server = start(service.clone()).await;

        let mut buyer = Client::connect(server.addr(), "B1".into(), SenderRole::Buyer)
            .await
            .unwrap();
        buyer.subscribe(id).await.unwrap();
        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Synced { .. })).await;
        buyer.focus(id).await.unwrap();
        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Unread { .. })).await;

        service
            .send(id, &"F1".into(), SenderRole::Farmer, "truck arrives at 6")
            .unwrap();

        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Message(_))).await;
        match wait_for(&mut buyer, |e| matches!(e, ClientEvent::Unread { .. })).await {
            ClientEvent::Unread { counters, .. } => assert_eq!(counters.buyer, 0),
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(service.unread_counts(id).unwrap().buyer, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_fetches_only_missed_messages() {
        let dir = tempdir().unwrap();
        let service = ChatService::new(Database::open(dir.path().join("mandi.db")).unwrap());
        let id = open(&service);
        let server = start(service.clone()).await;

        let mut buyer = Client::connect(server.addr(), "B1".into(), SenderRole::Buyer)
            .await
            .unwrap();
        buyer.subscribe(id).await.unwrap();
        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Synced { .. })).await;

        service
            .send(id, &"F1".into(), SenderRole::Farmer, "first")
            .unwrap();
        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Message(_))).await;
        assert_eq!(buyer.last_seen(id).await, 2);

        buyer.disconnect().await;
        wait_for(&mut buyer, |e| matches!(e, ClientEvent::Disconnected)).await;

        // Sent while the buyer is offline
        for content in ["second", "third"] {
            service
                .send(id, &"F1".into(), SenderRole::Farmer, content)
                .unwrap();
        }

        let mut buyer = buyer.reconnect(server.addr()).await.unwrap();
        let mut replayed = Vec::new();
        loop {
            match next(&mut buyer).await {
                ClientEvent::Message(message) => replayed.push(message.content().to_string()),
                ClientEvent::Synced { count, .. } => {
                    assert_eq!(count, 2);
                    break;
                }
                other => panic!("Unexpected {:?}", other),
            }
        }
        assert_eq!(replayed, vec!["second", "third"]);
        assert_eq!(buyer.last_seen(id).await, 4);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_closed_conversation() {
        let service = ChatService::new(Database::open_in_memory().unwrap());
        let id = open(&service);
        let server = start(service).await;

        let mut farmer = Client::connect(server.addr(), "F1".into(), SenderRole::Farmer)
            .await
            .unwrap();
        farmer.close(id, CloseReason::DealCompleted).await.unwrap();
        assert!(matches!(
            next(&mut farmer).await,
            ClientEvent::Closed { changed: true, .. }
        ));

        farmer.send_message(id, "r9", "hello?").await.unwrap();
        match next(&mut farmer).await {
            ClientEvent::SendFailed { client_ref, kind, .. } => {
                assert_eq!(client_ref, "r9");
                assert_eq!(kind, "conversation_closed");
            }
            other => panic!("Unexpected {:?}", other),
        }

        farmer.inbox().await.unwrap();
        match next(&mut farmer).await {
            ClientEvent::Inbox(conversations) => {
                assert_eq!(conversations.len(), 1);
                assert!(!conversations[0].is_open());
            }
            other => panic!("Unexpected {:?}", other),
        }
        server.shutdown();
    }

    #[test]
    fn test_observe_drops_duplicates() {
        let mut state = ClientState {
            connection: ConnectionState::Connected,
            user_id: "B1".into(),
            role: SenderRole::Buyer,
            last_seen: HashMap::new(),
            subscribed: HashSet::new(),
            focused: HashSet::new(),
        };
        let mut message = Message::system(ConversationId::new(), "hi", chrono::Utc::now());
        message.sequence = 3;

        assert!(state.observe(&message));
        assert!(!state.observe(&message));
        message.sequence = 2;
        assert!(!state.observe(&message));
        assert!(!state.wants_mark_read(&message));

        state.focused.insert(message.conversation_id);
        assert!(state.wants_mark_read(&message));
    }
}

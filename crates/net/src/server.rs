//! TCP server exposing the chat service to client sessions
//!
//! Each connection is one session: it greets with `Hello`, then issues
//! requests and receives replies and live deliveries over the same socket.
//! Sessions idle longer than the configured timeout are dropped together
//! with all of their subscriptions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use mandi_core::{
    ChatService, ConversationId, ConversationKey, OfferTerms, SenderRole, Storage,
    Subscription, UserId,
};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ClientMessage, ServerMessage};

/// Time allowed for queued frames to flush when a session ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Sessions that send nothing for this long are disconnected
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Chat server handle
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind and start accepting sessions
    pub async fn start<S>(config: ServerConfig, service: ChatService<S>) -> Result<Self>
    where
        S: Storage + Send + 'static,
    {
        let listener = TcpListener::bind(config.addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, idle_timeout = ?config.idle_timeout, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown = shutdown_tx.clone();
        tokio::spawn(accept_loop(listener, service, config.idle_timeout, shutdown));

        Ok(Server {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and tell every session the server is going away
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop<S>(
    listener: TcpListener,
    service: ChatService<S>,
    idle_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
) where
    S: Storage + Send + 'static,
{
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            service.clone(),
                            idle_timeout,
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection<S>(
    stream: TcpStream,
    addr: SocketAddr,
    service: ChatService<S>,
    idle_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    S: Storage + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer_handle = tokio::spawn(writer_task(writer, outbound_rx));

    let (user_id, role) = match handle_hello(&mut reader, idle_timeout).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Hello failed");
            let _ = outbound.send(ServerMessage::Error {
                reason: e.to_string(),
                kind: "rejected".into(),
            });
            finish(outbound, writer_handle).await;
            return;
        }
    };

    info!(addr = %addr, user_id = %user_id, role = %role, "Session started");
    let _ = outbound.send(ServerMessage::Welcome {
        user_id: user_id.clone(),
        role,
    });

    let mut session = Session {
        user_id,
        role,
        service,
        outbound,
        subscriptions: HashMap::new(),
    };

    loop {
        tokio::select! {
            result = timeout(idle_timeout, read_frame(&mut reader)) => {
                match result {
                    Ok(Ok(msg)) => session.handle(msg),
                    Ok(Err(Error::ConnectionClosed)) => {
                        debug!(user_id = %session.user_id, "Connection closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(user_id = %session.user_id, error = %e, "Read error");
                        break;
                    }
                    Err(_) => {
                        info!(user_id = %session.user_id, "Session idle, disconnecting");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = session.outbound.send(ServerMessage::ServerShutdown);
                break;
            }
        }
    }

    let user_id = session.user_id.clone();
    let outbound = session.close();
    finish(outbound, writer_handle).await;

    info!(user_id = %user_id, "Session ended");
}

/// Read the mandatory `Hello` frame
async fn handle_hello(
    reader: &mut ReadHalf<TcpStream>,
    idle_timeout: Duration,
) -> Result<(UserId, SenderRole)> {
    let msg: ClientMessage = timeout(idle_timeout, read_frame(reader))
        .await
        .map_err(|_| Error::Rejected("No Hello before timeout".into()))??;

    match msg {
        ClientMessage::Hello { role: SenderRole::System, .. } => {
            Err(Error::Rejected("The system role cannot open a session".into()))
        }
        ClientMessage::Hello { user_id, .. } if user_id.as_str().trim().is_empty() => {
            Err(Error::Rejected("Missing user id".into()))
        }
        ClientMessage::Hello { user_id, role } => Ok((user_id, role)),
        _ => Err(Error::Protocol("Expected Hello".into())),
    }
}

/// Writer task - sends messages to the client
async fn writer_task(
    mut writer: WriteHalf<TcpStream>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Let the writer flush what is queued, then give up on it
async fn finish(
    outbound: mpsc::UnboundedSender<ServerMessage>,
    writer_handle: tokio::task::JoinHandle<()>,
) {
    drop(outbound);
    let abort = writer_handle.abort_handle();
    if timeout(DRAIN_TIMEOUT, writer_handle).await.is_err() {
        debug!("Writer did not drain in time");
        abort.abort();
    }
}

/// Per-connection state
struct Session<S: Storage> {
    user_id: UserId,
    role: SenderRole,
    service: ChatService<S>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: HashMap<ConversationId, Subscription>,
}

impl<S: Storage> Session<S> {
    fn reply(&self, msg: ServerMessage) {
        // Only fails once the writer is gone, and the read loop ends soon after
        let _ = self.outbound.send(msg);
    }

    fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Hello { .. } => {
                self.reply(ServerMessage::Error {
                    reason: "Session already started".into(),
                    kind: "protocol".into(),
                });
            }
            ClientMessage::Open {
                farmer_id,
                buyer_id,
                listing_id,
                bid_id,
                context,
            } => {
                let key = ConversationKey::new(farmer_id, buyer_id, listing_id);
                if let Err(e) = self.may_open(&key) {
                    self.reply(ServerMessage::error(&e));
                    return;
                }
                match self.service.open(key, bid_id, context) {
                    Ok(opened) => {
                        let created = opened.created();
                        self.reply(ServerMessage::Opened {
                            conversation: opened.conversation,
                            created,
                        });
                    }
                    Err(e) => self.reply(ServerMessage::error(&e)),
                }
            }
            ClientMessage::Subscribe {
                conversation_id,
                after_sequence,
            } => self.subscribe(conversation_id, after_sequence),
            ClientMessage::Unsubscribe { conversation_id } => {
                if let Some(subscription) = self.subscriptions.remove(&conversation_id) {
                    subscription.unsubscribe();
                    debug!(conversation_id = %conversation_id, "Unsubscribed");
                }
            }
            ClientMessage::Send {
                conversation_id,
                client_ref,
                content,
            } => {
                let result = self
                    .service
                    .send(conversation_id, &self.user_id, self.role, &content);
                self.reply_sent(client_ref, result);
            }
            ClientMessage::Offer {
                conversation_id,
                client_ref,
                price_per_ton,
                quantity_tons,
                note,
            } => {
                let terms = OfferTerms {
                    price_per_ton,
                    quantity_tons,
                };
                let result = self.service.send_offer(
                    conversation_id,
                    &self.user_id,
                    self.role,
                    terms,
                    note.as_deref(),
                );
                self.reply_sent(client_ref, result);
            }
            ClientMessage::MarkRead { conversation_id } => {
                let result = self
                    .service
                    .mark_read(conversation_id, &self.user_id)
                    .and_then(|_| self.service.unread_counts(conversation_id));
                match result {
                    Ok(counters) => self.reply(ServerMessage::Unread {
                        conversation_id,
                        counters,
                    }),
                    Err(e) => self.reply(ServerMessage::error(&e)),
                }
            }
            ClientMessage::Close {
                conversation_id,
                reason,
            } => {
                let result = self
                    .service
                    .conversation(conversation_id, &self.user_id, self.role)
                    .and_then(|_| self.service.close(conversation_id, reason));
                match result {
                    Ok(notice) => self.reply(ServerMessage::Closed {
                        conversation_id,
                        changed: notice.is_some(),
                    }),
                    Err(e) => self.reply(ServerMessage::error(&e)),
                }
            }
            ClientMessage::Inbox => match self.service.inbox(&self.user_id) {
                Ok(conversations) => self.reply(ServerMessage::Inbox { conversations }),
                Err(e) => self.reply(ServerMessage::error(&e)),
            },
            ClientMessage::Ping => self.reply(ServerMessage::Pong),
        }
    }

    /// Participants may only open conversations on their own side
    fn may_open(&self, key: &ConversationKey) -> mandi_core::Result<()> {
        let allowed = match self.role {
            SenderRole::Farmer => key.farmer_id == self.user_id,
            SenderRole::Buyer => key.buyer_id == self.user_id,
            SenderRole::Admin => true,
            SenderRole::System => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(mandi_core::Error::PermissionDenied(format!(
                "{} cannot open a conversation as {}",
                self.user_id, self.role
            )))
        }
    }

    fn subscribe(&mut self, conversation_id: ConversationId, after_sequence: u64) {
        // Re-subscribing replaces the old subscription
        if let Some(previous) = self.subscriptions.remove(&conversation_id) {
            previous.unsubscribe();
        }

        let backlog_tx = self.outbound.clone();
        let live_tx = self.outbound.clone();
        let result = self.service.subscribe(
            conversation_id,
            &self.user_id,
            self.role,
            after_sequence,
            move |messages| {
                let _ = backlog_tx.send(ServerMessage::SyncBatch {
                    conversation_id,
                    messages,
                });
            },
            move |message| {
                let _ = live_tx.send(ServerMessage::Delivered { message });
            },
        );

        match result {
            Ok(subscription) => {
                debug!(conversation_id = %conversation_id, after_sequence, "Subscribed");
                self.subscriptions.insert(conversation_id, subscription);
            }
            Err(e) => self.reply(ServerMessage::error(&e)),
        }
    }

    fn reply_sent(
        &self,
        client_ref: String,
        result: mandi_core::Result<mandi_core::SendReceipt>,
    ) {
        match result {
            Ok(receipt) => self.reply(ServerMessage::Sent {
                client_ref,
                message: receipt.message.for_viewer(self.role),
                warning: receipt.warning.map(|w| w.text().to_string()),
            }),
            Err(e) => {
                debug!(error = %e, kind = e.kind(), "Send failed");
                self.reply(ServerMessage::send_failed(client_ref, &e));
            }
        }
    }

    /// Drop every subscription and hand back the outbound queue
    fn close(self) -> mpsc::UnboundedSender<ServerMessage> {
        for (_, subscription) in self.subscriptions {
            subscription.unsubscribe();
        }
        self.outbound
    }
}

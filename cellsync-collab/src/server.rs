//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── Authority ── BroadcastGroup
//! Client B ──┘                     (OT log)          │
//!                          ┌─────────────────────────┼───────────┐
//!                          ▼                         ▼           ▼
//!                    Client A (ack)             Client B      Client C
//! ```
//!
//! Each document room maintains:
//! - An [`Authority`] holding the committed snapshot and operation log
//! - A [`BroadcastGroup`] for fan-out to connected peers
//!
//! Commits are broadcast while the room lock is held, so every peer sees
//! them in version order. A peer whose receiver lags is disconnected; its
//! replica cannot skip versions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::authority::Authority;
use crate::broadcast::{BroadcastGroup, Commit};
use crate::protocol::{ClientMessage, DocumentId, ParticipantInfo, ServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub committed_ops: u64,
    pub rejected_ops: u64,
}

/// Document room: authority + broadcast group.
struct DocumentRoom {
    authority: Authority,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(snapshot: Value, broadcast_capacity: usize) -> Self {
        Self {
            authority: Authority::new(snapshot),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<DocumentId, DocumentRoom>>>;

/// Per-connection state.
#[derive(Default)]
struct Attachment {
    peer: Option<ParticipantInfo>,
    doc_id: Option<DocumentId>,
    commits: Option<broadcast::Receiver<Arc<Commit>>>,
}

/// What the connection loop does after a client message.
enum Flow {
    Reply(ServerMessage),
    Continue,
    Close,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// Document rooms by id
    rooms: Rooms,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut attachment = Attachment::default();
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let flow = match ClientMessage::decode(text.as_str()) {
                                Ok(message) => {
                                    Self::handle_message(message, &mut attachment, &rooms, &stats, &config).await
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    Flow::Reply(ServerMessage::Error { message: e.to_string() })
                                }
                            };
                            match flow {
                                Flow::Reply(reply) => {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                                Flow::Continue => {}
                                Flow::Close => break,
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                commit = async {
                    match attachment.commits.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not attached to a room yet
                        None => std::future::pending().await,
                    }
                } => {
                    match commit {
                        Ok(commit) => {
                            let own = attachment.peer.as_ref().map(|p| p.id) == Some(commit.origin);
                            let message = if own {
                                ServerMessage::Ack { version: commit.version }
                            } else {
                                ServerMessage::Op {
                                    version: commit.version,
                                    ops: commit.ops.clone(),
                                    participant: commit.origin,
                                }
                            };
                            ws_sender.send(Message::Text(message.encode()?.into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {:?} lagged by {n} commits, disconnecting", attachment.peer.as_ref().map(|p| p.id));
                            if let Some(doc_id) = attachment.doc_id.as_ref() {
                                if let Some(room) = rooms.read().await.get(doc_id) {
                                    room.broadcast.record_lag(n);
                                }
                            }
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }

        // Cleanup: remove peer from room
        let mut rooms_w = rooms.write().await;
        if let (Some(peer), Some(doc_id)) = (attachment.peer.as_ref(), attachment.doc_id.as_ref()) {
            if let Some(room) = rooms_w.get_mut(doc_id) {
                room.broadcast.remove_peer(&peer.id).await;
                room.authority.detach(&peer.id);
                log::info!("Peer {} ({}) left doc {doc_id}", peer.name, peer.id);

                if room.broadcast.peer_count().await == 0 {
                    rooms_w.remove(doc_id);
                    log::info!("Room {doc_id} removed (empty)");
                }
            }
        }
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms_w.len();

        Ok(())
    }

    async fn handle_message(
        message: ClientMessage,
        attachment: &mut Attachment,
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Flow {
        match message {
            ClientMessage::Create { participant, snapshot } => {
                if attachment.doc_id.is_some() {
                    return Flow::Reply(ServerMessage::Error { message: "already attached to a document".into() });
                }
                let doc_id = Uuid::new_v4().simple().to_string();
                let mut rooms_w = rooms.write().await;
                let room = rooms_w
                    .entry(doc_id.clone())
                    .or_insert_with(|| DocumentRoom::new(snapshot, config.broadcast_capacity));
                attachment.commits = Some(room.broadcast.add_peer(participant.clone()).await);
                room.authority.attach(participant.id);
                let reply = ServerMessage::Joined {
                    doc_id: doc_id.clone(),
                    version: room.authority.version(),
                    snapshot: room.authority.snapshot().clone(),
                };
                stats.write().await.active_rooms = rooms_w.len();
                log::info!("Peer {} ({}) created doc {doc_id}", participant.name, participant.id);
                attachment.peer = Some(participant);
                attachment.doc_id = Some(doc_id);
                Flow::Reply(reply)
            }

            ClientMessage::Join { doc_id, participant } => {
                if attachment.doc_id.is_some() {
                    return Flow::Reply(ServerMessage::Error { message: "already attached to a document".into() });
                }
                let mut rooms_w = rooms.write().await;
                let Some(room) = rooms_w.get_mut(&doc_id) else {
                    log::debug!("Join of unknown doc {doc_id}");
                    return Flow::Reply(ServerMessage::NotFound { doc_id });
                };
                if room.broadcast.peer_count().await >= config.max_peers_per_room {
                    log::warn!("Room {doc_id} is full, rejecting {}", participant.id);
                    return Flow::Reply(ServerMessage::Error { message: format!("document {doc_id} is full") });
                }
                // Subscribe and snapshot under one lock: no commit is missed or repeated.
                attachment.commits = Some(room.broadcast.add_peer(participant.clone()).await);
                room.authority.attach(participant.id);
                let reply = ServerMessage::Joined {
                    doc_id: doc_id.clone(),
                    version: room.authority.version(),
                    snapshot: room.authority.snapshot().clone(),
                };
                log::info!("Peer {} ({}) joined doc {doc_id}", participant.name, participant.id);
                attachment.peer = Some(participant);
                attachment.doc_id = Some(doc_id);
                Flow::Reply(reply)
            }

            ClientMessage::Submit { version, ops } => {
                let (Some(peer), Some(doc_id)) = (attachment.peer.as_ref(), attachment.doc_id.as_ref()) else {
                    return Flow::Reply(ServerMessage::Error { message: "submit before join".into() });
                };
                let mut rooms_w = rooms.write().await;
                let Some(room) = rooms_w.get_mut(doc_id) else {
                    return Flow::Reply(ServerMessage::NotFound { doc_id: doc_id.clone() });
                };
                match room.authority.submit(peer.id, version, ops) {
                    Ok((committed, ops)) => {
                        room.broadcast.broadcast(Commit { origin: peer.id, version: committed, ops });
                        stats.write().await.committed_ops += 1;
                        Flow::Continue
                    }
                    Err(e) => {
                        log::warn!("Rejected operation from {} on {doc_id}: {e}", peer.id);
                        stats.write().await.rejected_ops += 1;
                        Flow::Reply(ServerMessage::Error { message: e.to_string() })
                    }
                }
            }

            ClientMessage::Leave => Flow::Close,

            ClientMessage::Ping => Flow::Reply(ServerMessage::Pong),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Committed version and snapshot of a document, if it is open.
    pub async fn document(&self, doc_id: &str) -> Option<(u64, Value)> {
        let rooms = self.rooms.read().await;
        rooms
            .get(doc_id)
            .map(|room| (room.authority.version(), room.authority.snapshot().clone()))
    }
}

//! WebSocket client: join or create a document, then exchange messages.
//!
//! Provides:
//! - The join/create handshake, resolving to a [`Replica`] plus a
//!   [`Connection`], or an explicit [`JoinError`]
//! - Background reader/writer tasks feeding the connection's channels
//!
//! A missing document is reported as [`JoinError::DocumentNotFound`] and is
//! never retried here.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{ClientMessage, DocumentId, ParticipantInfo, ProtocolError, ServerMessage};
use crate::replica::Replica;

/// How long to wait for the server to answer a join or create.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("document {0} does not exist")]
    DocumentNotFound(DocumentId),
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("connection failed: {0}")]
    Connection(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no answer from the server within {0:?}")]
    Timeout(Duration),
}

/// An open link to the sync server.
pub struct Connection {
    outgoing: mpsc::Sender<ClientMessage>,
    incoming: mpsc::Receiver<ServerMessage>,
    state: Arc<RwLock<ConnectionState>>,
}

impl Connection {
    pub async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send messages in order, typically a replica's outbox.
    pub async fn send_all(&self, messages: Vec<ClientMessage>) -> Result<(), ProtocolError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Next message from the server; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.incoming.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.incoming.try_recv().ok()
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<ServerMessage, ProtocolError> {
        match tokio::time::timeout(wait, self.incoming.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Say goodbye and stop the writer.
    pub async fn close(self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave).await
    }
}

/// Join an existing document.
pub async fn join(
    url: &str,
    doc_id: &str,
    participant: ParticipantInfo,
) -> Result<(Replica, Connection), JoinError> {
    let hello = ClientMessage::Join { doc_id: doc_id.to_string(), participant: participant.clone() };
    handshake(url, hello, participant).await
}

/// Create a new document from `snapshot`; the server picks its id.
pub async fn create(
    url: &str,
    participant: ParticipantInfo,
    snapshot: Value,
) -> Result<(Replica, Connection), JoinError> {
    let hello = ClientMessage::Create { participant: participant.clone(), snapshot };
    handshake(url, hello, participant).await
}

async fn handshake(
    url: &str,
    hello: ClientMessage,
    participant: ParticipantInfo,
) -> Result<(Replica, Connection), JoinError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    ws_writer.send(Message::Text(hello.encode()?.into())).await?;
    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_server_message(&mut ws_reader))
        .await
        .map_err(|_| JoinError::Timeout(HANDSHAKE_TIMEOUT))??;

    let (doc_id, version, snapshot) = match reply {
        ServerMessage::Joined { doc_id, version, snapshot } => (doc_id, version, snapshot),
        ServerMessage::NotFound { doc_id } => return Err(JoinError::DocumentNotFound(doc_id)),
        ServerMessage::Error { message } => return Err(JoinError::Rejected(message)),
        other => return Err(ProtocolError::UnexpectedMessage(format!("{other:?}")).into()),
    };
    log::info!("{} ({}) attached to doc {doc_id} at version {version}", participant.name, participant.id);

    let state = Arc::new(RwLock::new(ConnectionState::Connected));

    // Writer task: forward outgoing channel to the WebSocket
    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let leaving = message == ClientMessage::Leave;
            let frame = match message.encode() {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    log::error!("Dropping unencodable message: {e}");
                    continue;
                }
            };
            if ws_writer.send(frame).await.is_err() {
                break;
            }
            if leaving {
                let _ = ws_writer.close().await;
                break;
            }
        }
    });

    // Reader task: decode server frames into the incoming channel
    let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(256);
    let reader_state = state.clone();
    tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                    Ok(message) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Undecodable server message: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        *reader_state.write().await = ConnectionState::Disconnected;
        log::debug!("Connection reader finished");
    });

    let replica = Replica::new(doc_id, participant.id, version, snapshot);
    Ok((replica, Connection { outgoing: out_tx, incoming: in_rx, state }))
}

async fn next_server_message<S>(reader: &mut S) -> Result<ServerMessage, JoinError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame? {
            Message::Text(text) => return Ok(ServerMessage::decode(text.as_str())?),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_error_messages() {
        let err = JoinError::DocumentNotFound("abc".into());
        assert_eq!(err.to_string(), "document abc does not exist");
        let err = JoinError::Timeout(HANDSHAKE_TIMEOUT);
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Connected, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_join_without_server_fails_to_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = join(&format!("ws://127.0.0.1:{port}"), "doc", ParticipantInfo::new("Alice")).await;
        assert!(matches!(result, Err(JoinError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connection_channels() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut conn = Connection {
            outgoing: out_tx,
            incoming: in_rx,
            state: Arc::new(RwLock::new(ConnectionState::Connected)),
        };

        conn.send_all(vec![ClientMessage::Ping, ClientMessage::Leave]).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(ClientMessage::Ping));
        assert_eq!(out_rx.recv().await, Some(ClientMessage::Leave));

        in_tx.send(ServerMessage::Pong).await.unwrap();
        assert_eq!(conn.recv_timeout(Duration::from_secs(1)).await.unwrap(), ServerMessage::Pong);
        assert!(conn.try_recv().is_none());
        drop(in_tx);
        assert!(matches!(conn.recv_timeout(Duration::from_secs(1)).await, Err(ProtocolError::ConnectionClosed)));
        assert_eq!(conn.state().await, ConnectionState::Connected);
    }
}

//! JSON wire protocol between participants and the sync server.
//!
//! Every frame is one WebSocket text message holding a tagged JSON object:
//! ```text
//! client → server                         server → client
//! ───────────────                         ───────────────
//! {"type":"create", participant, snapshot}  {"type":"joined", doc_id, version, snapshot}
//! {"type":"join", doc_id, participant}      {"type":"not_found", doc_id}
//! {"type":"submit", version, ops}           {"type":"ack", version}
//! {"type":"leave"}                          {"type":"op", version, ops, participant}
//! {"type":"ping"}                           {"type":"pong"}
//!                                           {"type":"error", message}
//! ```
//!
//! `ops` are json0 components. `version` on `submit` is the document
//! version the operation was generated against; on `ack`/`op` it is the
//! version after the operation was committed.

use cellsync_core::{Component, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::presence::CursorColor;

/// Human-enterable document identifier.
pub type DocumentId = String;

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit id (for testing)
    pub fn with_id(id: ParticipantId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }

    /// Stable indicator colour derived from the id.
    pub fn color(&self) -> CursorColor {
        CursorColor::from_uuid(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new document with the given initial snapshot.
    Create {
        participant: ParticipantInfo,
        snapshot: Value,
    },
    /// Attach to an existing document.
    Join {
        doc_id: DocumentId,
        participant: ParticipantInfo,
    },
    Submit {
        version: u64,
        ops: Vec<Component>,
    },
    Leave,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        doc_id: DocumentId,
        version: u64,
        snapshot: Value,
    },
    NotFound {
        doc_id: DocumentId,
    },
    /// The sender's own operation was committed at `version`.
    Ack {
        version: u64,
    },
    /// Another participant's operation, already transformed by the server.
    Op {
        version: u64,
        ops: Vec<Component>,
        participant: ParticipantId,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Deserialization)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellsync_core::paths;
    use serde_json::json;

    #[test]
    fn test_submit_wire_shape() {
        let msg = ClientMessage::Submit {
            version: 3,
            ops: vec![Component::TextInsert {
                path: paths::unit_source(0),
                offset: 5,
                text: "1".into(),
            }],
        };
        let text = msg.encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            raw,
            json!({"type": "submit", "version": 3, "ops": [{"p": ["units", 0, "source", 5], "si": "1"}]})
        );
        assert_eq!(ClientMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_join_roundtrip() {
        let info = ParticipantInfo::new("Alice");
        let msg = ClientMessage::Join { doc_id: "abc".into(), participant: info.clone() };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ClientMessage::Join { doc_id, participant } => {
                assert_eq!(doc_id, "abc");
                assert_eq!(participant, info);
            }
            other => panic!("Expected Join, got {other:?}"),
        }
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(ClientMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(ServerMessage::decode(r#"{"type":"pong"}"#).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn test_not_found_roundtrip() {
        let msg = ServerMessage::NotFound { doc_id: "missing".into() };
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_op_carries_participant() {
        let id = Uuid::new_v4();
        let msg = ServerMessage::Op {
            version: 9,
            ops: vec![Component::NumberAdd { path: paths::counter("renderMarkdown"), delta: 2 }],
            participant: id,
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ClientMessage::decode(r#"{"type":"submit","version":1,"ops":[{"li":1}]}"#).is_err());
    }

    #[test]
    fn test_participant_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = ParticipantInfo::with_id(id, "Test");
        let b = ParticipantInfo::with_id(id, "Other");
        assert_eq!(a.color(), b.color());
    }
}

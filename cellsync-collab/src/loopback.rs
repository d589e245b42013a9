//! In-process sync server with explicit delivery.
//!
//! The hub runs the same [`Authority`] the WebSocket server does, but keeps
//! each participant's incoming messages in a queue until the caller delivers
//! them. Tests pick the interleaving by choosing who submits and who
//! receives when.

use std::collections::{HashMap, VecDeque};

use cellsync_core::ParticipantId;
use serde_json::Value;
use uuid::Uuid;

use crate::authority::{Authority, AuthorityError};
use crate::protocol::{ClientMessage, DocumentId, ServerMessage};
use crate::replica::Replica;

pub struct LoopbackHub {
    doc_id: DocumentId,
    authority: Authority,
    inboxes: HashMap<ParticipantId, VecDeque<ServerMessage>>,
}

impl LoopbackHub {
    /// A hub serving one new document.
    pub fn create(snapshot: Value) -> Self {
        Self {
            doc_id: Uuid::new_v4().simple().to_string(),
            authority: Authority::new(snapshot),
            inboxes: HashMap::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn snapshot(&self) -> &Value {
        self.authority.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.authority.version()
    }

    /// Attach a participant and hand back its replica at the current version.
    pub fn join(&mut self, participant: ParticipantId) -> Replica {
        self.inboxes.entry(participant).or_default();
        self.authority.attach(participant);
        Replica::new(
            self.doc_id.clone(),
            participant,
            self.authority.version(),
            self.authority.snapshot().clone(),
        )
    }

    /// Process messages sent by `from`, queueing the replies.
    pub fn submit(&mut self, from: ParticipantId, messages: Vec<ClientMessage>) -> Result<(), AuthorityError> {
        for message in messages {
            match message {
                ClientMessage::Submit { version, ops } => {
                    let (committed, ops) = self.authority.submit(from, version, ops)?;
                    for (peer, inbox) in self.inboxes.iter_mut() {
                        if *peer == from {
                            inbox.push_back(ServerMessage::Ack { version: committed });
                        } else {
                            inbox.push_back(ServerMessage::Op {
                                version: committed,
                                ops: ops.clone(),
                                participant: from,
                            });
                        }
                    }
                }
                ClientMessage::Ping => {
                    if let Some(inbox) = self.inboxes.get_mut(&from) {
                        inbox.push_back(ServerMessage::Pong);
                    }
                }
                ClientMessage::Leave => {
                    self.inboxes.remove(&from);
                    self.authority.detach(&from);
                }
                other => log::debug!("Loopback hub ignoring {other:?}"),
            }
        }
        Ok(())
    }

    /// Pop the oldest message queued for `to`.
    pub fn next_message(&mut self, to: ParticipantId) -> Option<ServerMessage> {
        self.inboxes.get_mut(&to)?.pop_front()
    }

    pub fn drain(&mut self, to: ParticipantId) -> Vec<ServerMessage> {
        self.inboxes
            .get_mut(&to)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, to: ParticipantId) -> usize {
        self.inboxes.get(&to).map_or(0, VecDeque::len)
    }

    /// Whether nothing is waiting for any participant.
    pub fn is_quiet(&self) -> bool {
        self.inboxes.values().all(VecDeque::is_empty)
    }
}

//! Client-side replica of a shared document.
//!
//! The replica is the remote document handle bindings talk to. Local
//! operations are applied optimistically and queued for the server; at most
//! one is in flight at a time. Remote operations are transformed past the
//! unacknowledged local ones before they are applied.
//!
//! ```text
//!  submit_operation ──► apply locally ──► pending ──► inflight ──► outbox
//!                                                        ▲
//!  receive(Op) ──► transform past inflight + pending ────┘ (rebased)
//!  receive(Ack) ──► clear inflight, send next pending
//!  receive(Error) ──► drop inflight + pending, refuse further submits
//! ```
//!
//! A rejected submission leaves the optimistic snapshot ahead of the
//! server with no way to reconcile it, so the replica reports
//! [`ReceiveError::Rejected`] and the caller is expected to rejoin.
//!
//! Every applied operation, local or remote, is queued as a [`DocEvent`] for
//! each subscribed listener, tagged with its [`Source`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use cellsync_core::ot::{self, Component, OtError, Path, PathSegment};
use cellsync_core::ParticipantId;
use serde_json::Value;

use crate::protocol::{ClientMessage, DocumentId, ServerMessage};

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(1);

/// Identity of one local submitter. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub fn next() -> Self {
        SourceId(NEXT_SOURCE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where an applied operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local(SourceId),
    Remote(ParticipantId),
}

impl Source {
    pub fn is_local(&self, id: SourceId) -> bool {
        *self == Source::Local(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocEvent {
    pub ops: Vec<Component>,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("operation submitted through a destroyed binding")]
    BindingDestroyed,
    #[error("replica diverged after a rejected submission; rejoin to resync")]
    Diverged,
    #[error("operation does not apply to the local document: {0}")]
    Apply(#[from] OtError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("server operation could not be applied: {0}")]
    Apply(#[from] OtError),
    #[error("server rejected the submission in flight: {0}")]
    Rejected(String),
}

/// A re-pointable reference to a location inside the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocument {
    path: Path,
}

impl SubDocument {
    pub fn new(path: Path) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        ot::resolve(doc, &self.path)
    }

    /// Whether `path` addresses this location or something inside it.
    pub fn contains(&self, path: &[PathSegment]) -> bool {
        path.starts_with(&self.path)
    }

    pub fn repoint(&mut self, path: Path) {
        self.path = path;
    }
}

/// The capability surface bindings need from a shared document.
pub trait RemoteDocument {
    fn subscribe(&mut self) -> ListenerId;

    fn unsubscribe(&mut self, listener: ListenerId);

    fn submit_operation(&mut self, ops: Vec<Component>, source: SourceId) -> Result<(), SubmitError>;

    /// Current local snapshot. Do not hold across a submit or receive.
    fn get_data(&self) -> &Value;

    fn sub_document(&self, path: Path) -> SubDocument {
        SubDocument::new(path)
    }

    /// Drain the events queued for `listener`, oldest first.
    fn take_events(&mut self, listener: ListenerId) -> Vec<DocEvent>;

    /// Number of non-empty operations submitted so far.
    fn submitted(&self) -> u64;

    /// How many of the submitted operations the server has acknowledged.
    /// Acknowledgements arrive in submit order, so submission `n` is
    /// acknowledged once this reaches `n`.
    fn acknowledged(&self) -> u64;
}

pub struct Replica {
    doc_id: DocumentId,
    participant: ParticipantId,
    snapshot: Value,
    version: u64,
    inflight: Option<Vec<Component>>,
    pending: VecDeque<Vec<Component>>,
    outbox: VecDeque<ClientMessage>,
    listeners: Vec<(ListenerId, VecDeque<DocEvent>)>,
    next_listener: u64,
    submitted: u64,
    acknowledged: u64,
    diverged: bool,
}

impl Replica {
    pub fn new(doc_id: DocumentId, participant: ParticipantId, version: u64, snapshot: Value) -> Self {
        Self {
            doc_id,
            participant,
            snapshot,
            version,
            inflight: None,
            pending: VecDeque::new(),
            outbox: VecDeque::new(),
            listeners: Vec::new(),
            next_listener: 0,
            submitted: 0,
            acknowledged: 0,
            diverged: false,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    /// Last server version this replica has seen.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether local operations are still waiting for acknowledgement.
    pub fn has_unacknowledged(&self) -> bool {
        self.inflight.is_some() || !self.pending.is_empty()
    }

    /// Messages ready for the transport, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        self.outbox.drain(..).collect()
    }

    /// Whether the server rejected one of our submissions.
    pub fn is_diverged(&self) -> bool {
        self.diverged
    }

    /// Feed one server message into the replica.
    pub fn receive(&mut self, message: ServerMessage) -> Result<(), ReceiveError> {
        match message {
            ServerMessage::Ack { version } => {
                if self.inflight.take().is_some() {
                    self.acknowledged += 1;
                } else {
                    log::warn!("Ack for version {version} with nothing in flight");
                }
                self.version = version;
                self.flush();
            }
            ServerMessage::Op { version, ops, participant } => {
                if version <= self.version {
                    log::debug!("Dropping duplicate operation at version {version}");
                    return Ok(());
                }
                if version != self.version + 1 {
                    log::warn!("Version gap: at {}, received {version}", self.version);
                }
                let mut incoming = ops;
                if let Some(inflight) = self.inflight.take() {
                    let (inflight, rebased) = ot::transform_x(&inflight, &incoming);
                    self.inflight = Some(inflight);
                    incoming = rebased;
                }
                for pending in self.pending.iter_mut() {
                    let (local, rebased) = ot::transform_x(pending, &incoming);
                    *pending = local;
                    incoming = rebased;
                }
                ot::apply(&mut self.snapshot, &incoming)?;
                self.version = version;
                self.emit(incoming, Source::Remote(participant));
            }
            ServerMessage::Error { message } => {
                if self.inflight.take().is_none() {
                    log::warn!("Server error on {}: {message}", self.doc_id);
                    return Ok(());
                }
                log::warn!(
                    "Server rejected operation on {} ({} pending dropped): {message}",
                    self.doc_id,
                    self.pending.len()
                );
                self.pending.clear();
                self.outbox.retain(|queued| !matches!(queued, ClientMessage::Submit { .. }));
                self.diverged = true;
                return Err(ReceiveError::Rejected(message));
            }
            other => {
                log::debug!("Unhandled message in replica: {other:?}");
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        if self.inflight.is_some() || self.diverged {
            return;
        }
        if let Some(ops) = self.pending.pop_front() {
            self.outbox.push_back(ClientMessage::Submit {
                version: self.version,
                ops: ops.clone(),
            });
            self.inflight = Some(ops);
        }
    }

    fn emit(&mut self, ops: Vec<Component>, source: Source) {
        if ops.is_empty() {
            return;
        }
        let event = DocEvent { ops, source };
        for (_, queue) in self.listeners.iter_mut() {
            queue.push_back(event.clone());
        }
    }
}

impl RemoteDocument for Replica {
    fn subscribe(&mut self) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, VecDeque::new()));
        id
    }

    fn unsubscribe(&mut self, listener: ListenerId) {
        self.listeners.retain(|(id, _)| *id != listener);
    }

    fn submit_operation(&mut self, ops: Vec<Component>, source: SourceId) -> Result<(), SubmitError> {
        if ops.is_empty() {
            return Ok(());
        }
        if self.diverged {
            return Err(SubmitError::Diverged);
        }
        ot::apply(&mut self.snapshot, &ops)?;
        self.submitted += 1;
        self.emit(ops.clone(), Source::Local(source));
        self.pending.push_back(ops);
        self.flush();
        Ok(())
    }

    fn get_data(&self) -> &Value {
        &self.snapshot
    }

    fn take_events(&mut self, listener: ListenerId) -> Vec<DocEvent> {
        self.listeners
            .iter_mut()
            .find(|(id, _)| *id == listener)
            .map(|(_, queue)| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn submitted(&self) -> u64 {
        self.submitted
    }

    fn acknowledged(&self) -> u64 {
        self.acknowledged
    }
}

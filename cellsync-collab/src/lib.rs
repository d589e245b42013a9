//! # cellsync-collab: keeps a local notebook editor in sync with a shared document
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── Session ────────────────────────────┐
//! │ NotebookEditor ◄──► DocumentBinding ──► UnitBinding (per unit)  │
//! │                          │                   │                  │
//! │ PresenceRenderer ◄── PresenceTracker         │                  │
//! │                          ▼                   ▼                  │
//! │                       Replica (optimistic, one op in flight)    │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │  JSON frames over WebSocket
//!                                ▼
//!                  SyncServer room: Authority + BroadcastGroup
//! ```
//!
//! ## Modules
//!
//! - [`host`]: editor adapter traits and an in-memory notebook
//! - [`replica`]: client-side document handle bindings submit through
//! - [`binding`]: unit text binding and whole-document binding
//! - [`presence`]: remote cursor tracking and indicators
//! - [`session`]: one participant, wired together
//! - [`authority`]: server-side operation log
//! - [`protocol`]: JSON wire messages
//! - [`broadcast`]: room fan-out
//! - [`server`]: WebSocket sync server
//! - [`client`]: join/create handshake and connection
//! - [`loopback`]: in-process server with explicit delivery

pub mod authority;
pub mod binding;
pub mod broadcast;
pub mod client;
pub mod host;
pub mod loopback;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use authority::{Authority, AuthorityError};
pub use binding::{DocumentBinding, UnitBinding, EXECUTION_SETTLE_DELAY};
pub use broadcast::{BroadcastGroup, BroadcastStats, Commit};
pub use client::{create, join, Connection, ConnectionState, JoinError};
pub use host::{EditorEvent, HeadlessNotebook, NotebookEditor, Provenance, TextBuffer, TextDelta, TextSurface};
pub use loopback::LoopbackHub;
pub use presence::{CursorColor, Indicator, Indicators, PresenceRenderer, PresenceTracker};
pub use protocol::{ClientMessage, DocumentId, ParticipantInfo, ProtocolError, ServerMessage};
pub use replica::{DocEvent, ReceiveError, RemoteDocument, Replica, Source, SourceId, SubDocument, SubmitError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionConfig, SessionError};

//! One participant's end of a shared notebook.
//!
//! A [`Session`] owns the replica, the document binding and the presence
//! tracker, and runs every handler to completion before returning. After
//! each local action or server message it pumps: editor events and replica
//! events are drained until neither produces anything new, then the batch
//! is closed (text verification, host vacancy check).

use std::time::{Duration, Instant};

use cellsync_core::ParticipantId;

use crate::binding::{DocumentBinding, EXECUTION_SETTLE_DELAY};
use crate::host::{EditorEvent, NotebookEditor, Provenance};
use crate::presence::{Indicators, PresenceRenderer, PresenceTracker};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::replica::{ReceiveError, Replica, SubmitError};

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub display_name: String,
    /// Delay before the host publishes an execution result.
    pub execution_settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            execution_settle_delay: EXECUTION_SETTLE_DELAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    /// The server refused or could not be followed. A rejection means the
    /// session must rejoin the document to resync.
    #[error(transparent)]
    Receive(#[from] ReceiveError),
}

pub struct Session<E: NotebookEditor, R: PresenceRenderer = Indicators> {
    config: SessionConfig,
    replica: Replica,
    document: DocumentBinding<E>,
    presence: PresenceTracker<R>,
}

impl<E: NotebookEditor> Session<E> {
    pub fn new(replica: Replica, editor: E, config: SessionConfig) -> Self {
        Self::with_renderer(replica, editor, Indicators::new(), config)
    }
}

impl<E: NotebookEditor, R: PresenceRenderer> Session<E, R> {
    pub fn with_renderer(replica: Replica, editor: E, renderer: R, config: SessionConfig) -> Self {
        let participant = replica.participant();
        Self {
            document: DocumentBinding::new(participant, editor).with_settle_delay(config.execution_settle_delay),
            presence: PresenceTracker::new(participant, renderer),
            replica,
            config,
        }
    }

    /// Bind the document and announce this participant.
    pub fn start(&mut self) -> Result<(), SessionError> {
        log::info!(
            "Starting session for {} ({}) on {}",
            self.config.display_name,
            self.replica.participant(),
            self.replica.doc_id()
        );
        self.document.start(&mut self.replica)?;
        self.presence.start(&mut self.replica);
        self.pump()
    }

    pub fn participant(&self) -> ParticipantId {
        self.replica.participant()
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn document(&self) -> &DocumentBinding<E> {
        &self.document
    }

    pub fn presence(&self) -> &PresenceTracker<R> {
        &self.presence
    }

    pub fn editor(&self) -> &E {
        self.document.editor()
    }

    /// Mutable editor access for simulating user actions. Call
    /// [`Session::pump`] afterwards so the raised events are handled.
    pub fn editor_mut(&mut self) -> &mut E {
        self.document.editor_mut()
    }

    pub fn is_host(&self) -> bool {
        self.document.is_host()
    }

    /// No local operation is waiting for the server.
    pub fn is_settled(&self) -> bool {
        !self.replica.has_unacknowledged()
    }

    /// Messages for the server, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        self.replica.take_outgoing()
    }

    /// Handle an event pushed by an editor that does not queue its own.
    pub fn handle_editor_event(
        &mut self,
        event: EditorEvent<E::Surface>,
        provenance: Provenance,
    ) -> Result<(), SessionError> {
        self.document.on_editor_event(&mut self.replica, event, provenance, Instant::now())?;
        self.pump()
    }

    /// Submit the recorded text changes of unit `index`.
    pub fn handle_text_change(&mut self, index: usize) -> Result<(), SessionError> {
        self.document.sync_text(&mut self.replica, index)?;
        self.pump()
    }

    pub fn handle_cursor(
        &mut self,
        unit_index: usize,
        range_start: usize,
        range_end: usize,
        surface_active: bool,
    ) -> Result<(), SessionError> {
        self.presence
            .on_local_cursor(&mut self.replica, unit_index, range_start, range_end, surface_active)?;
        self.pump()
    }

    pub fn mouse_down(&mut self) {
        self.presence.on_mouse_down();
    }

    pub fn mouse_up(&mut self) -> Result<(), SessionError> {
        self.presence.on_mouse_up(&mut self.replica)?;
        self.pump()
    }

    /// Feed one server message.
    ///
    /// Unsynced local text is submitted first so the incoming operation is
    /// transformed against it.
    pub fn receive(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        self.document.sync_all(&mut self.replica)?;
        self.pump()?;
        self.replica.receive(message)?;
        self.pump()
    }

    /// Publish execution results whose settle delay has passed.
    pub fn tick(&mut self, now: Instant) -> Result<(), SessionError> {
        self.document.tick(&mut self.replica, now)?;
        self.pump()
    }

    /// Remove this participant from the document. The caller should keep
    /// delivering outgoing messages until [`Session::is_settled`].
    pub fn leave(&mut self) -> Result<(), SessionError> {
        self.document.sync_all(&mut self.replica)?;
        self.pump()?;
        self.presence.leave(&mut self.replica)?;
        self.document.leave(&mut self.replica)?;
        Ok(())
    }

    /// Drain editor and replica events until quiet, then close the batch.
    pub fn pump(&mut self) -> Result<(), SessionError> {
        loop {
            let events = self.document.editor_mut().drain_events();
            let mut progressed = !events.is_empty();
            for (event, provenance) in events {
                self.document.on_editor_event(&mut self.replica, event, provenance, Instant::now())?;
            }
            progressed |= self.document.process_events(&mut self.replica)?;
            progressed |= self.presence.process_events(&mut self.replica);
            if progressed {
                continue;
            }
            if !self.document.finish_batch(&mut self.replica)? {
                return Ok(());
            }
        }
    }
}

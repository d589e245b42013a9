//! Text synchronization for one unit.

use cellsync_core::ot::{char_len, Component};
use cellsync_core::paths;
use serde_json::Value;

use crate::host::{TextDelta, TextSurface};
use crate::replica::{RemoteDocument, Source, SourceId, SubDocument, SubmitError};

/// Binds one unit's editable text to `[units, index, source]`.
///
/// Local deltas become text components tagged with this binding's
/// [`SourceId`]; remote text components are spliced into the surface with
/// echo suppression on. Any divergence left afterwards is repaired by
/// overwriting the surface with the authoritative text.
pub struct UnitBinding<S> {
    source: SourceId,
    index: usize,
    sub: Option<SubDocument>,
    surface: S,
    suppressed: bool,
    needs_check: bool,
}

impl<S: TextSurface> UnitBinding<S> {
    pub fn new<D: RemoteDocument>(doc: &D, index: usize, surface: S) -> Self {
        Self {
            source: SourceId::next(),
            index,
            sub: Some(doc.sub_document(paths::unit_source(index))),
            surface,
            suppressed: false,
            needs_check: false,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn text(&self) -> String {
        self.surface.value()
    }

    pub fn is_destroyed(&self) -> bool {
        self.sub.is_none()
    }

    /// Submit one local change.
    pub fn on_local_text_change<D: RemoteDocument>(
        &mut self,
        doc: &mut D,
        delta: &TextDelta,
    ) -> Result<(), SubmitError> {
        if self.suppressed {
            return Ok(());
        }
        debug_assert!(self.sub.is_some(), "text change on a destroyed binding");
        let Some(sub) = &self.sub else {
            log::error!("Dropping text change on destroyed binding for unit {}", self.index);
            return Err(SubmitError::BindingDestroyed);
        };
        let path = sub.path().clone();
        let mut ops = Vec::with_capacity(2);
        if !delta.removed.is_empty() {
            ops.push(Component::TextDelete {
                path: path.clone(),
                offset: delta.from,
                text: delta.removed.clone(),
            });
        }
        if !delta.inserted.is_empty() {
            ops.push(Component::TextInsert {
                path,
                offset: delta.from,
                text: delta.inserted.clone(),
            });
        }
        doc.submit_operation(ops, self.source)
    }

    /// Submit every change the surface has recorded since the last sync.
    pub fn sync_local<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        for delta in self.surface.drain_changes() {
            self.on_local_text_change(doc, &delta)?;
        }
        Ok(())
    }

    /// Replay remote text components onto the surface.
    ///
    /// The equality check runs later, once the whole batch of remote
    /// events has been applied, via [`UnitBinding::verify`].
    pub fn on_remote_operation(&mut self, ops: &[Component], source: Source) {
        if source.is_local(self.source) {
            return;
        }
        self.suppressed = true;
        for component in ops {
            match component {
                Component::TextInsert { offset, text, .. } => {
                    self.surface.replace_range(text, *offset, *offset);
                }
                Component::TextDelete { offset, text, .. } => {
                    self.surface.replace_range("", *offset, offset + char_len(text));
                }
                _ => {}
            }
        }
        // Our own replay shows up as surface changes; they must not echo.
        for delta in self.surface.drain_changes() {
            log::trace!("Suppressed echo of replayed change at {} on unit {}", delta.from, self.index);
        }
        self.suppressed = false;
        self.needs_check = true;
    }

    /// Compare the surface with the authoritative text; overwrite on
    /// mismatch. Returns `true` if a violation was repaired.
    pub fn verify(&mut self, snapshot: &Value) -> bool {
        if !std::mem::take(&mut self.needs_check) {
            return false;
        }
        let Some(expected) = self.sub.as_ref().and_then(|sub| sub.get(snapshot)).and_then(Value::as_str) else {
            return false;
        };
        if self.surface.value() == expected {
            return false;
        }
        log::warn!(
            "Consistency violation on unit {}: local text diverged, overwriting with {} chars",
            self.index,
            char_len(expected)
        );
        self.suppressed = true;
        self.surface.set_value(expected);
        self.surface.drain_changes();
        self.suppressed = false;
        true
    }

    /// Mark for an equality check against the next snapshot.
    pub fn request_check(&mut self) {
        self.needs_check = true;
    }

    /// Follow the unit to a new position.
    pub fn repoint(&mut self, index: usize) {
        self.index = index;
        if let Some(sub) = self.sub.as_mut() {
            sub.repoint(paths::unit_source(index));
        }
    }

    /// Detach from the document. Hands back the surface.
    pub fn destroy(mut self) -> S {
        self.sub = None;
        self.surface
    }
}

//! Structural synchronization of the whole unit list.
//!
//! ```text
//!  editor event ──(provenance)──► DocumentBinding ──► list / field ops ──► replica
//!                                      ▲
//!  replica events ──► classify ────────┘──► editor commands (Replay)
//! ```
//!
//! The binding list mirrors `units` position for position. Every structural
//! change, local or remote, goes through [`DocumentBinding::reindex`] before
//! the next component is looked at.

use std::time::{Duration, Instant};

use cellsync_core::ot::Component;
use cellsync_core::{
    classify, keys, paths, EventCounters, ExecutionCount, OpTag, ParticipantId, SharedDocument, Unit,
};
use serde_json::Value;

use crate::binding::unit::UnitBinding;
use crate::host::{EditorEvent, NotebookEditor, Provenance, TextSurface};
use crate::replica::{ListenerId, RemoteDocument, Source, SourceId, SubmitError};

/// How long the host waits after an execution finishes before publishing
/// its count and outputs, so the editor's own prompt numbering has settled.
pub const EXECUTION_SETTLE_DELAY: Duration = Duration::from_millis(100);

pub struct DocumentBinding<E: NotebookEditor> {
    participant: ParticipantId,
    source: SourceId,
    listener: Option<ListenerId>,
    editor: E,
    bindings: Vec<UnitBinding<E::Surface>>,
    counters: EventCounters,
    host: Option<ParticipantId>,
    participants: Vec<ParticipantId>,
    /// Editor placeholder held back after a remote delete emptied the list.
    placeholder: Option<(Unit, E::Surface)>,
    /// Set when our own delete emptied the list; the next placeholder is ours.
    expect_placeholder: bool,
    /// Our published placeholder (binding source, submission number) until
    /// the server acknowledges it.
    own_placeholder: Option<(SourceId, u64)>,
    /// Another participant's placeholder committed before ours.
    placeholder_lost: bool,
    pending_publish: Vec<(Instant, SourceId)>,
    settle_delay: Duration,
    violations: u64,
}

impl<E: NotebookEditor> DocumentBinding<E> {
    pub fn new(participant: ParticipantId, editor: E) -> Self {
        Self {
            participant,
            source: SourceId::next(),
            listener: None,
            editor,
            bindings: Vec::new(),
            counters: EventCounters::default(),
            host: None,
            participants: Vec::new(),
            placeholder: None,
            expect_placeholder: false,
            own_placeholder: None,
            placeholder_lost: false,
            pending_publish: Vec::new(),
            settle_delay: EXECUTION_SETTLE_DELAY,
            violations: 0,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn is_host(&self) -> bool {
        self.host == Some(self.participant)
    }

    pub fn host(&self) -> Option<ParticipantId> {
        self.host
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn unit_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn binding(&self, index: usize) -> Option<&UnitBinding<E::Surface>> {
        self.bindings.get(index)
    }

    /// Index each binding believes it has, in list order.
    pub fn binding_indices(&self) -> Vec<usize> {
        self.bindings.iter().map(UnitBinding::index).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.bindings.iter().map(UnitBinding::text).collect()
    }

    /// Consistency violations repaired so far.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn pending_publications(&self) -> usize {
        self.pending_publish.len()
    }

    pub fn has_placeholder(&self) -> bool {
        self.placeholder.is_some()
    }

    /// Bind every unit of the current snapshot, announce ourselves in
    /// `participants`, and claim host if nobody holds it.
    pub fn start<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        self.listener = Some(doc.subscribe());
        let snapshot = doc.get_data().clone();

        for index in 0..SharedDocument::unit_count_of(&snapshot) {
            let unit = SharedDocument::unit_of(&snapshot, index).unwrap_or_else(|| {
                log::warn!("Unit {index} is malformed, binding it as empty code");
                Unit::code("")
            });
            let surface = self.editor.insert_unit(index, &unit);
            self.bindings.push(UnitBinding::new(&*doc, index, surface));
        }

        self.counters = EventCounters {
            render_markdown: SharedDocument::counter_of(&snapshot, keys::RENDER_MARKDOWN),
            unrender_markdown: SharedDocument::counter_of(&snapshot, keys::UNRENDER_MARKDOWN),
        };
        self.host = SharedDocument::host_of(&snapshot);
        self.participants = SharedDocument::participants_of(&snapshot);

        let me = Value::String(self.participant.to_string());
        let announce = match snapshot.get(keys::PARTICIPANTS) {
            Some(Value::Array(list)) => Component::ListInsert {
                path: paths::participant(list.len()),
                value: me,
            },
            other => Component::ObjectReplace {
                path: vec![keys::PARTICIPANTS.into()],
                before: other.cloned(),
                after: Some(Value::Array(vec![me])),
            },
        };
        doc.submit_operation(vec![announce], self.source)?;
        self.participants.push(self.participant);

        log::info!(
            "Participant {} bound {} units (host: {:?})",
            self.participant,
            self.bindings.len(),
            self.host
        );
        self.claim_host_if_vacant(doc)?;
        Ok(())
    }

    /// Handle one editor event.
    ///
    /// Replay and kind-change rebuild events are the editor echoing our own
    /// commands and are ignored. A placeholder is published only when our
    /// own delete caused it.
    pub fn on_editor_event<D: RemoteDocument>(
        &mut self,
        doc: &mut D,
        event: EditorEvent<E::Surface>,
        provenance: Provenance,
        now: Instant,
    ) -> Result<(), SubmitError> {
        match provenance {
            Provenance::Replay | Provenance::KindChange => {
                log::trace!("Ignoring {provenance:?} editor event");
                return Ok(());
            }
            Provenance::Placeholder => return self.on_placeholder(doc, event),
            Provenance::User => {}
        }

        match event {
            EditorEvent::UnitCreated { index, unit, surface } => {
                self.materialize_placeholder(doc)?;
                self.local_insert(doc, index, unit, surface)
            }
            EditorEvent::UnitDeleted { index, .. } => {
                self.materialize_placeholder(doc)?;
                self.local_delete(doc, index)
            }
            EditorEvent::KindChanged { index, unit, surface } => {
                self.materialize_placeholder(doc)?;
                self.local_kind_change(doc, index, unit, surface)
            }
            EditorEvent::ExecuteRequested { index } => self.request_execution(doc, index),
            EditorEvent::ExecutionFinished { index } => {
                if self.is_host() {
                    if let Some(binding) = self.bindings.get(index) {
                        self.pending_publish.push((now + self.settle_delay, binding.source()));
                    }
                }
                Ok(())
            }
            EditorEvent::MarkdownRendered { index } => {
                self.signal_counter(doc, keys::RENDER_MARKDOWN, index)
            }
            EditorEvent::MarkdownUnrendered { index } => {
                self.signal_counter(doc, keys::UNRENDER_MARKDOWN, index)
            }
        }
    }

    /// Submit the text changes recorded on unit `index`.
    pub fn sync_text<D: RemoteDocument>(&mut self, doc: &mut D, index: usize) -> Result<(), SubmitError> {
        if self.placeholder.is_some() && index == 0 {
            self.materialize_placeholder(doc)?;
        }
        match self.bindings.get_mut(index) {
            Some(binding) => binding.sync_local(doc),
            None => Ok(()),
        }
    }

    pub fn sync_all<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        for binding in self.bindings.iter_mut() {
            binding.sync_local(doc)?;
        }
        Ok(())
    }

    /// Replay queued document events. Returns whether there were any.
    pub fn process_events<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<bool, SubmitError> {
        let Some(listener) = self.listener else {
            return Ok(false);
        };
        let events = doc.take_events(listener);
        if events.is_empty() {
            return Ok(false);
        }
        for event in events {
            if event.source.is_local(self.source) {
                continue;
            }
            for component in &event.ops {
                self.replay(&*doc, component, event.source);
            }
        }
        if std::mem::take(&mut self.placeholder_lost) {
            self.drop_own_placeholder(doc)?;
        }
        Ok(true)
    }

    /// End of a replay batch: repair diverged text, then claim host if it
    /// is vacant. Returns whether an operation was submitted.
    pub fn finish_batch<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<bool, SubmitError> {
        let snapshot = doc.get_data();
        for binding in self.bindings.iter_mut() {
            if binding.verify(snapshot) {
                self.violations += 1;
            }
        }
        if self.listener.is_none() {
            return Ok(false);
        }
        if matches!(self.own_placeholder, Some((_, ticket)) if doc.acknowledged() >= ticket) {
            self.own_placeholder = None;
        }
        self.claim_host_if_vacant(doc)
    }

    /// Publish count and outputs of executions whose settle delay is over.
    pub fn tick<D: RemoteDocument>(&mut self, doc: &mut D, now: Instant) -> Result<(), SubmitError> {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.pending_publish.drain(..).partition(|(deadline, _)| *deadline <= now);
        self.pending_publish = waiting;
        for (_, source) in due {
            match self.bindings.iter().position(|b| b.source() == source) {
                Some(index) => self.publish_execution(doc, index)?,
                None => log::debug!("Executed unit was removed before its result was published"),
            }
        }
        Ok(())
    }

    /// Remove ourselves from `participants`, release host, and unbind.
    pub fn leave<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        let snapshot = doc.get_data();
        let me = Value::String(self.participant.to_string());
        let mut ops = Vec::new();
        if let Some(pos) = SharedDocument::participants_of(snapshot)
            .iter()
            .position(|p| *p == self.participant)
        {
            ops.push(Component::ListDelete { path: paths::participant(pos), value: me.clone() });
        }
        if SharedDocument::host_of(snapshot) == Some(self.participant) {
            ops.push(Component::ObjectReplace {
                path: paths::host(),
                before: Some(me),
                after: Some(Value::Null),
            });
        }
        doc.submit_operation(ops, self.source)?;

        if let Some(listener) = self.listener.take() {
            doc.unsubscribe(listener);
        }
        for binding in self.bindings.drain(..) {
            binding.destroy();
        }
        self.host = None;
        log::info!("Participant {} left", self.participant);
        Ok(())
    }

    // ── Local → remote ──────────────────────────────────────────

    fn local_insert<D: RemoteDocument>(
        &mut self,
        doc: &mut D,
        index: usize,
        unit: Unit,
        mut surface: E::Surface,
    ) -> Result<(), SubmitError> {
        let index = index.min(self.bindings.len());
        surface.drain_changes();
        let value = Unit { source: surface.value(), ..unit }.to_value();
        doc.submit_operation(vec![Component::ListInsert { path: paths::unit(index), value }], self.source)?;
        self.bindings.insert(index, UnitBinding::new(&*doc, index, surface));
        self.reindex(index + 1);
        Ok(())
    }

    fn local_delete<D: RemoteDocument>(&mut self, doc: &mut D, index: usize) -> Result<(), SubmitError> {
        if index >= self.bindings.len() {
            log::warn!("Delete of unknown unit {index}");
            return Ok(());
        }
        let value = doc.get_data()[keys::UNITS][index].clone();
        self.bindings.remove(index).destroy();
        self.reindex(index);
        doc.submit_operation(vec![Component::ListDelete { path: paths::unit(index), value }], self.source)?;
        if self.bindings.is_empty() {
            self.expect_placeholder = true;
        }
        Ok(())
    }

    /// A kind change is one list replace: the old unit out, the new one in.
    fn local_kind_change<D: RemoteDocument>(
        &mut self,
        doc: &mut D,
        index: usize,
        unit: Unit,
        mut surface: E::Surface,
    ) -> Result<(), SubmitError> {
        if index >= self.bindings.len() {
            log::warn!("Kind change of unknown unit {index}");
            return Ok(());
        }
        surface.drain_changes();
        let before = doc.get_data()[keys::UNITS][index].clone();
        let after = Unit { source: surface.value(), ..unit }.to_value();
        doc.submit_operation(
            vec![Component::ListReplace { path: paths::unit(index), before, after }],
            self.source,
        )?;
        let old = std::mem::replace(&mut self.bindings[index], UnitBinding::new(&*doc, index, surface));
        old.destroy();
        Ok(())
    }

    fn request_execution<D: RemoteDocument>(&mut self, doc: &mut D, index: usize) -> Result<(), SubmitError> {
        if index >= self.bindings.len() {
            return Ok(());
        }
        if self.is_host() {
            self.editor.execute_unit(index);
            return Ok(());
        }
        let before = doc.get_data()[keys::UNITS][index].get(keys::EXECUTION_COUNT).cloned();
        doc.submit_operation(
            vec![Component::ObjectReplace {
                path: paths::unit_field(index, keys::EXECUTION_COUNT),
                before,
                after: Some(ExecutionCount::Pending.to_value()),
            }],
            self.source,
        )?;
        self.editor.set_execution_count(index, Some(ExecutionCount::Pending));
        log::debug!("Forwarded execution of unit {index} to host {:?}", self.host);
        Ok(())
    }

    fn publish_execution<D: RemoteDocument>(&mut self, doc: &mut D, index: usize) -> Result<(), SubmitError> {
        let (count, outputs) = self.editor.execution_result(index);
        let unit = &doc.get_data()[keys::UNITS][index];
        let ops = vec![
            Component::ObjectReplace {
                path: paths::unit_field(index, keys::EXECUTION_COUNT),
                before: unit.get(keys::EXECUTION_COUNT).cloned(),
                after: Some(count.map_or(Value::Null, ExecutionCount::to_value)),
            },
            Component::ObjectReplace {
                path: paths::unit_field(index, keys::OUTPUTS),
                before: unit.get(keys::OUTPUTS).cloned(),
                after: Some(Value::Array(outputs)),
            },
        ];
        doc.submit_operation(ops, self.source)
    }

    /// Encode "unit `index`" as the counter delta `index - previous`.
    fn signal_counter<D: RemoteDocument>(&mut self, doc: &mut D, key: &str, index: usize) -> Result<(), SubmitError> {
        let slot = self.counter_mut(key);
        let delta = (index as i64).saturating_sub(*slot);
        *slot = index as i64;
        doc.submit_operation(vec![Component::NumberAdd { path: paths::counter(key), delta }], self.source)
    }

    fn counter_mut(&mut self, key: &str) -> &mut i64 {
        if key == keys::RENDER_MARKDOWN {
            &mut self.counters.render_markdown
        } else {
            &mut self.counters.unrender_markdown
        }
    }

    fn on_placeholder<D: RemoteDocument>(
        &mut self,
        doc: &mut D,
        event: EditorEvent<E::Surface>,
    ) -> Result<(), SubmitError> {
        let EditorEvent::UnitCreated { unit, surface, .. } = event else {
            return Ok(());
        };
        if std::mem::take(&mut self.expect_placeholder) {
            log::debug!("Publishing placeholder after deleting the last unit");
            self.local_insert(doc, 0, unit, surface)?;
            if let Some(binding) = self.bindings.first() {
                self.own_placeholder = Some((binding.source(), doc.submitted()));
            }
            Ok(())
        } else {
            log::debug!("Holding editor placeholder until a unit arrives");
            self.placeholder = Some((unit, surface));
            Ok(())
        }
    }

    /// Two participants emptied the list at once and both published a
    /// placeholder. The one whose insert is still unacknowledged when the
    /// other's arrives committed second and removes its own.
    fn note_concurrent_placeholder<D: RemoteDocument>(&mut self, doc: &D) {
        let Some((_, ticket)) = self.own_placeholder else {
            return;
        };
        if doc.acknowledged() < ticket {
            self.placeholder_lost = true;
        } else {
            self.own_placeholder = None;
        }
    }

    fn drop_own_placeholder<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        let Some((source, _)) = self.own_placeholder.take() else {
            return Ok(());
        };
        let Some(index) = self.bindings.iter().position(|b| b.source() == source) else {
            return Ok(());
        };
        if self.bindings.len() < 2 || !self.bindings[index].text().is_empty() {
            return Ok(());
        }
        log::debug!("A concurrent placeholder committed first, dropping ours at {index}");
        self.editor.delete_unit(index);
        self.local_delete(doc, index)
    }

    fn materialize_placeholder<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        match self.placeholder.take() {
            Some((unit, surface)) => self.local_insert(doc, 0, unit, surface),
            None => Ok(()),
        }
    }

    fn claim_host_if_vacant<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<bool, SubmitError> {
        let snapshot = doc.get_data();
        if SharedDocument::host_of(snapshot).is_some() {
            return Ok(false);
        }
        let before = snapshot.get(keys::HOST).cloned();
        doc.submit_operation(
            vec![Component::ObjectReplace {
                path: paths::host(),
                before,
                after: Some(Value::String(self.participant.to_string())),
            }],
            self.source,
        )?;
        log::info!("Participant {} claimed host", self.participant);
        self.set_host(Some(self.participant));
        Ok(true)
    }

    fn set_host(&mut self, host: Option<ParticipantId>) {
        if self.host != host {
            log::info!("Host changed to {host:?} (local is host: {})", host == Some(self.participant));
        }
        self.host = host;
    }

    // ── Remote → local ──────────────────────────────────────────

    fn replay<D: RemoteDocument>(&mut self, doc: &D, component: &Component, source: Source) {
        let tag = classify(component);
        log::trace!("Replaying {tag:?} from {source:?}");
        match tag {
            OpTag::TextEdited { index } => match self.bindings.get_mut(index) {
                Some(binding) => {
                    if let Source::Local(id) = source {
                        if id != binding.source() {
                            log::debug!("Local text edit for unit {index} from another binding");
                            return;
                        }
                    }
                    binding.on_remote_operation(std::slice::from_ref(component), source);
                }
                None => log::warn!("Text edit for unknown unit {index}"),
            },
            OpTag::UnitInserted { index } => {
                let unit = match component {
                    Component::ListInsert { value, .. } => unit_from(value, index),
                    _ => return,
                };
                if matches!(source, Source::Remote(_)) && unit.source.is_empty() {
                    self.note_concurrent_placeholder(doc);
                }
                self.remote_insert(doc, index, unit);
            }
            OpTag::UnitDeleted { index } => self.remote_delete(index),
            OpTag::UnitKindChanged { index } => {
                let unit = match component {
                    Component::ListReplace { after, .. } => unit_from(after, index),
                    _ => match SharedDocument::unit_of(doc.get_data(), index) {
                        Some(unit) => unit,
                        None => return,
                    },
                };
                self.remote_kind_change(doc, index, unit);
            }
            OpTag::ExecutionCountChanged { index } => {
                let count = match component {
                    Component::ObjectReplace { after, .. } => {
                        after.as_ref().and_then(ExecutionCount::from_value)
                    }
                    _ => None,
                };
                if count == Some(ExecutionCount::Pending) && self.is_host() {
                    log::debug!("Executing unit {index} on behalf of a participant");
                    self.editor.execute_unit(index);
                } else {
                    self.editor.set_execution_count(index, count);
                }
            }
            OpTag::OutputsChanged { index } => {
                let outputs = match component {
                    Component::ObjectReplace { after: Some(Value::Array(outputs)), path, .. }
                        if path.len() == 3 =>
                    {
                        outputs.clone()
                    }
                    _ => doc.get_data()[keys::UNITS][index][keys::OUTPUTS]
                        .as_array()
                        .cloned()
                        .unwrap_or_default(),
                };
                self.editor.set_outputs(index, &outputs);
            }
            OpTag::MarkdownRendered | OpTag::MarkdownUnrendered => {
                let Component::NumberAdd { delta, .. } = component else { return };
                let render = tag == OpTag::MarkdownRendered;
                let key = if render { keys::RENDER_MARKDOWN } else { keys::UNRENDER_MARKDOWN };
                let slot = self.counter_mut(key);
                *slot += delta;
                let target = *slot;
                match usize::try_from(target) {
                    Ok(index) if index < self.editor.unit_count() => {
                        if render {
                            self.editor.render_markdown(index);
                        } else {
                            self.editor.unrender_markdown(index);
                        }
                    }
                    _ => log::debug!("Counter {key} points outside the document ({target})"),
                }
            }
            OpTag::ParticipantJoined { index } => {
                if let Component::ListInsert { value, .. } = component {
                    if let Some(id) = value.as_str().and_then(|s| s.parse().ok()) {
                        log::info!("Participant {id} joined");
                        let at = index.min(self.participants.len());
                        self.participants.insert(at, id);
                    }
                }
            }
            OpTag::ParticipantLeft { index } => {
                if index < self.participants.len() {
                    let id = self.participants.remove(index);
                    log::info!("Participant {id} left");
                }
            }
            OpTag::HostChanged => {
                let host = match component {
                    Component::ObjectReplace { after, .. } => {
                        after.as_ref().and_then(Value::as_str).and_then(|s| s.parse().ok())
                    }
                    _ => None,
                };
                self.set_host(host);
            }
            OpTag::Other => {}
        }
    }

    fn remote_insert<D: RemoteDocument>(&mut self, doc: &D, index: usize, unit: Unit) {
        let index = index.min(self.bindings.len());
        let surface = self.editor.insert_unit(index, &unit);
        let mut binding = UnitBinding::new(doc, index, surface);
        binding.request_check();
        self.bindings.insert(index, binding);
        self.reindex(index + 1);
        if self.placeholder.take().is_some() {
            // The editor's placeholder now sits right after the bound units.
            log::debug!("Dropping editor placeholder in favour of unit {index}");
            self.editor.delete_unit(self.bindings.len());
        }
    }

    fn remote_delete(&mut self, index: usize) {
        if index >= self.bindings.len() {
            log::warn!("Remote delete of unknown unit {index}");
            return;
        }
        self.bindings.remove(index).destroy();
        self.reindex(index);
        self.editor.delete_unit(index);
    }

    fn remote_kind_change<D: RemoteDocument>(&mut self, doc: &D, index: usize, unit: Unit) {
        if index >= self.bindings.len() {
            log::warn!("Remote kind change of unknown unit {index}");
            return;
        }
        let surface = self.editor.change_kind(index, &unit);
        let mut binding = UnitBinding::new(doc, index, surface);
        binding.request_check();
        std::mem::replace(&mut self.bindings[index], binding).destroy();
    }

    /// Re-point every binding from `from` on to its list position.
    fn reindex(&mut self, from: usize) {
        for (position, binding) in self.bindings.iter_mut().enumerate().skip(from) {
            binding.repoint(position);
        }
    }
}

fn unit_from(value: &Value, index: usize) -> Unit {
    Unit::from_value(value).unwrap_or_else(|e| {
        log::warn!("Unit {index} arrived malformed ({e}), treating it as code");
        Unit::code(value.get(keys::SOURCE).and_then(Value::as_str).unwrap_or_default())
    })
}

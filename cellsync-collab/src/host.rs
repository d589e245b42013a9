//! Adapter traits for the local editor, plus an in-memory implementation.
//!
//! The bindings never reach into editor internals. They consume
//! [`EditorEvent`]s, each tagged with a [`Provenance`], and drive the editor
//! through [`NotebookEditor`] commands. Every unit's editable text is a
//! [`TextSurface`] handle owned by its binding.

use std::cell::RefCell;
use std::rc::Rc;

use cellsync_core::ot::char_to_byte;
use cellsync_core::{ExecutionCount, Unit, UnitKind};
use serde_json::{json, Value};

/// Why an editor event happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The local user did it.
    User,
    /// A binding replayed a remote operation through an editor command.
    Replay,
    /// The editor rebuilt a unit while changing its kind.
    KindChange,
    /// The editor auto-inserted a unit after its last one was removed.
    Placeholder,
}

#[derive(Debug, Clone)]
pub enum EditorEvent<S> {
    UnitCreated { index: usize, unit: Unit, surface: S },
    UnitDeleted { index: usize, unit: Unit },
    KindChanged { index: usize, unit: Unit, surface: S },
    ExecuteRequested { index: usize },
    ExecutionFinished { index: usize },
    MarkdownRendered { index: usize },
    MarkdownUnrendered { index: usize },
}

/// One keystroke-level change, in character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub from: usize,
    pub removed: String,
    pub inserted: String,
}

/// The editable text region of one unit.
pub trait TextSurface {
    fn value(&self) -> String;

    fn set_value(&mut self, text: &str);

    /// Replace the characters `from..to` with `text`.
    fn replace_range(&mut self, text: &str, from: usize, to: usize);

    /// Changes made since the last drain, oldest first.
    fn drain_changes(&mut self) -> Vec<TextDelta>;
}

/// Commands and event stream of the notebook editor.
pub trait NotebookEditor {
    type Surface: TextSurface;

    fn unit_count(&self) -> usize;

    fn insert_unit(&mut self, index: usize, unit: &Unit) -> Self::Surface;

    /// Remove a unit. Removing the last one makes the editor insert a
    /// placeholder, announced as a [`Provenance::Placeholder`] event.
    fn delete_unit(&mut self, index: usize);

    /// Rebuild the unit at `index` with `unit`'s kind and source.
    fn change_kind(&mut self, index: usize, unit: &Unit) -> Self::Surface;

    fn execute_unit(&mut self, index: usize);

    /// Execution count and outputs as the editor currently shows them.
    fn execution_result(&self, index: usize) -> (Option<ExecutionCount>, Vec<Value>);

    fn set_execution_count(&mut self, index: usize, count: Option<ExecutionCount>);

    fn set_outputs(&mut self, index: usize, outputs: &[Value]);

    fn render_markdown(&mut self, index: usize);

    fn unrender_markdown(&mut self, index: usize);

    /// Events raised since the last drain.
    fn drain_events(&mut self) -> Vec<(EditorEvent<Self::Surface>, Provenance)> {
        Vec::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory text buffer
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BufferState {
    text: String,
    changes: Vec<TextDelta>,
}

/// Shared handle to an in-memory text region. Clones see the same text.
#[derive(Debug, Clone, Default)]
pub struct TextBuffer {
    state: Rc<RefCell<BufferState>>,
}

impl TextBuffer {
    pub fn new(text: &str) -> Self {
        Self {
            state: Rc::new(RefCell::new(BufferState {
                text: text.to_string(),
                changes: Vec::new(),
            })),
        }
    }

    /// Insert at a character offset, as a user typing would.
    pub fn type_at(&mut self, offset: usize, text: &str) {
        self.replace_range(text, offset, offset);
    }

    /// Delete the characters `from..to`, as a user would.
    pub fn erase(&mut self, from: usize, to: usize) {
        self.replace_range("", from, to);
    }
}

impl TextSurface for TextBuffer {
    fn value(&self) -> String {
        self.state.borrow().text.clone()
    }

    fn set_value(&mut self, text: &str) {
        let mut state = self.state.borrow_mut();
        let removed = std::mem::replace(&mut state.text, text.to_string());
        state.changes.push(TextDelta {
            from: 0,
            removed,
            inserted: text.to_string(),
        });
    }

    fn replace_range(&mut self, text: &str, from: usize, to: usize) {
        let mut state = self.state.borrow_mut();
        let len = state.text.len();
        let start = char_to_byte(&state.text, from).unwrap_or(len);
        let end = char_to_byte(&state.text, to.max(from)).unwrap_or(len);
        let removed = state.text[start..end].to_string();
        state.text.replace_range(start..end, text);
        state.changes.push(TextDelta {
            from,
            removed,
            inserted: text.to_string(),
        });
    }

    fn drain_changes(&mut self) -> Vec<TextDelta> {
        std::mem::take(&mut self.state.borrow_mut().changes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Headless notebook
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Cell {
    unit: Unit,
    surface: TextBuffer,
}

/// An editor without a screen: keeps units in memory, executes by
/// numbering, and records the events a real editor would raise.
///
/// Commands issued by bindings raise [`Provenance::Replay`] events; the
/// `user_*` methods raise [`Provenance::User`] ones.
#[derive(Debug, Default)]
pub struct HeadlessNotebook {
    cells: Vec<Cell>,
    execution_counter: u64,
    executed: Vec<usize>,
    events: Vec<(EditorEvent<TextBuffer>, Provenance)>,
}

impl HeadlessNotebook {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unit at `index` with its current text.
    pub fn unit(&self, index: usize) -> Option<Unit> {
        self.cells.get(index).map(|cell| Unit {
            source: cell.surface.value(),
            ..cell.unit.clone()
        })
    }

    pub fn units(&self) -> Vec<Unit> {
        (0..self.cells.len()).filter_map(|i| self.unit(i)).collect()
    }

    pub fn sources(&self) -> Vec<String> {
        self.cells.iter().map(|cell| cell.surface.value()).collect()
    }

    /// A handle to the text of unit `index`.
    pub fn surface(&self, index: usize) -> Option<TextBuffer> {
        self.cells.get(index).map(|cell| cell.surface.clone())
    }

    /// Indices executed on this editor, in order.
    pub fn executed(&self) -> &[usize] {
        &self.executed
    }

    pub fn user_insert(&mut self, index: usize, unit: Unit) {
        let surface = self.place(index, &unit);
        self.events.push((EditorEvent::UnitCreated { index, unit, surface }, Provenance::User));
    }

    pub fn user_delete(&mut self, index: usize) {
        self.remove(index, Provenance::User);
    }

    pub fn user_change_kind(&mut self, index: usize, kind: UnitKind) {
        let Some(current) = self.unit(index) else { return };
        let unit = current.with_kind(kind);
        let surface = self.rebuild(index, &unit);
        self.events.push((EditorEvent::KindChanged { index, unit, surface }, Provenance::User));
    }

    pub fn user_execute(&mut self, index: usize) {
        self.events.push((EditorEvent::ExecuteRequested { index }, Provenance::User));
    }

    pub fn user_render(&mut self, index: usize) {
        self.set_rendered(index, true);
        self.events.push((EditorEvent::MarkdownRendered { index }, Provenance::User));
    }

    pub fn user_unrender(&mut self, index: usize) {
        self.set_rendered(index, false);
        self.events.push((EditorEvent::MarkdownUnrendered { index }, Provenance::User));
    }

    fn place(&mut self, index: usize, unit: &Unit) -> TextBuffer {
        let surface = TextBuffer::new(&unit.source);
        let index = index.min(self.cells.len());
        self.cells.insert(index, Cell { unit: unit.clone(), surface: surface.clone() });
        surface
    }

    fn remove(&mut self, index: usize, provenance: Provenance) {
        if index >= self.cells.len() {
            return;
        }
        let cell = self.cells.remove(index);
        let unit = Unit { source: cell.surface.value(), ..cell.unit };
        self.events.push((EditorEvent::UnitDeleted { index, unit }, provenance));
        if self.cells.is_empty() {
            let placeholder = Unit::code("");
            let surface = self.place(0, &placeholder);
            self.events.push((
                EditorEvent::UnitCreated { index: 0, unit: placeholder, surface },
                Provenance::Placeholder,
            ));
        }
    }

    fn rebuild(&mut self, index: usize, unit: &Unit) -> TextBuffer {
        let surface = TextBuffer::new(&unit.source);
        if let Some(cell) = self.cells.get_mut(index) {
            let old = Unit { source: cell.surface.value(), ..cell.unit.clone() };
            *cell = Cell { unit: unit.clone(), surface: surface.clone() };
            self.events.push((EditorEvent::UnitDeleted { index, unit: old }, Provenance::KindChange));
            self.events.push((
                EditorEvent::UnitCreated { index, unit: unit.clone(), surface: surface.clone() },
                Provenance::KindChange,
            ));
        }
        surface
    }

    fn set_rendered(&mut self, index: usize, rendered: bool) {
        if let Some(cell) = self.cells.get_mut(index) {
            if cell.unit.kind == UnitKind::Text {
                cell.unit.rendered_flag = Some(rendered);
            }
        }
    }
}

impl NotebookEditor for HeadlessNotebook {
    type Surface = TextBuffer;

    fn unit_count(&self) -> usize {
        self.cells.len()
    }

    fn insert_unit(&mut self, index: usize, unit: &Unit) -> TextBuffer {
        let surface = self.place(index, unit);
        self.events.push((
            EditorEvent::UnitCreated { index, unit: unit.clone(), surface: surface.clone() },
            Provenance::Replay,
        ));
        surface
    }

    fn delete_unit(&mut self, index: usize) {
        self.remove(index, Provenance::Replay);
    }

    fn change_kind(&mut self, index: usize, unit: &Unit) -> TextBuffer {
        self.rebuild(index, unit)
    }

    fn execute_unit(&mut self, index: usize) {
        let Some(cell) = self.cells.get_mut(index) else { return };
        if cell.unit.kind != UnitKind::Code {
            return;
        }
        self.execution_counter += 1;
        let count = self.execution_counter;
        cell.unit.execution_count = Some(ExecutionCount::Count(count));
        cell.unit.outputs = vec![json!({
            "output_type": "execute_result",
            "execution_count": count,
            "data": {"text/plain": cell.surface.value()},
        })];
        self.executed.push(index);
        self.events.push((EditorEvent::ExecutionFinished { index }, Provenance::User));
    }

    fn execution_result(&self, index: usize) -> (Option<ExecutionCount>, Vec<Value>) {
        self.cells
            .get(index)
            .map(|cell| (cell.unit.execution_count, cell.unit.outputs.clone()))
            .unwrap_or_default()
    }

    fn set_execution_count(&mut self, index: usize, count: Option<ExecutionCount>) {
        if let Some(cell) = self.cells.get_mut(index) {
            cell.unit.execution_count = count;
        }
    }

    fn set_outputs(&mut self, index: usize, outputs: &[Value]) {
        if let Some(cell) = self.cells.get_mut(index) {
            cell.unit.outputs = outputs.to_vec();
        }
    }

    fn render_markdown(&mut self, index: usize) {
        self.set_rendered(index, true);
    }

    fn unrender_markdown(&mut self, index: usize) {
        self.set_rendered(index, false);
    }

    fn drain_events(&mut self) -> Vec<(EditorEvent<TextBuffer>, Provenance)> {
        std::mem::take(&mut self.events)
    }
}

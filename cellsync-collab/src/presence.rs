//! Presence: where every other participant's cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move (surface active, mouse up)
//!       │
//!       ▼
//! PresenceTracker::on_local_cursor()
//!       │  list replace at own index, or append
//!       ▼
//! [presence] ──► authority ──► every replica
//!                                   │
//!                                   ▼
//!                     PresenceTracker::process_events()
//!                                   │  clear, then range or caret (+ label)
//!                                   ▼
//!                           PresenceRenderer
//! ```
//!
//! Records are found by linear scan over the presence list. A participant
//! is expected to own at most one entry.

use std::collections::HashMap;

use cellsync_core::ot::{Component, PathSegment};
use cellsync_core::{keys, paths, Cursor, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::replica::{ListenerId, RemoteDocument, Source, SourceId, SubmitError};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor and selection indicators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// A stable color for a participant.
    ///
    /// The hue comes from the UUID; saturation and lightness are fixed so
    /// every participant's indicator is equally vivid.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, for editors that style indicators with CSS.
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Rendering
// ───────────────────────────────────────────────────────────────────

/// Draws other participants' indicators in the local editor.
pub trait PresenceRenderer {
    /// Remove whatever is drawn for `participant`.
    fn clear(&mut self, participant: ParticipantId);

    fn draw_range(&mut self, participant: ParticipantId, unit: usize, start: usize, end: usize, color: CursorColor);

    fn draw_caret(&mut self, participant: ParticipantId, unit: usize, at: usize, color: CursorColor);

    fn draw_label(&mut self, participant: ParticipantId, unit: usize, color: CursorColor);
}

/// What is drawn for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Range { unit: usize, start: usize, end: usize },
    Caret { unit: usize, at: usize },
}

/// A renderer that just remembers what it was asked to draw.
#[derive(Debug, Default)]
pub struct Indicators {
    drawn: HashMap<ParticipantId, Indicator>,
    labels: Vec<(ParticipantId, usize)>,
    colors: HashMap<ParticipantId, CursorColor>,
}

impl Indicators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<Indicator> {
        self.drawn.get(participant).copied()
    }

    pub fn len(&self) -> usize {
        self.drawn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawn.is_empty()
    }

    /// Every label drawn so far, oldest first.
    pub fn labels(&self) -> &[(ParticipantId, usize)] {
        &self.labels
    }

    pub fn color(&self, participant: &ParticipantId) -> Option<CursorColor> {
        self.colors.get(participant).copied()
    }
}

impl PresenceRenderer for Indicators {
    fn clear(&mut self, participant: ParticipantId) {
        self.drawn.remove(&participant);
    }

    fn draw_range(&mut self, participant: ParticipantId, unit: usize, start: usize, end: usize, color: CursorColor) {
        self.colors.insert(participant, color);
        self.drawn.insert(participant, Indicator::Range { unit, start, end });
    }

    fn draw_caret(&mut self, participant: ParticipantId, unit: usize, at: usize, color: CursorColor) {
        self.colors.insert(participant, color);
        self.drawn.insert(participant, Indicator::Caret { unit, at });
    }

    fn draw_label(&mut self, participant: ParticipantId, unit: usize, _color: CursorColor) {
        self.labels.push((participant, unit));
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemoteCursor {
    cursor: Cursor,
    color: CursorColor,
    /// Unit the label was last drawn on.
    labelled_unit: Option<usize>,
}

pub struct PresenceTracker<R: PresenceRenderer = Indicators> {
    local: ParticipantId,
    source: SourceId,
    listener: Option<ListenerId>,
    renderer: R,
    remote: HashMap<ParticipantId, RemoteCursor>,
    mouse_down: bool,
    /// Latest move made while the mouse was held.
    held: Option<Cursor>,
    last_sent: Option<Cursor>,
}

impl<R: PresenceRenderer> PresenceTracker<R> {
    pub fn new(local: ParticipantId, renderer: R) -> Self {
        Self {
            local,
            source: SourceId::next(),
            listener: None,
            renderer,
            remote: HashMap::new(),
            mouse_down: false,
            held: None,
            last_sent: None,
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Last known cursor of a remote participant.
    pub fn cursor_of(&self, participant: &ParticipantId) -> Option<&Cursor> {
        self.remote.get(participant).map(|r| &r.cursor)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Subscribe and draw everyone already present.
    pub fn start<D: RemoteDocument>(&mut self, doc: &mut D) {
        self.listener = Some(doc.subscribe());
        let entries = doc
            .get_data()
            .get(keys::PRESENCE)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            self.show(entry);
        }
    }

    /// Report a local cursor move.
    ///
    /// Ignored unless the moved surface is the active one. While a mouse
    /// button is held the move is kept and sent on [`Self::on_mouse_up`].
    pub fn on_local_cursor<D: RemoteDocument>(
        &mut self,
        doc: &mut D,
        unit_index: usize,
        range_start: usize,
        range_end: usize,
        surface_active: bool,
    ) -> Result<(), SubmitError> {
        if !surface_active {
            return Ok(());
        }
        let cursor = Cursor { participant: self.local, unit_index, range_start, range_end };
        if self.mouse_down {
            self.held = Some(cursor);
            return Ok(());
        }
        self.publish(doc, cursor)
    }

    pub fn on_mouse_down(&mut self) {
        self.mouse_down = true;
    }

    /// Release the mouse and send the move made during the drag, if any.
    pub fn on_mouse_up<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        self.mouse_down = false;
        match self.held.take() {
            Some(cursor) => self.publish(doc, cursor),
            None => Ok(()),
        }
    }

    /// Redraw from queued presence changes. Returns whether there were any.
    pub fn process_events<D: RemoteDocument>(&mut self, doc: &mut D) -> bool {
        let Some(listener) = self.listener else {
            return false;
        };
        let events = doc.take_events(listener);
        if events.is_empty() {
            return false;
        }
        for event in &events {
            // Local submitters never write anyone else's presence entry.
            if matches!(event.source, Source::Local(_)) {
                continue;
            }
            for component in &event.ops {
                self.replay(&*doc, component);
            }
        }
        true
    }

    /// Remove our own entry and every drawn indicator.
    pub fn leave<D: RemoteDocument>(&mut self, doc: &mut D) -> Result<(), SubmitError> {
        let own = find_entry(doc.get_data(), self.local).map(|(index, entry)| (index, entry.clone()));
        if let Some((index, value)) = own {
            doc.submit_operation(
                vec![Component::ListDelete { path: paths::presence_entry(index), value }],
                self.source,
            )?;
        }
        if let Some(listener) = self.listener.take() {
            doc.unsubscribe(listener);
        }
        for participant in self.remote.drain().map(|(id, _)| id).collect::<Vec<_>>() {
            self.renderer.clear(participant);
        }
        Ok(())
    }

    fn publish<D: RemoteDocument>(&mut self, doc: &mut D, cursor: Cursor) -> Result<(), SubmitError> {
        if self.last_sent.as_ref() == Some(&cursor) {
            return Ok(());
        }
        let snapshot = doc.get_data();
        let after = cursor.to_value();
        let component = match (find_entry(snapshot, self.local), snapshot.get(keys::PRESENCE)) {
            (Some((index, before)), _) => Component::ListReplace {
                path: paths::presence_entry(index),
                before: before.clone(),
                after,
            },
            (None, Some(Value::Array(list))) => Component::ListInsert {
                path: paths::presence_entry(list.len()),
                value: after,
            },
            (None, other) => Component::ObjectReplace {
                path: vec![keys::PRESENCE.into()],
                before: other.cloned(),
                after: Some(Value::Array(vec![after])),
            },
        };
        doc.submit_operation(vec![component], self.source)?;
        log::trace!("Cursor of {} at unit {}", self.local, cursor.unit_index);
        self.last_sent = Some(cursor);
        Ok(())
    }

    fn replay<D: RemoteDocument>(&mut self, doc: &D, component: &Component) {
        let path = component.path();
        if !matches!(path.first(), Some(PathSegment::Key(k)) if k == keys::PRESENCE) {
            return;
        }
        match (component, path.len()) {
            (Component::ListInsert { value, .. }, 2) => self.show(value),
            (Component::ListReplace { after, .. }, 2) => self.show(after),
            (Component::ListDelete { value, .. }, 2) => self.hide(value),
            (Component::ObjectReplace { before, after, .. }, 1) => {
                for entry in before.iter().filter_map(Value::as_array).flatten() {
                    self.hide(entry);
                }
                for entry in after.iter().filter_map(Value::as_array).flatten() {
                    self.show(entry);
                }
            }
            _ => {
                // A field-level edit inside one entry: read the entry back.
                if let Some(PathSegment::Index(index)) = path.get(1) {
                    if let Some(entry) = doc.get_data()[keys::PRESENCE].get(*index).cloned() {
                        self.show(&entry);
                    }
                }
            }
        }
    }

    fn show(&mut self, entry: &Value) {
        let cursor = match Cursor::from_value(entry) {
            Ok(cursor) => cursor,
            Err(e) => {
                log::debug!("Ignoring malformed presence entry: {e}");
                return;
            }
        };
        if cursor.participant == self.local {
            return;
        }
        let participant = cursor.participant;
        let state = self.remote.entry(participant).or_insert_with(|| RemoteCursor {
            cursor: cursor.clone(),
            color: CursorColor::from_uuid(participant),
            labelled_unit: None,
        });
        state.cursor = cursor;
        let cursor = &state.cursor;

        self.renderer.clear(participant);
        if cursor.is_caret() {
            self.renderer.draw_caret(participant, cursor.unit_index, cursor.range_start, state.color);
        } else {
            self.renderer.draw_range(
                participant,
                cursor.unit_index,
                cursor.range_start.min(cursor.range_end),
                cursor.range_start.max(cursor.range_end),
                state.color,
            );
        }
        if state.labelled_unit != Some(cursor.unit_index) {
            self.renderer.draw_label(participant, cursor.unit_index, state.color);
            state.labelled_unit = Some(cursor.unit_index);
        }
    }

    fn hide(&mut self, entry: &Value) {
        let Some(participant) = entry
            .get("participant")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return;
        };
        if self.remote.remove(&participant).is_some() {
            log::debug!("Presence of {participant} removed");
        }
        self.renderer.clear(participant);
    }
}

/// Linear scan of the presence list for one participant's entry.
fn find_entry(doc: &Value, participant: ParticipantId) -> Option<(usize, &Value)> {
    let id = participant.to_string();
    doc.get(keys::PRESENCE)?
        .as_array()?
        .iter()
        .enumerate()
        .find(|(_, entry)| entry.get("participant").and_then(Value::as_str) == Some(id.as_str()))
}

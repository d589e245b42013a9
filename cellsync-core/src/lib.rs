//! Shared-document model for cellsync.
//!
//! The authoritative document is a JSON value edited only through OT
//! operations (see [`ot`]). This module gives that value a typed shape:
//!
//! ```text
//! {
//!   "units":         [ Unit, ... ],          document order
//!   "eventCounters": { "renderMarkdown": n, "unrenderMarkdown": n },
//!   "host":          participant | null,
//!   "participants":  [ participant, ... ],
//!   "presence":      [ Cursor, ... ]
//! }
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

pub mod classify;
pub mod ot;

pub use classify::{classify, OpTag};
pub use ot::{Component, OtError, Path, PathSegment, Side};

/// Identity of one participant session.
pub type ParticipantId = Uuid;

/// JSON keys of the shared document.
pub mod keys {
    pub const UNITS: &str = "units";
    pub const EVENT_COUNTERS: &str = "eventCounters";
    pub const RENDER_MARKDOWN: &str = "renderMarkdown";
    pub const UNRENDER_MARKDOWN: &str = "unrenderMarkdown";
    pub const HOST: &str = "host";
    pub const PARTICIPANTS: &str = "participants";
    pub const PRESENCE: &str = "presence";
    pub const KIND: &str = "kind";
    pub const SOURCE: &str = "source";
    pub const EXECUTION_COUNT: &str = "executionCount";
    pub const OUTPUTS: &str = "outputs";
    pub const RENDERED: &str = "renderedFlag";
}

/// Path builders for the locations bindings write to.
pub mod paths {
    use super::keys;
    use crate::ot::{Path, PathSegment};

    pub fn unit(index: usize) -> Path {
        vec![keys::UNITS.into(), PathSegment::Index(index)]
    }

    pub fn unit_field(index: usize, key: &str) -> Path {
        vec![keys::UNITS.into(), PathSegment::Index(index), key.into()]
    }

    pub fn unit_source(index: usize) -> Path {
        unit_field(index, keys::SOURCE)
    }

    pub fn host() -> Path {
        vec![keys::HOST.into()]
    }

    pub fn participant(index: usize) -> Path {
        vec![keys::PARTICIPANTS.into(), PathSegment::Index(index)]
    }

    pub fn presence_entry(index: usize) -> Path {
        vec![keys::PRESENCE.into(), PathSegment::Index(index)]
    }

    pub fn counter(key: &str) -> Path {
        vec![keys::EVENT_COUNTERS.into(), key.into()]
    }
}

/// Errors converting between JSON and the typed model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Text,
    Code,
    Raw,
}

/// The execution counter of a code unit.
///
/// `Pending` is the sentinel a non-host writes to ask the host to execute;
/// on the wire it is the string `"*"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionCount {
    Count(u64),
    Pending,
}

pub const PENDING_SENTINEL: &str = "*";

impl ExecutionCount {
    pub fn to_value(self) -> Value {
        match self {
            ExecutionCount::Count(n) => Value::from(n),
            ExecutionCount::Pending => Value::from(PENDING_SENTINEL),
        }
    }

    /// `None` for null or any unrecognised shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(ExecutionCount::Count),
            Value::String(s) if s == PENDING_SENTINEL => Some(ExecutionCount::Pending),
            _ => None,
        }
    }
}

impl Serialize for ExecutionCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExecutionCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        ExecutionCount::from_value(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid execution count: {raw}")))
    }
}

/// One cell of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub kind: UnitKind,
    pub source: String,
    #[serde(default)]
    pub execution_count: Option<ExecutionCount>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_flag: Option<bool>,
}

impl Unit {
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Code,
            source: source.into(),
            execution_count: None,
            outputs: Vec::new(),
            rendered_flag: None,
        }
    }

    pub fn text(source: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Text,
            source: source.into(),
            execution_count: None,
            outputs: Vec::new(),
            rendered_flag: Some(false),
        }
    }

    pub fn raw(source: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Raw,
            ..Self::code(source)
        }
    }

    /// Same source, different kind; type-specific fields reset.
    pub fn with_kind(&self, kind: UnitKind) -> Self {
        let blank = match kind {
            UnitKind::Code => Unit::code(""),
            UnitKind::Text => Unit::text(""),
            UnitKind::Raw => Unit::raw(""),
        };
        Self {
            source: self.source.clone(),
            ..blank
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        Ok(Unit::deserialize(value)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCounters {
    pub render_markdown: i64,
    pub unrender_markdown: i64,
}

/// A participant's cursor inside one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub participant: ParticipantId,
    pub unit_index: usize,
    pub range_start: usize,
    pub range_end: usize,
}

impl Cursor {
    pub fn is_caret(&self) -> bool {
        self.range_start == self.range_end
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        Ok(Cursor::deserialize(value)?)
    }
}

/// Typed view of the whole shared document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDocument {
    pub units: Vec<Unit>,
    pub event_counters: EventCounters,
    pub host: Option<ParticipantId>,
    pub participants: Vec<ParticipantId>,
    pub presence: Vec<Cursor>,
}

impl SharedDocument {
    /// An empty document with the given units.
    pub fn new(units: Vec<Unit>) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Result<Value, ModelError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        Ok(SharedDocument::deserialize(value)?)
    }

    /// The current host read straight from a document value.
    pub fn host_of(doc: &Value) -> Option<ParticipantId> {
        doc.get(keys::HOST)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn participants_of(doc: &Value) -> Vec<ParticipantId> {
        doc.get(keys::PARTICIPANTS)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn counter_of(doc: &Value, key: &str) -> i64 {
        doc.get(keys::EVENT_COUNTERS)
            .and_then(|c| c.get(key))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn unit_of(doc: &Value, index: usize) -> Option<Unit> {
        let raw = doc.get(keys::UNITS)?.get(index)?;
        Unit::from_value(raw).ok()
    }

    pub fn unit_count_of(doc: &Value) -> usize {
        doc.get(keys::UNITS)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

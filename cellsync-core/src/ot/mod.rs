//! Operational-transform substrate for the shared document.
//!
//! An operation is an ordered list of [`Component`]s, each addressing a
//! location inside the document's JSON value by [`Path`]. Components are
//! applied in order; [`apply`] either applies a whole operation or leaves
//! the document untouched.
//!
//! Text offsets are counted in Unicode scalar values, never bytes.

use serde_json::Value;
use std::fmt;

mod transform;
mod wire;

pub use transform::{transform, transform_component, transform_x, Side};
pub use wire::WireError;

/// One step of a path into the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

pub type Path = Vec<PathSegment>;

/// Render a path as `a/0/b` for logs and errors.
pub fn display_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

/// A single OT edit.
///
/// List components address an element (`path` ends in an index), object
/// replacement addresses a key, text components address the string itself
/// and carry a character offset.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    ListInsert { path: Path, value: Value },
    ListDelete { path: Path, value: Value },
    /// Delete-then-insert at the same position.
    ListReplace { path: Path, before: Value, after: Value },
    /// `after == None` removes the key.
    ObjectReplace {
        path: Path,
        before: Option<Value>,
        after: Option<Value>,
    },
    NumberAdd { path: Path, delta: i64 },
    TextInsert { path: Path, offset: usize, text: String },
    TextDelete { path: Path, offset: usize, text: String },
}

/// Failure to apply a component to a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtError {
    #[error("empty path")]
    EmptyPath,
    #[error("path {0} does not exist")]
    MissingPath(String),
    #[error("expected {expected} at {path}")]
    TypeMismatch { path: String, expected: &'static str },
    #[error("index {index} out of range at {path}")]
    IndexOutOfRange { path: String, index: usize },
    #[error("text offset {offset} out of range at {path}")]
    OffsetOutOfRange { path: String, offset: usize },
    #[error("deleted text does not match the document at {path}")]
    TextMismatch { path: String },
    #[error("number at {path} overflows")]
    Overflow { path: String },
}

impl Component {
    /// The location this component operates on.
    pub fn path(&self) -> &Path {
        match self {
            Component::ListInsert { path, .. }
            | Component::ListDelete { path, .. }
            | Component::ListReplace { path, .. }
            | Component::ObjectReplace { path, .. }
            | Component::NumberAdd { path, .. }
            | Component::TextInsert { path, .. }
            | Component::TextDelete { path, .. } => path,
        }
    }

    pub(crate) fn path_mut(&mut self) -> &mut Path {
        match self {
            Component::ListInsert { path, .. }
            | Component::ListDelete { path, .. }
            | Component::ListReplace { path, .. }
            | Component::ObjectReplace { path, .. }
            | Component::NumberAdd { path, .. }
            | Component::TextInsert { path, .. }
            | Component::TextDelete { path, .. } => path,
        }
    }

    /// Apply this component in place.
    ///
    /// On error the document may be partially modified; use [`apply`] for
    /// all-or-nothing semantics.
    pub fn apply(&self, doc: &mut Value) -> Result<(), OtError> {
        match self {
            Component::ListInsert { path, value } => {
                let (parent, index) = list_target(path)?;
                let items = array_at(doc, parent)?;
                if index > items.len() {
                    return Err(OtError::IndexOutOfRange { path: display_path(parent), index });
                }
                items.insert(index, value.clone());
            }
            Component::ListDelete { path, .. } => {
                let (parent, index) = list_target(path)?;
                let items = array_at(doc, parent)?;
                if index >= items.len() {
                    return Err(OtError::IndexOutOfRange { path: display_path(parent), index });
                }
                items.remove(index);
            }
            Component::ListReplace { path, after, .. } => {
                let (parent, index) = list_target(path)?;
                let items = array_at(doc, parent)?;
                let slot = items
                    .get_mut(index)
                    .ok_or_else(|| OtError::IndexOutOfRange { path: display_path(parent), index })?;
                *slot = after.clone();
            }
            Component::ObjectReplace { path, after, .. } => {
                let (parent, key) = match path.split_last() {
                    Some((PathSegment::Key(key), parent)) => (parent, key),
                    Some(_) => {
                        return Err(OtError::TypeMismatch {
                            path: display_path(path),
                            expected: "object key",
                        })
                    }
                    None => return Err(OtError::EmptyPath),
                };
                let Value::Object(map) = resolve_mut(doc, parent)? else {
                    return Err(OtError::TypeMismatch { path: display_path(parent), expected: "object" });
                };
                match after {
                    Some(value) => {
                        map.insert(key.clone(), value.clone());
                    }
                    None => {
                        map.remove(key);
                    }
                }
            }
            Component::NumberAdd { path, delta } => {
                let target = resolve_mut(doc, path)?;
                let current = target.as_i64().ok_or_else(|| OtError::TypeMismatch {
                    path: display_path(path),
                    expected: "integer",
                })?;
                let sum = current
                    .checked_add(*delta)
                    .ok_or_else(|| OtError::Overflow { path: display_path(path) })?;
                *target = Value::from(sum);
            }
            Component::TextInsert { path, offset, text } => {
                let target = string_at(doc, path)?;
                let at = char_to_byte(target, *offset)
                    .ok_or_else(|| OtError::OffsetOutOfRange { path: display_path(path), offset: *offset })?;
                target.insert_str(at, text);
            }
            Component::TextDelete { path, offset, text } => {
                let target = string_at(doc, path)?;
                let start = char_to_byte(target, *offset)
                    .ok_or_else(|| OtError::OffsetOutOfRange { path: display_path(path), offset: *offset })?;
                let end = start + text.len();
                if target.get(start..end) != Some(text.as_str()) {
                    return Err(OtError::TextMismatch { path: display_path(path) });
                }
                target.replace_range(start..end, "");
            }
        }
        Ok(())
    }
}

/// Apply a whole operation, all or nothing.
pub fn apply(doc: &mut Value, ops: &[Component]) -> Result<(), OtError> {
    let mut next = doc.clone();
    for component in ops {
        component.apply(&mut next)?;
    }
    *doc = next;
    Ok(())
}

/// Read-only lookup of the value at `path`.
pub fn resolve<'a>(root: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(root, |cur, segment| match (segment, cur) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
        _ => None,
    })
}

fn resolve_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, OtError> {
    let mut cur = root;
    for (depth, segment) in path.iter().enumerate() {
        let next = match (segment, cur) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key),
            (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
            _ => None,
        };
        cur = next.ok_or_else(|| OtError::MissingPath(display_path(&path[..=depth])))?;
    }
    Ok(cur)
}

fn list_target(path: &[PathSegment]) -> Result<(&[PathSegment], usize), OtError> {
    match path.split_last() {
        Some((PathSegment::Index(index), parent)) => Ok((parent, *index)),
        Some(_) => Err(OtError::TypeMismatch { path: display_path(path), expected: "list index" }),
        None => Err(OtError::EmptyPath),
    }
}

fn array_at<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Vec<Value>, OtError> {
    match resolve_mut(doc, path)? {
        Value::Array(items) => Ok(items),
        _ => Err(OtError::TypeMismatch { path: display_path(path), expected: "list" }),
    }
}

fn string_at<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut String, OtError> {
    match resolve_mut(doc, path)? {
        Value::String(text) => Ok(text),
        _ => Err(OtError::TypeMismatch { path: display_path(path), expected: "string" }),
    }
}

/// Byte index of the `offset`-th character; `offset == char count` maps to
/// the end of the string.
pub fn char_to_byte(text: &str, offset: usize) -> Option<usize> {
    text.char_indices()
        .map(|(byte, _)| byte)
        .chain(std::iter::once(text.len()))
        .nth(offset)
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

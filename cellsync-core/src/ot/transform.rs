//! Inclusion transformation.
//!
//! `transform_component(c, other, side)` rewrites `c` so it has the same
//! intent when applied after `other`. Both were generated against the same
//! document state. `side` breaks ties between the two:
//!
//! ```text
//!   insert vs insert at the same spot      Left stays, Right shifts past
//!   replace vs replace of the same slot    Right keeps (rebased), Left dropped
//! ```
//!
//! The authority transforms every incoming operation as `Left` against what
//! it already committed, so a concurrent replace of the same slot is won by
//! whichever reached the authority first. Clients transform server
//! operations as `Right` against their unacknowledged local work, which keeps
//! both sides in agreement.
//!
//! A component that addresses something inside a value another component
//! deleted or replaced is dropped.

use super::{char_len, Component, PathSegment};
use serde_json::Value;

/// Tie-break side of a transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Transform one component past another. May yield zero, one, or two
/// components (a text delete is split around a concurrent insert).
pub fn transform_component(c: &Component, other: &Component, side: Side) -> Vec<Component> {
    match other {
        Component::TextInsert { path, offset, text } => {
            past_text_insert(c, path, *offset, char_len(text), side)
        }
        Component::TextDelete { path, offset, text } => {
            past_text_delete(c, path, *offset, char_len(text))
        }
        Component::NumberAdd { .. } => vec![c.clone()],
        Component::ObjectReplace { path, after, .. } => past_object_replace(c, path, after, side),
        Component::ListInsert { path, .. } => past_list_insert(c, path, side),
        Component::ListDelete { path, .. } => past_list_delete(c, path),
        Component::ListReplace { path, after, .. } => past_list_replace(c, path, after, side),
    }
}

/// Transform two concurrent operations against each other.
///
/// Returns `(left', right')` such that `left` followed by `right'` reaches
/// the same document as `right` followed by `left'`.
pub fn transform_x(left: &[Component], right: &[Component]) -> (Vec<Component>, Vec<Component>) {
    match (left, right) {
        ([], _) | (_, []) => (left.to_vec(), right.to_vec()),
        ([l], [r]) => (
            transform_component(l, r, Side::Left),
            transform_component(r, l, Side::Right),
        ),
        ([first, rest @ ..], _) if !rest.is_empty() => {
            let (first, right) = transform_x(std::slice::from_ref(first), right);
            let (mut rest, right) = transform_x(rest, &right);
            let mut out = first;
            out.append(&mut rest);
            (out, right)
        }
        (_, [first, rest @ ..]) => {
            let (left, first) = transform_x(left, std::slice::from_ref(first));
            let (left, mut rest) = transform_x(&left, rest);
            let mut out = first;
            out.append(&mut rest);
            (left, out)
        }
    }
}

/// Transform `op` so it applies after `other`.
pub fn transform(op: &[Component], other: &[Component], side: Side) -> Vec<Component> {
    match side {
        Side::Left => transform_x(op, other).0,
        Side::Right => transform_x(other, op).1,
    }
}

fn past_text_insert(
    c: &Component,
    other_path: &[PathSegment],
    at: usize,
    inserted: usize,
    side: Side,
) -> Vec<Component> {
    if c.path().as_slice() != other_path {
        return vec![c.clone()];
    }
    match c {
        Component::TextInsert { path, offset, text } => {
            let offset = if *offset < at || (*offset == at && side == Side::Left) {
                *offset
            } else {
                offset.saturating_add(inserted)
            };
            vec![Component::TextInsert { path: path.clone(), offset, text: text.clone() }]
        }
        Component::TextDelete { path, offset, text } => {
            let len = char_len(text);
            if at <= *offset {
                vec![Component::TextDelete {
                    path: path.clone(),
                    offset: offset.saturating_add(inserted),
                    text: text.clone(),
                }]
            } else if at < offset.saturating_add(len) {
                let head: String = text.chars().take(at - offset).collect();
                let tail: String = text.chars().skip(at - offset).collect();
                vec![
                    Component::TextDelete { path: path.clone(), offset: *offset, text: head },
                    Component::TextDelete { path: path.clone(), offset: offset.saturating_add(inserted), text: tail },
                ]
            } else {
                vec![c.clone()]
            }
        }
        _ => vec![c.clone()],
    }
}

fn past_text_delete(c: &Component, other_path: &[PathSegment], at: usize, deleted: usize) -> Vec<Component> {
    if c.path().as_slice() != other_path {
        return vec![c.clone()];
    }
    let end = at.saturating_add(deleted);
    match c {
        Component::TextInsert { path, offset, text } => {
            let offset = if *offset <= at {
                *offset
            } else if *offset >= end {
                offset - deleted
            } else {
                at
            };
            vec![Component::TextInsert { path: path.clone(), offset, text: text.clone() }]
        }
        Component::TextDelete { path, offset, text } => {
            let kept: String = text
                .chars()
                .enumerate()
                .filter(|(k, _)| {
                    let pos = offset.saturating_add(*k);
                    pos < at || pos >= end
                })
                .map(|(_, ch)| ch)
                .collect();
            if kept.is_empty() {
                return Vec::new();
            }
            let offset = if *offset <= at {
                *offset
            } else {
                offset - (offset - at).min(deleted)
            };
            vec![Component::TextDelete { path: path.clone(), offset, text: kept }]
        }
        _ => vec![c.clone()],
    }
}

fn past_object_replace(
    c: &Component,
    other_path: &[PathSegment],
    other_after: &Option<Value>,
    side: Side,
) -> Vec<Component> {
    if !c.path().starts_with(other_path) {
        return vec![c.clone()];
    }
    match c {
        Component::ObjectReplace { path, after, .. } if path.len() == other_path.len() => match side {
            Side::Left => Vec::new(),
            Side::Right => vec![Component::ObjectReplace {
                path: path.clone(),
                before: other_after.clone(),
                after: after.clone(),
            }],
        },
        _ => Vec::new(),
    }
}

/// Where `c` touches the list `other_path` points into: the depth of the
/// list index in `c`'s path and the index itself.
fn list_position(c_path: &[PathSegment], other_path: &[PathSegment]) -> Option<(usize, usize)> {
    let (_, parent) = other_path.split_last()?;
    if c_path.len() <= parent.len() || !c_path.starts_with(parent) {
        return None;
    }
    match c_path[parent.len()] {
        PathSegment::Index(j) => Some((parent.len(), j)),
        PathSegment::Key(_) => None,
    }
}

fn list_index(path: &[PathSegment]) -> Option<usize> {
    match path.last() {
        Some(PathSegment::Index(i)) => Some(*i),
        _ => None,
    }
}

fn shifted(c: &Component, depth: usize, index: usize) -> Component {
    let mut c = c.clone();
    c.path_mut()[depth] = PathSegment::Index(index);
    c
}

fn past_list_insert(c: &Component, other_path: &[PathSegment], side: Side) -> Vec<Component> {
    let (Some((depth, j)), Some(i)) = (list_position(c.path(), other_path), list_index(other_path)) else {
        return vec![c.clone()];
    };
    let at_element = c.path().len() == depth + 1;
    let shift = match c {
        Component::ListInsert { .. } if at_element => j > i || (j == i && side == Side::Right),
        _ => j >= i,
    };
    if shift {
        vec![shifted(c, depth, j.saturating_add(1))]
    } else {
        vec![c.clone()]
    }
}

fn past_list_delete(c: &Component, other_path: &[PathSegment]) -> Vec<Component> {
    let (Some((depth, j)), Some(i)) = (list_position(c.path(), other_path), list_index(other_path)) else {
        return vec![c.clone()];
    };
    let at_element = c.path().len() == depth + 1;
    if j > i {
        return vec![shifted(c, depth, j - 1)];
    }
    if j < i {
        return vec![c.clone()];
    }
    match c {
        Component::ListInsert { .. } if at_element => vec![c.clone()],
        Component::ListReplace { path, after, .. } if at_element => vec![Component::ListInsert {
            path: path.clone(),
            value: after.clone(),
        }],
        _ => Vec::new(),
    }
}

fn past_list_replace(
    c: &Component,
    other_path: &[PathSegment],
    other_after: &Value,
    side: Side,
) -> Vec<Component> {
    let (Some((depth, j)), Some(i)) = (list_position(c.path(), other_path), list_index(other_path)) else {
        return vec![c.clone()];
    };
    if j != i {
        return vec![c.clone()];
    }
    let at_element = c.path().len() == depth + 1;
    match c {
        Component::ListInsert { .. } if at_element => vec![c.clone()],
        Component::ListReplace { path, after, .. } if at_element => match side {
            Side::Left => Vec::new(),
            Side::Right => vec![Component::ListReplace {
                path: path.clone(),
                before: other_after.clone(),
                after: after.clone(),
            }],
        },
        _ => Vec::new(),
    }
}

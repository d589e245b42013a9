//! Operation classifier.
//!
//! Maps one component to the kind of document change it represents, purely
//! from its path shape and variant. Patterns are tried most specific first,
//! so an edit inside `[units, i, outputs, j]` is `OutputsChanged` rather than
//! a generic list edit. Anything unrecognised is `Other`.

use crate::keys;
use crate::ot::{Component, PathSegment};

/// What a single component does to the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpTag {
    UnitInserted { index: usize },
    UnitDeleted { index: usize },
    UnitKindChanged { index: usize },
    ExecutionCountChanged { index: usize },
    OutputsChanged { index: usize },
    MarkdownRendered,
    MarkdownUnrendered,
    ParticipantJoined { index: usize },
    ParticipantLeft { index: usize },
    HostChanged,
    TextEdited { index: usize },
    Other,
}

impl OpTag {
    /// The unit this tag is scoped to, if any.
    pub fn unit_index(&self) -> Option<usize> {
        match *self {
            OpTag::UnitInserted { index }
            | OpTag::UnitDeleted { index }
            | OpTag::UnitKindChanged { index }
            | OpTag::ExecutionCountChanged { index }
            | OpTag::OutputsChanged { index }
            | OpTag::TextEdited { index } => Some(index),
            _ => None,
        }
    }
}

fn key(segment: &PathSegment, expected: &str) -> bool {
    matches!(segment, PathSegment::Key(k) if k == expected)
}

pub fn classify(component: &Component) -> OpTag {
    use Component as C;
    use PathSegment::Index;

    let path = component.path().as_slice();
    match path {
        [u, Index(i), o, Index(_), ..] if key(u, keys::UNITS) && key(o, keys::OUTPUTS) => {
            OpTag::OutputsChanged { index: *i }
        }
        [u, Index(i), o] if key(u, keys::UNITS) && key(o, keys::OUTPUTS) => match component {
            C::ObjectReplace { .. } => OpTag::OutputsChanged { index: *i },
            _ => OpTag::Other,
        },
        [u, Index(i), s] if key(u, keys::UNITS) && key(s, keys::SOURCE) => match component {
            C::TextInsert { .. } | C::TextDelete { .. } => OpTag::TextEdited { index: *i },
            _ => OpTag::Other,
        },
        [u, Index(i), e] if key(u, keys::UNITS) && key(e, keys::EXECUTION_COUNT) => match component {
            C::ObjectReplace { .. } => OpTag::ExecutionCountChanged { index: *i },
            _ => OpTag::Other,
        },
        [u, Index(i), k] if key(u, keys::UNITS) && key(k, keys::KIND) => match component {
            C::ObjectReplace { .. } => OpTag::UnitKindChanged { index: *i },
            _ => OpTag::Other,
        },
        [u, Index(i)] if key(u, keys::UNITS) => match component {
            C::ListInsert { .. } => OpTag::UnitInserted { index: *i },
            C::ListDelete { .. } => OpTag::UnitDeleted { index: *i },
            C::ListReplace { .. } => OpTag::UnitKindChanged { index: *i },
            _ => OpTag::Other,
        },
        [c, n] if key(c, keys::EVENT_COUNTERS) => match component {
            C::NumberAdd { .. } if key(n, keys::RENDER_MARKDOWN) => OpTag::MarkdownRendered,
            C::NumberAdd { .. } if key(n, keys::UNRENDER_MARKDOWN) => OpTag::MarkdownUnrendered,
            _ => OpTag::Other,
        },
        [p, Index(i)] if key(p, keys::PARTICIPANTS) => match component {
            C::ListInsert { .. } => OpTag::ParticipantJoined { index: *i },
            C::ListDelete { .. } => OpTag::ParticipantLeft { index: *i },
            _ => OpTag::Other,
        },
        [h] if key(h, keys::HOST) => match component {
            C::ObjectReplace { .. } => OpTag::HostChanged,
            _ => OpTag::Other,
        },
        _ => OpTag::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Path;
    use crate::paths;
    use serde_json::json;

    fn replace(path: Path) -> Component {
        Component::ObjectReplace { path, before: None, after: Some(json!(1)) }
    }

    #[test]
    fn test_structural_unit_edits() {
        let insert = Component::ListInsert { path: paths::unit(3), value: json!({}) };
        let delete = Component::ListDelete { path: paths::unit(1), value: json!({}) };
        let swap = Component::ListReplace { path: paths::unit(0), before: json!({}), after: json!({}) };
        assert_eq!(classify(&insert), OpTag::UnitInserted { index: 3 });
        assert_eq!(classify(&delete), OpTag::UnitDeleted { index: 1 });
        assert_eq!(classify(&swap), OpTag::UnitKindChanged { index: 0 });
    }

    #[test]
    fn test_output_edit_is_not_a_unit_edit() {
        let mut path = paths::unit_field(2, keys::OUTPUTS);
        path.push(PathSegment::Index(0));
        let insert = Component::ListInsert { path, value: json!({"output_type": "stream"}) };
        assert_eq!(classify(&insert), OpTag::OutputsChanged { index: 2 });
        assert_eq!(
            classify(&replace(paths::unit_field(2, keys::OUTPUTS))),
            OpTag::OutputsChanged { index: 2 }
        );
    }

    #[test]
    fn test_field_replacements() {
        assert_eq!(
            classify(&replace(paths::unit_field(4, keys::EXECUTION_COUNT))),
            OpTag::ExecutionCountChanged { index: 4 }
        );
        assert_eq!(
            classify(&replace(paths::unit_field(4, keys::KIND))),
            OpTag::UnitKindChanged { index: 4 }
        );
        assert_eq!(classify(&replace(paths::host())), OpTag::HostChanged);
    }

    #[test]
    fn test_text_and_counters() {
        let edit = Component::TextDelete { path: paths::unit_source(0), offset: 6, text: "1".into() };
        assert_eq!(classify(&edit), OpTag::TextEdited { index: 0 });

        let render = Component::NumberAdd { path: paths::counter(keys::RENDER_MARKDOWN), delta: 1 };
        let unrender = Component::NumberAdd { path: paths::counter(keys::UNRENDER_MARKDOWN), delta: 1 };
        assert_eq!(classify(&render), OpTag::MarkdownRendered);
        assert_eq!(classify(&unrender), OpTag::MarkdownUnrendered);
    }

    #[test]
    fn test_participants() {
        let joined = Component::ListInsert { path: paths::participant(2), value: json!("a") };
        let left = Component::ListDelete { path: paths::participant(0), value: json!("a") };
        assert_eq!(classify(&joined), OpTag::ParticipantJoined { index: 2 });
        assert_eq!(classify(&left), OpTag::ParticipantLeft { index: 0 });
    }

    #[test]
    fn test_unknown_shapes_are_other() {
        let presence = Component::ListInsert { path: paths::presence_entry(0), value: json!({}) };
        let stray = Component::NumberAdd { path: vec!["misc".into()], delta: 1 };
        let text_on_host = Component::TextInsert { path: paths::host(), offset: 0, text: "x".into() };
        let empty = Component::NumberAdd { path: Vec::new(), delta: 1 };
        assert_eq!(classify(&presence), OpTag::Other);
        assert_eq!(classify(&stray), OpTag::Other);
        assert_eq!(classify(&text_on_host), OpTag::Other);
        assert_eq!(classify(&empty), OpTag::Other);
    }
}

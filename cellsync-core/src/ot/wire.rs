//! JSON encoding of components in the json0 shape.
//!
//! ```text
//! {"p": [..path, idx], "li": v}            list insert
//! {"p": [..path, idx], "ld": v}            list delete
//! {"p": [..path, idx], "ld": v, "li": w}   list replace
//! {"p": [..path, key], "od": v, "oi": w}   object replace (either side optional)
//! {"p": [..path],      "na": n}            number add
//! {"p": [..str, off],  "si": s}            text insert
//! {"p": [..str, off],  "sd": s}            text delete
//! ```
//!
//! An absent `od`/`oi` and a present-but-null one are different things, so
//! presence is checked on the map rather than through `Option` defaults.

use super::{Component, Path, PathSegment};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("component is not an object")]
    NotAnObject,
    #[error("component has no path")]
    MissingPath,
    #[error("invalid path segment: {0}")]
    BadSegment(String),
    #[error("text component path must end in an offset")]
    MissingOffset,
    #[error("field `{0}` has the wrong type")]
    BadField(&'static str),
    #[error("unrecognised component shape")]
    UnknownShape,
}

fn path_to_json(path: &[PathSegment]) -> Vec<Value> {
    path.iter()
        .map(|segment| match segment {
            PathSegment::Key(key) => Value::String(key.clone()),
            PathSegment::Index(index) => Value::from(*index),
        })
        .collect()
}

fn path_from_json(raw: &Value) -> Result<Path, WireError> {
    let Value::Array(items) = raw else {
        return Err(WireError::MissingPath);
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(key) => Ok(PathSegment::Key(key.clone())),
            Value::Number(n) => n
                .as_u64()
                .map(|index| PathSegment::Index(index as usize))
                .ok_or_else(|| WireError::BadSegment(n.to_string())),
            other => Err(WireError::BadSegment(other.to_string())),
        })
        .collect()
}

impl Component {
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        match self {
            Component::ListInsert { path, value } => {
                map.insert("p".into(), Value::Array(path_to_json(path)));
                map.insert("li".into(), value.clone());
            }
            Component::ListDelete { path, value } => {
                map.insert("p".into(), Value::Array(path_to_json(path)));
                map.insert("ld".into(), value.clone());
            }
            Component::ListReplace { path, before, after } => {
                map.insert("p".into(), Value::Array(path_to_json(path)));
                map.insert("ld".into(), before.clone());
                map.insert("li".into(), after.clone());
            }
            Component::ObjectReplace { path, before, after } => {
                map.insert("p".into(), Value::Array(path_to_json(path)));
                if let Some(before) = before {
                    map.insert("od".into(), before.clone());
                }
                if let Some(after) = after {
                    map.insert("oi".into(), after.clone());
                }
            }
            Component::NumberAdd { path, delta } => {
                map.insert("p".into(), Value::Array(path_to_json(path)));
                map.insert("na".into(), Value::from(*delta));
            }
            Component::TextInsert { path, offset, text } => {
                let mut p = path_to_json(path);
                p.push(Value::from(*offset));
                map.insert("p".into(), Value::Array(p));
                map.insert("si".into(), Value::String(text.clone()));
            }
            Component::TextDelete { path, offset, text } => {
                let mut p = path_to_json(path);
                p.push(Value::from(*offset));
                map.insert("p".into(), Value::Array(p));
                map.insert("sd".into(), Value::String(text.clone()));
            }
        }
        Value::Object(map)
    }

    pub fn from_json(raw: &Value) -> Result<Self, WireError> {
        let Value::Object(map) = raw else {
            return Err(WireError::NotAnObject);
        };
        let mut path = path_from_json(map.get("p").ok_or(WireError::MissingPath)?)?;

        if map.contains_key("si") || map.contains_key("sd") {
            let offset = match path.pop() {
                Some(PathSegment::Index(offset)) => offset,
                _ => return Err(WireError::MissingOffset),
            };
            if let Some(text) = map.get("si") {
                let text = text.as_str().ok_or(WireError::BadField("si"))?.to_string();
                return Ok(Component::TextInsert { path, offset, text });
            }
            let text = map
                .get("sd")
                .and_then(Value::as_str)
                .ok_or(WireError::BadField("sd"))?
                .to_string();
            return Ok(Component::TextDelete { path, offset, text });
        }

        match (map.get("ld"), map.get("li")) {
            (Some(before), Some(after)) => {
                return Ok(Component::ListReplace {
                    path,
                    before: before.clone(),
                    after: after.clone(),
                })
            }
            (Some(value), None) => return Ok(Component::ListDelete { path, value: value.clone() }),
            (None, Some(value)) => return Ok(Component::ListInsert { path, value: value.clone() }),
            (None, None) => {}
        }

        if map.contains_key("od") || map.contains_key("oi") {
            return Ok(Component::ObjectReplace {
                path,
                before: map.get("od").cloned(),
                after: map.get("oi").cloned(),
            });
        }

        if let Some(delta) = map.get("na") {
            let delta = delta.as_i64().ok_or(WireError::BadField("na"))?;
            return Ok(Component::NumberAdd { path, delta });
        }

        Err(WireError::UnknownShape)
    }
}

impl Serialize for Component {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Component {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Component::from_json(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_offset_is_last_path_element() {
        let op = Component::TextInsert {
            path: vec!["units".into(), 2.into(), "source".into()],
            offset: 4,
            text: "ab".into(),
        };
        assert_eq!(op.to_json(), json!({"p": ["units", 2, "source", 4], "si": "ab"}));
    }

    #[test]
    fn test_null_and_absent_are_distinct() {
        let claim = Component::from_json(&json!({"p": ["host"], "od": null, "oi": "a"})).unwrap();
        assert_eq!(
            claim,
            Component::ObjectReplace {
                path: vec!["host".into()],
                before: Some(Value::Null),
                after: Some(json!("a")),
            }
        );

        let insert = Component::from_json(&json!({"p": ["host"], "oi": "a"})).unwrap();
        assert!(matches!(insert, Component::ObjectReplace { before: None, .. }));
    }

    #[test]
    fn test_list_replace_decodes() {
        let op = Component::from_json(&json!({"p": ["units", 0], "ld": 1, "li": 2})).unwrap();
        assert!(matches!(op, Component::ListReplace { .. }));
    }

    #[test]
    fn test_serde_through_vec() {
        let ops = vec![
            Component::NumberAdd {
                path: vec!["eventCounters".into(), "renderMarkdown".into()],
                delta: 1,
            },
            Component::TextDelete {
                path: vec!["units".into(), 0.into(), "source".into()],
                offset: 6,
                text: "1".into(),
            },
        ];
        let text = serde_json::to_string(&ops).unwrap();
        let back: Vec<Component> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ops);
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Component::from_json(&json!(3)), Err(WireError::NotAnObject));
        assert_eq!(Component::from_json(&json!({"li": 1})), Err(WireError::MissingPath));
        assert_eq!(
            Component::from_json(&json!({"p": ["a", "b"], "si": "x"})),
            Err(WireError::MissingOffset)
        );
        assert_eq!(Component::from_json(&json!({"p": ["a"]})), Err(WireError::UnknownShape));
    }
}

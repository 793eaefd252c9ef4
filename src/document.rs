use serde_json::{Map, Value};

use crate::error::StoreError;

/// A schema-free document: an ordered mapping from field name to value.
pub type Document = Map<String, Value>;

/// Outcome of resolving a dotted path against a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<'a> {
    /// No value exists at the path.
    Absent,
    /// The path resolved through embedded documents only.
    One(&'a Value),
    /// The path crossed at least one array, fanning out over its elements.
    Many(Vec<&'a Value>),
}

impl<'a> Resolved<'a> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Resolved::Absent)
    }

    /// All resolved values, in document order.
    pub fn values(&self) -> Vec<&'a Value> {
        match self {
            Resolved::Absent => Vec::new(),
            Resolved::One(v) => vec![*v],
            Resolved::Many(vs) => vs.clone(),
        }
    }
}

/// Convert a JSON value into a document, rejecting anything but objects.
pub fn into_document(value: Value) -> Result<Document, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::NotAnObject),
    }
}

/// Resolve a dotted path such as `"characters.characterID"`.
///
/// When an intermediate value is an array, the remainder of the path is
/// resolved against each element and the results are concatenated; elements
/// that lack the remaining path contribute nothing.
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Resolved<'a> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Resolved::Absent;
    };
    let Some(root) = doc.get(first) else {
        return Resolved::Absent;
    };
    let rest: Vec<&str> = segments.collect();

    let mut out = Vec::new();
    let fanned = walk(root, &rest, &mut out);
    match (fanned, out.len()) {
        (_, 0) => Resolved::Absent,
        (false, 1) => Resolved::One(out[0]),
        _ => Resolved::Many(out),
    }
}

/// Returns true if an array was crossed on the way down.
fn walk<'a>(current: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) -> bool {
    let Some((head, tail)) = rest.split_first() else {
        out.push(current);
        return false;
    };
    match current {
        Value::Object(map) => match map.get(*head) {
            Some(next) => walk(next, tail, out),
            None => false,
        },
        Value::Array(items) => {
            for item in items {
                if let Value::Object(map) = item {
                    if let Some(next) = map.get(*head) {
                        walk(next, tail, out);
                    }
                }
            }
            true
        }
        _ => false,
    }
}

/// Set a value at a dotted path, creating (or replacing non-object)
/// intermediate documents as needed. Existing values are overwritten.
pub fn set_field(doc: &mut Document, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = doc;
    for part in parents {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Check a field path: non-empty segments, no leading `$`.
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("field path must not be empty".into());
    }
    if path.starts_with('$') {
        return Err(format!("field path '{path}' must not start with '$'"));
    }
    if path.split('.').any(str::is_empty) {
        return Err(format!("field path '{path}' has an empty segment"));
    }
    Ok(())
}

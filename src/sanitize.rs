//! Conversion of document graphs into cycle-free JSON trees.
//!
//! Cycle detection is path-scoped: a map is replaced by `null` only when it
//! already appears among its own ancestors. Two sibling branches that point
//! at the same map are each expanded in full.

use crate::value::{NodeId, RawDocument, RawValue, format_timestamp};
use serde_json::{Map, Number, Value as JsonValue};

/// Serialization-safe value tree.
pub type SafeValue = JsonValue;

/// Sanitize a whole document starting from its root map.
pub fn sanitize(doc: &RawDocument) -> SafeValue {
    sanitize_value(doc, &RawValue::Map(doc.root()))
}

/// Sanitize a single value that belongs to `doc`.
///
/// Each call starts with an empty ancestor path.
pub fn sanitize_value(doc: &RawDocument, value: &RawValue) -> SafeValue {
    let mut path = Vec::new();
    walk(doc, value, &mut path)
}

fn walk(doc: &RawDocument, value: &RawValue, path: &mut Vec<NodeId>) -> SafeValue {
    match value {
        RawValue::Null => JsonValue::Null,
        RawValue::Bool(b) => JsonValue::Bool(*b),
        RawValue::Int(n) => JsonValue::Number((*n).into()),
        // Number::from_f64 rejects NaN and infinities
        RawValue::Float(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        RawValue::Text(s) | RawValue::Identifier(s) => JsonValue::String(s.clone()),
        RawValue::Timestamp(ts) => JsonValue::String(format_timestamp(ts)),
        RawValue::Sequence(items) => {
            JsonValue::Array(items.iter().map(|item| walk(doc, item, path)).collect())
        }
        RawValue::Map(node) => {
            if path.contains(node) {
                return JsonValue::Null;
            }
            let Some(entries) = doc.map(*node) else {
                return JsonValue::Null;
            };

            path.push(*node);
            let mut object = Map::with_capacity(entries.len());
            for (key, child) in entries {
                object.insert(key.clone(), walk(doc, child, path));
            }
            path.pop();

            JsonValue::Object(object)
        }
    }
}

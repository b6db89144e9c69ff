//! Dynamically shaped source documents.
//!
//! A [`RawDocument`] is an arena of maps. Map values refer to other maps by
//! [`NodeId`], which lets a document share a sub-object between several
//! parents, or reference one of its own ancestors, without reference
//! counting. The sanitizer turns this graph into a plain JSON tree.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Index of a map inside a [`RawDocument`] arena.
pub type NodeId = usize;

/// A single value inside a source document.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Null / missing
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point, possibly non-finite
    Float(f64),
    /// Text
    Text(String),
    /// Opaque database identifier, already rendered as canonical text
    Identifier(String),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Ordered sequence
    Sequence(Vec<RawValue>),
    /// Reference to a map node in the owning document
    Map(NodeId),
}

impl RawValue {
    /// Interpret this value as a timestamp usable for staging.
    ///
    /// Accepts native timestamps and text in RFC 3339 or
    /// `YYYY-MM-DD[ T]HH:MM:SS[.f]` (taken as UTC).
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            RawValue::Timestamp(ts) => Some(*ts),
            RawValue::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Canonical text for identifier-like values.
    pub fn as_key(&self) -> Option<String> {
        match self {
            RawValue::Identifier(s) | RawValue::Text(s) => Some(s.clone()),
            RawValue::Int(n) => Some(n.to_string()),
            RawValue::Timestamp(ts) => Some(format_timestamp(ts)),
            _ => None,
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Int(n)
    }
}

impl From<f64> for RawValue {
    fn from(f: f64) -> Self {
        RawValue::Float(f)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(ts: DateTime<Utc>) -> Self {
        RawValue::Timestamp(ts)
    }
}

/// Ordered key/value entries of one map node.
pub type RawMap = Vec<(String, RawValue)>;

/// A source document: a root map plus every map reachable from it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    nodes: Vec<RawMap>,
    root: NodeId,
}

impl Default for RawDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl RawDocument {
    /// Create a document with an empty root map.
    pub fn new() -> Self {
        Self {
            nodes: vec![Vec::new()],
            root: 0,
        }
    }

    /// Root map node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Allocate a new, empty map node.
    pub fn add_map(&mut self) -> NodeId {
        self.nodes.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Set `key` on map `node`, replacing an existing entry of the same key.
    ///
    /// # Panics
    ///
    /// Panics if `node` was not allocated by this document.
    pub fn insert(&mut self, node: NodeId, key: impl Into<String>, value: impl Into<RawValue>) {
        let key = key.into();
        let value = value.into();
        let map = &mut self.nodes[node];
        match map.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => map.push((key, value)),
        }
    }

    /// Set `key` on the root map.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<RawValue>) -> &mut Self {
        let root = self.root;
        self.insert(root, key, value);
        self
    }

    /// Entries of map `node`, or `None` for an unknown node.
    pub fn map(&self, node: NodeId) -> Option<&RawMap> {
        self.nodes.get(node)
    }

    /// Look up a top-level field.
    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.nodes[self.root]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Number of map nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Render a timestamp the way it is stored in staged JSON.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().to_string()
}

/// Parse text timestamps accepted by the loader.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_insert_replaces_existing_key() {
        let mut doc = RawDocument::new();
        doc.set("status", "new").set("status", "paid");
        assert_eq!(doc.get("status"), Some(&RawValue::Text("paid".into())));
        assert_eq!(doc.map(doc.root()).map(|m| m.len()), Some(1));
    }

    #[test]
    fn test_nested_maps_share_arena() {
        let mut doc = RawDocument::new();
        let client = doc.add_map();
        doc.insert(client, "name", "Olga");
        doc.set("client", RawValue::Map(client));
        assert_eq!(doc.node_count(), 2);
        assert_eq!(doc.get("client"), Some(&RawValue::Map(client)));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 2, 17, 10, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2025-02-17T10:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-02-17 10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-02-17T10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_as_timestamp() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(RawValue::Timestamp(ts).as_timestamp(), Some(ts));
        assert_eq!(RawValue::Float(f64::NAN).as_timestamp(), None);
        assert_eq!(RawValue::Null.as_timestamp(), None);
    }

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2025, 2, 17, 9, 5, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2025-02-17 09:05:00");
    }
}

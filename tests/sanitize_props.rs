//! Property tests for document sanitizing.

use mongo_stage_sync::{RawDocument, RawValue, SafeValue, sanitize};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Leaf {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Ref(usize),
    Refs(Vec<usize>),
}

fn leaf() -> impl Strategy<Value = Leaf> {
    prop_oneof![
        Just(Leaf::Null),
        any::<i64>().prop_map(Leaf::Int),
        prop_oneof![
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(f64::NEG_INFINITY),
            -1e9..1e9f64
        ]
        .prop_map(Leaf::Float),
        "[a-z]{0,8}".prop_map(Leaf::Text),
        (0usize..5).prop_map(Leaf::Ref),
        prop::collection::vec(0usize..5, 0..3).prop_map(Leaf::Refs),
    ]
}

/// Up to five maps whose values may point at any map, including ancestors.
fn graph() -> impl Strategy<Value = RawDocument> {
    (1usize..=5)
        .prop_flat_map(|nodes| {
            prop::collection::vec(
                prop::collection::vec(("[a-z]{1,4}", leaf()), 0..4),
                nodes,
            )
        })
        .prop_map(|maps| {
            let mut doc = RawDocument::new();
            let mut ids = vec![doc.root()];
            for _ in 1..maps.len() {
                ids.push(doc.add_map());
            }
            let target = |i: usize| RawValue::Map(ids[i % ids.len()]);

            for (node, entries) in maps.iter().enumerate() {
                for (key, value) in entries {
                    let value = match value {
                        Leaf::Null => RawValue::Null,
                        Leaf::Int(n) => RawValue::Int(*n),
                        Leaf::Float(f) => RawValue::Float(*f),
                        Leaf::Text(s) => RawValue::Text(s.clone()),
                        Leaf::Ref(i) => target(*i),
                        Leaf::Refs(is) => RawValue::Sequence(is.iter().map(|i| target(*i)).collect()),
                    };
                    doc.insert(ids[node], key.clone(), value);
                }
            }
            doc
        })
}

fn map_depth(value: &SafeValue) -> usize {
    match value {
        SafeValue::Object(map) => 1 + map.values().map(map_depth).max().unwrap_or(0),
        SafeValue::Array(items) => items.iter().map(map_depth).max().unwrap_or(0),
        _ => 0,
    }
}

proptest! {
    #[test]
    fn sanitize_terminates_with_serializable_tree(doc in graph()) {
        let safe = sanitize(&doc);
        prop_assert!(safe.is_object());
        prop_assert!(serde_json::to_string(&safe).is_ok());
    }

    #[test]
    fn no_map_repeats_along_a_path(doc in graph()) {
        // Each map can appear at most once per root-to-leaf path
        let safe = sanitize(&doc);
        prop_assert!(map_depth(&safe) <= doc.node_count());
    }

    #[test]
    fn sanitize_is_deterministic(doc in graph()) {
        prop_assert_eq!(sanitize(&doc), sanitize(&doc));
    }
}

#[test]
fn self_reference_at_root_becomes_null() {
    let mut doc = RawDocument::new();
    let root = doc.root();
    doc.insert(root, "me", RawValue::Map(root));
    assert_eq!(sanitize(&doc), serde_json::json!({"me": null}));
}

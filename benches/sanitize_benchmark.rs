//! Benchmarks for mongo-stage-sync document handling.

use chrono::{TimeZone, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mongo_stage_sync::config::StreamDescriptor;
use mongo_stage_sync::load::prepare_batch;
use mongo_stage_sync::{RawDocument, RawValue, sanitize};

/// A lead-like document with nested contact data and a back reference.
fn lead(i: i64) -> RawDocument {
    let mut doc = RawDocument::new();
    let root = doc.root();
    doc.insert(root, "_id", RawValue::Identifier(format!("65d0{:020x}", i)));
    doc.insert(
        root,
        "lead_created_at",
        Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
    );
    doc.insert(root, "cost", 19.5);

    let contact = doc.add_map();
    doc.insert(contact, "phone", "+7 900 000 00 00");
    doc.insert(contact, "owner", RawValue::Map(root));
    doc.insert(root, "contact", RawValue::Map(contact));

    let tags = (0..8).map(|t| RawValue::from(format!("tag-{}", t))).collect();
    doc.insert(root, "tags", RawValue::Sequence(tags));
    doc
}

/// Deeply nested chain of maps.
fn nested(depth: usize) -> RawDocument {
    let mut doc = RawDocument::new();
    let mut node = doc.root();
    for level in 0..depth {
        let child = doc.add_map();
        doc.insert(node, "level", level as i64);
        doc.insert(node, "child", RawValue::Map(child));
        node = child;
    }
    doc
}

fn bench_sanitize(c: &mut Criterion) {
    let doc = lead(1);
    c.bench_function("sanitize_lead", |b| b.iter(|| black_box(sanitize(&doc))));

    let deep = nested(256);
    c.bench_function("sanitize_nested_256", |b| {
        b.iter(|| black_box(sanitize(&deep)))
    });
}

fn bench_prepare_batch(c: &mut Criterion) {
    let stream = StreamDescriptor::new("leads", "lead_created_at", "wf_leads");
    let docs: Vec<RawDocument> = (0..1000).rev().map(lead).collect();

    c.bench_function("prepare_batch_1000", |b| {
        b.iter(|| black_box(prepare_batch(&stream, &docs)))
    });
}

criterion_group!(benches, bench_sanitize, bench_prepare_batch);
criterion_main!(benches);

//! In-memory source and staging store.
//!
//! Both follow the same contracts as the MongoDB and PostgreSQL adapters and
//! support failure injection, which makes pipeline behavior testable without
//! running databases.

use crate::error::{Error, Result};
use crate::source::{DocumentSource, SourceQuery};
use crate::store::{CommitReport, StagedBatch, StagedRow, StagingStore};
use crate::value::{RawDocument, RawValue, format_timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sort position of a timestamp field, following BSON type order: dates
/// above strings above everything else.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Stamp<'a> {
    Other,
    Text(&'a str),
    Date(DateTime<Utc>),
}

impl<'a> Stamp<'a> {
    fn of(document: &'a RawDocument, field: &str) -> Self {
        match document.get(field) {
            Some(RawValue::Timestamp(ts)) => Stamp::Date(*ts),
            Some(RawValue::Text(text)) => Stamp::Text(text.as_str()),
            _ => Stamp::Other,
        }
    }

    /// `$gt` against a date bound or its canonical text, never across types.
    fn is_after(&self, after: DateTime<Utc>, after_text: &str) -> bool {
        match self {
            Stamp::Date(ts) => *ts > after,
            Stamp::Text(text) => *text > after_text,
            Stamp::Other => false,
        }
    }
}

fn offline_error(what: &str) -> Error {
    Error::PostgresConnection {
        message: format!("{} unavailable", what),
        source: None,
    }
}

/// Collections of documents held in memory.
#[derive(Default)]
pub struct MemorySource {
    collections: Mutex<HashMap<String, Vec<RawDocument>>>,
    offline: AtomicBool,
    fail_fetches: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to a collection.
    pub fn insert(&self, collection: &str, documents: impl IntoIterator<Item = RawDocument>) {
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    /// Make every call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` fetches.
    pub fn fail_next_fetches(&self, count: usize) {
        self.fail_fetches.store(count, Ordering::SeqCst);
    }

    /// Number of fetches served or attempted.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn find_newer(&self, query: SourceQuery<'_>) -> Result<Vec<RawDocument>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) || self.take_failure() {
            return Err(Error::source_query(query.collection, "source unavailable", None));
        }

        let field = query.timestamp_field;
        let after_text = query.after.as_ref().map(format_timestamp);

        let collections = lock(&self.collections);
        let mut documents: Vec<RawDocument> = collections
            .get(query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| match (query.after, after_text.as_deref()) {
                        (Some(after), Some(text)) => Stamp::of(doc, field).is_after(after, text),
                        _ => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // Newest first; documents without a timestamp sort last
        documents.sort_by(|a, b| Stamp::of(b, field).cmp(&Stamp::of(a, field)));
        Ok(documents)
    }

    async fn ping(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::source_query("", "source unavailable", None));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    tables: HashMap<String, Vec<StagedRow>>,
    watermarks: HashMap<String, DateTime<Utc>>,
    schema_tables: Vec<String>,
    applied_scripts: Vec<String>,
}

/// Staging store held in memory with all-or-nothing batch commits.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    offline: AtomicBool,
    fail_commits: AtomicUsize,
    failing_script: Mutex<Option<String>>,
    commit_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` batch commits after their rows were written,
    /// exercising rollback.
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Make the script with this name fail.
    pub fn fail_script(&self, name: impl Into<String>) {
        *lock(&self.failing_script) = Some(name.into());
    }

    /// Hold every commit open for `delay` before it becomes visible.
    pub fn set_commit_delay(&self, delay: Duration) {
        *lock(&self.commit_delay) = Some(delay);
    }

    /// Rows of a staging table in insertion order.
    pub fn rows(&self, table: &str) -> Vec<StagedRow> {
        lock(&self.state).tables.get(table).cloned().unwrap_or_default()
    }

    /// Current watermark without failure injection.
    pub fn watermark(&self, workflow_key: &str) -> Option<DateTime<Utc>> {
        lock(&self.state).watermarks.get(workflow_key).copied()
    }

    /// Tables created through `ensure_schema`.
    pub fn schema_tables(&self) -> Vec<String> {
        lock(&self.state).schema_tables.clone()
    }

    /// Names of successfully applied scripts, in completion order.
    pub fn applied_scripts(&self) -> Vec<String> {
        lock(&self.state).applied_scripts.clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(offline_error("staging store"));
        }
        Ok(())
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn ensure_schema(&self, tables: &[String]) -> Result<()> {
        self.check_online()?;
        let mut state = lock(&self.state);
        for table in tables {
            if !state.schema_tables.contains(table) {
                state.schema_tables.push(table.clone());
            }
        }
        Ok(())
    }

    async fn last_batch_date(&self, workflow_key: &str) -> Result<Option<DateTime<Utc>>> {
        self.check_online()?;
        Ok(self.watermark(workflow_key))
    }

    async fn advance_watermark(&self, workflow_key: &str, date: DateTime<Utc>) -> Result<()> {
        self.check_online()?;
        lock(&self.state)
            .watermarks
            .insert(workflow_key.to_string(), date);
        Ok(())
    }

    async fn commit_batch(&self, table: &str, batch: &StagedBatch) -> Result<CommitReport> {
        self.check_online()?;

        // Stage into a copy; only a completed commit replaces the live state
        let mut staged = lock(&self.state).clone();
        let mut report = CommitReport::default();
        let rows = staged.tables.entry(table.to_string()).or_default();
        for row in &batch.rows {
            if rows.iter().any(|existing| existing.id == row.id) {
                report.duplicates += 1;
            } else {
                rows.push(row.clone());
                report.inserted += 1;
            }
        }
        if let Some(date) = batch.watermark {
            staged.watermarks.insert(batch.workflow_key.clone(), date);
            report.watermark_advanced = true;
        }

        let delay = *lock(&self.commit_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(offline_error("commit"));
        }

        let mut state = lock(&self.state);
        // Replace only what this batch touched so concurrent streams do not
        // overwrite each other
        let committed = staged.tables.remove(table).unwrap_or_default();
        let existing = state.tables.entry(table.to_string()).or_default();
        for row in committed {
            if !existing.iter().any(|r| r.id == row.id) {
                existing.push(row);
            }
        }
        if let Some(date) = batch.watermark {
            state.watermarks.insert(batch.workflow_key.clone(), date);
        }
        Ok(report)
    }

    async fn apply_script(&self, name: &str, _sql: &str) -> Result<()> {
        self.check_online()?;
        if lock(&self.failing_script).as_deref() == Some(name) {
            return Err(Error::transform(name, "injected failure"));
        }
        lock(&self.state).applied_scripts.push(name.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: &str) -> StagedRow {
        StagedRow {
            id: id.to_string(),
            object_value: format!(r#"{{"_id":"{}"}}"#, id),
            update_ts: Utc.with_ymd_and_hms(2025, 2, 17, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let batch = StagedBatch {
            workflow_key: "wf_ads".into(),
            rows: vec![row("a"), row("b")],
            watermark: Some(Utc.with_ymd_and_hms(2025, 2, 17, 0, 0, 0).unwrap()),
        };

        assert!(store.commit_batch("ads", &batch).await.is_err());
        assert!(store.rows("ads").is_empty());
        assert_eq!(store.watermark("wf_ads"), None);

        let report = store.commit_batch("ads", &batch).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(store.rows("ads").len(), 2);
    }

    fn stamped(id: &str, created_at: RawValue) -> RawDocument {
        let mut doc = RawDocument::new();
        doc.set("_id", id).set("created_at", created_at);
        doc
    }

    fn query(after: Option<DateTime<Utc>>) -> SourceQuery<'static> {
        SourceQuery {
            collection: "ads",
            timestamp_field: "created_at",
            after,
        }
    }

    fn ids(documents: &[RawDocument]) -> Vec<String> {
        documents
            .iter()
            .filter_map(|d| d.get("_id").and_then(|v| v.as_key()))
            .collect()
    }

    #[tokio::test]
    async fn test_text_timestamps_compare_as_text() {
        let source = MemorySource::new();
        source.insert(
            "ads",
            [
                stamped("old", RawValue::Text("2025-02-16 23:00:00".into())),
                stamped("new", RawValue::Text("2025-02-17 09:00:00".into())),
                stamped("number", RawValue::Int(1_800_000_000)),
            ],
        );

        let after = Utc.with_ymd_and_hms(2025, 2, 17, 0, 0, 0).unwrap();
        let documents = source.find_newer(query(Some(after))).await.unwrap();
        assert_eq!(ids(&documents), vec!["new"]);
    }

    #[tokio::test]
    async fn test_dates_sort_above_text() {
        let source = MemorySource::new();
        let date = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        source.insert(
            "ads",
            [
                stamped("text", RawValue::Text("2025-03-01 00:00:00".into())),
                stamped("none", RawValue::Null),
                stamped("date", RawValue::Timestamp(date)),
            ],
        );

        let documents = source.find_newer(query(None)).await.unwrap();
        assert_eq!(ids(&documents), vec!["date", "text", "none"]);
    }

    #[tokio::test]
    async fn test_conflicting_id_keeps_first_write() {
        let store = MemoryStore::new();
        let mut first = row("a");
        first.object_value = "first".into();
        let mut second = row("a");
        second.object_value = "second".into();

        let batch = |r: StagedRow| StagedBatch {
            workflow_key: "wf_ads".into(),
            rows: vec![r],
            watermark: None,
        };
        store.commit_batch("ads", &batch(first)).await.unwrap();
        let report = store.commit_batch("ads", &batch(second)).await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(store.rows("ads")[0].object_value, "first");
    }
}

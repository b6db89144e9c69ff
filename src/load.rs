//! Sanitize-and-stage loading of fetched documents.

use crate::config::StreamDescriptor;
use crate::error::{Error, Result, with_timeout};
use crate::sanitize::sanitize;
use crate::store::{StagedBatch, StagedRow, StagingStore};
use crate::value::RawDocument;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Outcome of loading one stream's batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Documents handed to the loader
    pub fetched: usize,
    /// Rows newly inserted
    pub inserted: usize,
    /// Rows already present (absorbed by the primary key)
    pub duplicates: usize,
    /// Documents dropped for a missing id or timestamp
    pub dropped: usize,
    /// Watermark recorded with the batch
    pub watermark: Option<DateTime<Utc>>,
}

/// Turn fetched documents into staged rows and the batch watermark.
///
/// `documents` must be ordered newest first. The watermark is the timestamp
/// of the first document that can be staged; it is not a maximum over the
/// batch, so out-of-order source clocks can advance it past rows that were
/// not fetched yet.
pub fn prepare_batch(
    stream: &StreamDescriptor,
    documents: &[RawDocument],
) -> Result<(StagedBatch, usize)> {
    let mut rows = Vec::with_capacity(documents.len());
    let mut watermark = None;
    let mut dropped = 0;

    for document in documents {
        let safe = sanitize(document);
        let object_value = serde_json::to_string(&safe)
            .map_err(|e| Error::serialization(format!("Document in {} not serializable", stream.source), e))?;

        let Some(update_ts) = document
            .get(&stream.timestamp_field)
            .and_then(|value| value.as_timestamp())
        else {
            debug!(
                "Dropping document without usable {} from {}",
                stream.timestamp_field, stream.source
            );
            dropped += 1;
            continue;
        };

        let Some(id) = document.get(&stream.id_field).and_then(|value| value.as_key()) else {
            warn!(
                "Dropping document without usable {} from {}",
                stream.id_field, stream.source
            );
            dropped += 1;
            continue;
        };

        if watermark.is_none() {
            watermark = Some(update_ts);
        }

        rows.push(StagedRow {
            id,
            object_value,
            update_ts,
        });
    }

    let batch = StagedBatch {
        workflow_key: stream.workflow_key.clone(),
        rows,
        watermark,
    };
    Ok((batch, dropped))
}

/// Writes sanitized batches into staging tables.
///
/// The store bounds each statement it sends; `batch_timeout` bounds the
/// whole commit.
#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn StagingStore>,
    batch_timeout: Duration,
}

impl Loader {
    /// Create a loader.
    pub fn new(store: Arc<dyn StagingStore>, batch_timeout: Duration) -> Self {
        Self { store, batch_timeout }
    }

    /// Stage `documents` (newest first) into the stream's table and advance
    /// its watermark, all in one unit of work.
    ///
    /// An empty batch is a no-op. On error nothing is written and the
    /// watermark keeps its previous value.
    #[instrument(skip(self, documents, stream), fields(table = %stream.table_name(), count = documents.len()))]
    pub async fn load(&self, documents: &[RawDocument], stream: &StreamDescriptor) -> Result<LoadReport> {
        if documents.is_empty() {
            info!("No new documents for {}", stream.table_name());
            return Ok(LoadReport::default());
        }

        let (batch, dropped) = prepare_batch(stream, documents)?;
        if dropped > 0 {
            warn!("Dropped {} of {} documents from {}", dropped, documents.len(), stream.source);
        }

        let operation = format!("commit batch to {}", stream.table_name());
        let commit = self.store.commit_batch(stream.table_name(), &batch);
        let committed = with_timeout(&operation, self.batch_timeout, commit).await?;

        info!(
            "Staged {} rows into {} ({} duplicates, {} dropped), watermark {}",
            committed.inserted,
            stream.table_name(),
            committed.duplicates,
            dropped,
            batch
                .watermark
                .map_or_else(|| "unchanged".to_string(), |w| w.to_rfc3339())
        );

        Ok(LoadReport {
            fetched: documents.len(),
            inserted: committed.inserted,
            duplicates: committed.duplicates,
            dropped,
            watermark: batch.watermark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::value::RawValue;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, day, 9, 0, 0).unwrap()
    }

    fn ad(id: &str, created: Option<DateTime<Utc>>) -> RawDocument {
        let mut doc = RawDocument::new();
        doc.set("_id", RawValue::Identifier(id.to_string()));
        if let Some(ts) = created {
            doc.set("created_at", ts);
        }
        doc
    }

    fn stream() -> StreamDescriptor {
        StreamDescriptor::new("ads", "created_at", "wf_ads")
    }

    fn loader() -> (Arc<MemoryStore>, Loader) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Loader::new(store, Duration::from_secs(1)))
    }

    #[test]
    fn test_prepare_batch_takes_first_timestamp() {
        let docs = [ad("a", Some(t(12))), ad("b", Some(t(11)))];
        let (batch, dropped) = prepare_batch(&stream(), &docs).unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(batch.watermark, Some(t(12)));
        assert_eq!(batch.rows[0].id, "a");
        assert_eq!(
            batch.rows[0].object_value,
            r#"{"_id":"a","created_at":"2025-02-12 09:00:00"}"#
        );
    }

    #[test]
    fn test_prepare_batch_follows_order_not_maximum() {
        // Clock skew: the first document is older than the second
        let docs = [ad("a", Some(t(10))), ad("b", Some(t(14)))];
        let (batch, _) = prepare_batch(&stream(), &docs).unwrap();
        assert_eq!(batch.watermark, Some(t(10)));
    }

    #[test]
    fn test_document_without_timestamp_dropped() {
        let docs = [ad("x", None), ad("a", Some(t(12)))];
        let (batch, dropped) = prepare_batch(&stream(), &docs).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.watermark, Some(t(12)));
    }

    #[test]
    fn test_nan_timestamp_dropped() {
        let mut doc = ad("n", None);
        doc.set("created_at", f64::NAN);
        let (batch, dropped) = prepare_batch(&stream(), &[doc]).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(batch.watermark, None);
    }

    #[test]
    fn test_document_without_id_dropped() {
        let mut doc = RawDocument::new();
        doc.set("created_at", t(12));
        let (batch, dropped) = prepare_batch(&stream(), &[doc]).unwrap();
        assert_eq!(dropped, 1);
        assert!(batch.rows.is_empty());
    }

    #[test]
    fn test_nan_field_nulled_document_kept() {
        let mut doc = ad("a", Some(t(12)));
        doc.set("cost", f64::NAN);
        let (batch, dropped) = prepare_batch(&stream(), &[doc]).unwrap();
        assert_eq!(dropped, 0);
        assert!(batch.rows[0].object_value.contains(r#""cost":null"#));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (store, loader) = loader();
        let report = loader.load(&[], &stream()).await.unwrap();
        assert_eq!(report, LoadReport::default());
        assert_eq!(store.watermark("wf_ads"), None);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (store, loader) = loader();
        let docs = [ad("a", Some(t(12))), ad("b", Some(t(11)))];

        let first = loader.load(&docs, &stream()).await.unwrap();
        let rows_after_first = store.rows("ads");
        let second = loader.load(&docs, &stream()).await.unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.rows("ads"), rows_after_first);
        assert_eq!(store.watermark("wf_ads"), Some(t(12)));
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_previous_watermark() {
        let (store, loader) = loader();
        store.advance_watermark("wf_ads", t(1)).await.unwrap();
        store.fail_next_commits(1);

        let docs = [ad("a", Some(t(12)))];
        assert!(loader.load(&docs, &stream()).await.is_err());
        assert!(store.rows("ads").is_empty());
        assert_eq!(store.watermark("wf_ads"), Some(t(1)));
    }
}

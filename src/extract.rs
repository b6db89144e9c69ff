//! Incremental extraction from the source store.

use crate::config::StreamDescriptor;
use crate::error::{Error, with_timeout};
use crate::source::{DocumentSource, SourceQuery};
use crate::value::RawDocument;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

/// Documents fetched for one stream.
///
/// A failed fetch yields no documents and carries the error, so the caller
/// can record the failure without treating it as fatal.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Documents newest first
    pub documents: Vec<RawDocument>,
    /// Error reported by the source, if the fetch failed
    pub error: Option<Error>,
}

impl Extraction {
    /// Whether the fetch failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Fetches documents newer than a watermark.
///
/// `batch_timeout` bounds draining the whole result; the source bounds
/// each round trip on its own.
#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn DocumentSource>,
    batch_timeout: Duration,
}

impl Extractor {
    /// Create an extractor.
    pub fn new(source: Arc<dyn DocumentSource>, batch_timeout: Duration) -> Self {
        Self { source, batch_timeout }
    }

    /// Fetch every document of `stream` with a timestamp after `watermark`,
    /// or the whole collection when `watermark` is `None`, newest first.
    #[instrument(skip(self, stream), fields(collection = %stream.source))]
    pub async fn fetch(
        &self,
        stream: &StreamDescriptor,
        watermark: Option<DateTime<Utc>>,
    ) -> Extraction {
        let query = SourceQuery {
            collection: &stream.source,
            timestamp_field: &stream.timestamp_field,
            after: watermark,
        };

        let operation = format!("fetch {}", stream.source);
        match with_timeout(&operation, self.batch_timeout, self.source.find_newer(query)).await {
            Ok(documents) => {
                info!(
                    "Fetched {} documents from {} (watermark: {})",
                    documents.len(),
                    stream.source,
                    watermark.map_or_else(|| "none".to_string(), |w| w.to_rfc3339())
                );
                Extraction {
                    documents,
                    error: None,
                }
            }
            Err(e) => {
                error!(code = e.code(), "Fetch from {} failed: {}", stream.source, e);
                Extraction {
                    documents: Vec::new(),
                    error: Some(e),
                }
            }
        }
    }
}

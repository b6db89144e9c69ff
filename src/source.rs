//! Source document store interface.

use crate::error::Result;
use crate::value::RawDocument;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A find-with-filter-and-sort request against one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceQuery<'a> {
    /// Collection name
    pub collection: &'a str,
    /// Field compared against the watermark and used for ordering
    pub timestamp_field: &'a str,
    /// Only return documents strictly newer than this instant
    pub after: Option<DateTime<Utc>>,
}

/// A store that can return documents newer than a watermark.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch documents with `timestamp_field > after` (all documents when
    /// `after` is `None`), newest first.
    async fn find_newer(&self, query: SourceQuery<'_>) -> Result<Vec<RawDocument>>;

    /// Test connectivity.
    async fn ping(&self) -> Result<()>;
}

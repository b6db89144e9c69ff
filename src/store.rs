//! Staging destination interface.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One sanitized document ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedRow {
    /// Source record identity (primary key)
    pub id: String,
    /// Sanitized document serialized as JSON text
    pub object_value: String,
    /// Record timestamp
    pub update_ts: DateTime<Utc>,
}

/// Rows for one stream plus the watermark to record with them.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    /// Watermark key of the stream
    pub workflow_key: String,
    /// Rows in fetch order
    pub rows: Vec<StagedRow>,
    /// New watermark; `None` leaves the stored value untouched
    pub watermark: Option<DateTime<Utc>>,
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Rows newly inserted
    pub inserted: usize,
    /// Rows skipped because their id already existed
    pub duplicates: usize,
    /// Whether the watermark row was written
    pub watermark_advanced: bool,
}

/// Relational staging area owning staged rows and watermarks.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Create the staging schema, settings table and the given stream tables.
    async fn ensure_schema(&self, tables: &[String]) -> Result<()>;

    /// Read the watermark of `workflow_key`.
    async fn last_batch_date(&self, workflow_key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Overwrite the watermark of `workflow_key` outside of any batch.
    async fn advance_watermark(&self, workflow_key: &str, date: DateTime<Utc>) -> Result<()>;

    /// Insert rows (first write wins on id conflict) and record the watermark
    /// as a single unit of work. On error nothing is applied.
    async fn commit_batch(&self, table: &str, batch: &StagedBatch) -> Result<CommitReport>;

    /// Apply one declarative transformation script as a single unit of work.
    async fn apply_script(&self, name: &str, sql: &str) -> Result<()>;

    /// Test connectivity.
    async fn ping(&self) -> Result<()>;
}

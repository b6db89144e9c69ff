//! Per-stream progress cursors.
//!
//! A watermark is the newest source timestamp already staged for a
//! `workflow_key`. Reads fail soft: an unreadable watermark is treated as
//! "no prior runs", which triggers a full backfill that the idempotent
//! loader absorbs.

use crate::error::{Error, Result, with_timeout};
use crate::store::StagingStore;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::GenericClient;
use tracing::{debug, error, info, instrument};

/// Soft-failing view over the watermark rows of a [`StagingStore`].
#[derive(Clone)]
pub struct WatermarkStore {
    store: Arc<dyn StagingStore>,
    timeout: Duration,
}

impl WatermarkStore {
    /// Create a watermark store.
    pub fn new(store: Arc<dyn StagingStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Last staged timestamp for `workflow_key`.
    ///
    /// Returns `None` both when no batch was ever committed and when the
    /// lookup fails; failures are logged.
    #[instrument(skip(self))]
    pub async fn get_last_batch_date(&self, workflow_key: &str) -> Option<DateTime<Utc>> {
        let lookup = self.store.last_batch_date(workflow_key);
        match with_timeout("read watermark", self.timeout, lookup).await {
            Ok(date) => {
                debug!("Watermark for {}: {:?}", workflow_key, date);
                date
            }
            Err(e) => {
                error!(
                    code = e.code(),
                    "Failed to read watermark for {}, falling back to full fetch: {}",
                    workflow_key,
                    e
                );
                None
            }
        }
    }

    /// Overwrite the watermark for `workflow_key` unconditionally.
    ///
    /// Batch loads record their watermark inside the batch transaction; this
    /// stand-alone write is for operator corrections.
    #[instrument(skip(self))]
    pub async fn advance_watermark(&self, workflow_key: &str, new_date: DateTime<Utc>) -> Result<()> {
        let write = self.store.advance_watermark(workflow_key, new_date);
        with_timeout("write watermark", self.timeout, write).await?;
        info!("Watermark for {} set to {}", workflow_key, new_date);
        Ok(())
    }
}

/// Read one watermark row.
pub(crate) async fn read<C: GenericClient + Sync>(
    client: &C,
    settings_table: &str,
    workflow_key: &str,
) -> Result<Option<DateTime<Utc>>> {
    let query = format!(
        "SELECT last_batch_date FROM {} WHERE workflow_key = $1",
        settings_table
    );
    let row = client
        .query_opt(query.as_str(), &[&workflow_key])
        .await
        .map_err(|e| Error::postgres_query(settings_table, "Read watermark failed", e))?;

    Ok(row
        .and_then(|r| r.get::<_, Option<NaiveDateTime>>(0))
        .map(|naive| naive.and_utc()))
}

/// Upsert one watermark row, overwriting any existing value.
pub(crate) async fn upsert<C: GenericClient + Sync>(
    client: &C,
    settings_table: &str,
    workflow_key: &str,
    date: DateTime<Utc>,
) -> Result<()> {
    let query = format!(
        "INSERT INTO {} (workflow_key, last_batch_date) VALUES ($1, $2) \
         ON CONFLICT (workflow_key) DO UPDATE SET last_batch_date = EXCLUDED.last_batch_date",
        settings_table
    );
    let date = date.naive_utc();
    client
        .execute(query.as_str(), &[&workflow_key, &date])
        .await
        .map_err(|e| Error::postgres_query(settings_table, "Write watermark failed", e))?;
    Ok(())
}

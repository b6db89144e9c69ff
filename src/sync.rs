//! Pipeline coordination for mongo-stage-sync.

use crate::config::{RetryConfig, StreamDescriptor, SyncConfig};
use crate::error::{Error, Result, with_timeout};
use crate::extract::Extractor;
use crate::load::{LoadReport, Loader};
use crate::metrics::{Metrics, Timer};
use crate::mongo::MongoSource;
use crate::postgres::PostgresStore;
use crate::source::DocumentSource;
use crate::store::StagingStore;
use crate::transform::{TransformResult, TransformRunner};
use crate::watermark::WatermarkStore;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Restrict the run to these streams (source or workflow key).
    /// Transforms never run for a restricted run.
    pub streams: Vec<String>,
    /// Do not run transforms even if every stream succeeded
    pub skip_transforms: bool,
}

/// Run result.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Run identifier, also recorded on the run's tracing span
    pub run_id: String,
    /// Whether every stream and transform succeeded
    pub success: bool,
    /// Per-stream results keyed by workflow key
    pub streams: BTreeMap<String, StreamSyncResult>,
    /// Transform results in completion order
    pub transforms: Vec<TransformResult>,
    /// Whether the transform stage was skipped
    pub transforms_skipped: bool,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the run completed
    pub completed_at: String,
    /// Error message if failed
    pub error: Option<String>,
}

impl RunResult {
    /// Total rows inserted across streams.
    pub fn total_inserted(&self) -> usize {
        self.streams.values().map(|s| s.report.inserted).sum()
    }

    /// Total documents fetched across streams.
    pub fn total_fetched(&self) -> usize {
        self.streams.values().map(|s| s.report.fetched).sum()
    }

    /// Check if all streams synced successfully.
    pub fn all_streams_success(&self) -> bool {
        self.streams.values().all(|s| s.success)
    }

    /// Workflow keys of failed streams.
    pub fn failed_streams(&self) -> Vec<&str> {
        self.streams
            .values()
            .filter(|s| !s.success)
            .map(|s| s.workflow_key.as_str())
            .collect()
    }
}

/// Per-stream sync result.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSyncResult {
    /// Source collection
    pub source: String,
    /// Staging table
    pub table: String,
    /// Watermark key
    pub workflow_key: String,
    /// Whether the stream was staged
    pub success: bool,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Load outcome; empty when the stream failed
    pub report: LoadReport,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Error message if failed
    pub error: Option<String>,
}

/// Watermark of one stream as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    /// Source collection
    pub source: String,
    /// Staging table
    pub table: String,
    /// Watermark key
    pub workflow_key: String,
    /// Stored watermark, if any batch was committed
    pub last_batch_date: Option<DateTime<Utc>>,
}

/// Sync progress callback.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Sync progress update.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Source collection of the stream
    pub stream: String,
    /// Current phase
    pub phase: SyncPhase,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Documents involved in the phase, once known
    pub documents: Option<usize>,
}

/// Sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Reading the stream watermark
    ReadingWatermark,
    /// Fetching documents from the source
    Fetching,
    /// Staging documents and advancing the watermark
    Loading,
    /// Completed
    Completed,
    /// Failed
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::ReadingWatermark => write!(f, "reading watermark"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Loading => write!(f, "loading"),
            SyncPhase::Completed => write!(f, "completed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Main sync client.
pub struct SyncClient {
    config: SyncConfig,
    source: Arc<dyn DocumentSource>,
    store: Arc<dyn StagingStore>,
    watermarks: WatermarkStore,
    extractor: Extractor,
    loader: Loader,
    transforms: TransformRunner,
    metrics: Arc<Metrics>,
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl SyncClient {
    /// Create a sync client backed by MongoDB and PostgreSQL.
    #[instrument(skip(config))]
    pub async fn new(config: SyncConfig) -> Result<Self> {
        info!("Initializing sync client...");

        let source = MongoSource::connect(&config.source, config.sync.timeout()).await?;
        let store = PostgresStore::new(config.postgres.clone(), config.sync.timeout())?;

        Ok(Self::with_parts(config, Arc::new(source), Arc::new(store)))
    }

    /// Create a sync client over arbitrary source and staging adapters.
    pub fn with_parts(
        config: SyncConfig,
        source: Arc<dyn DocumentSource>,
        store: Arc<dyn StagingStore>,
    ) -> Self {
        let timeout = config.sync.timeout();
        let batch_timeout = config.sync.batch_timeout();
        Self {
            watermarks: WatermarkStore::new(store.clone(), timeout),
            extractor: Extractor::new(source.clone(), batch_timeout),
            loader: Loader::new(store.clone(), batch_timeout),
            transforms: TransformRunner::new(store.clone(), timeout),
            metrics: Arc::new(Metrics::new()),
            progress_callback: None,
            config,
            source,
            store,
        }
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(SyncProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Metrics accumulated by this client.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Watermark access for this client's store.
    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Test connectivity to both databases.
    pub async fn test_connectivity(&self) -> Result<()> {
        info!("Testing connectivity...");
        let timeout = self.config.sync.timeout();

        with_timeout("ping source", timeout, self.source.ping()).await?;
        info!("MongoDB: OK");

        with_timeout("ping staging", timeout, self.store.ping()).await?;
        info!("PostgreSQL: OK");

        Ok(())
    }

    /// Create the staging schema, settings table and stream tables.
    pub async fn ensure_schema(&self) -> Result<()> {
        let tables: Vec<String> = self
            .config
            .enabled_streams()
            .map(|s| s.table_name().to_string())
            .collect();
        with_timeout(
            "ensure schema",
            self.config.sync.batch_timeout(),
            self.store.ensure_schema(&tables),
        )
        .await
    }

    /// Run every enabled stream, then the transform stages.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<RunResult> {
        self.sync_with(&SyncOptions::default(), cancel).await
    }

    /// Run the selected streams, then the transform stages if allowed.
    ///
    /// Stream failures are reported in the result; only setup errors
    /// (unknown stream names, schema creation) are returned as `Err`.
    pub async fn sync_with(
        &self,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("sync_run", run_id = %run_id);
        self.run(run_id, options, cancel).instrument(span).await
    }

    async fn run(
        &self,
        run_id: String,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let start = Instant::now();
        let streams = self.select_streams(&options.streams)?;

        info!("Starting sync of {} streams", streams.len());

        if self.config.sync.auto_create_tables {
            self.ensure_schema().await?;
        }

        let workers = match self.config.sync.max_concurrent_streams {
            0 => streams.len().max(1),
            n => n,
        };

        let stream_results: BTreeMap<String, StreamSyncResult> =
            futures::stream::iter(streams.iter().copied())
                .map(|stream| self.sync_stream(stream, cancel))
                .buffer_unordered(workers)
                .map(|result| (result.workflow_key.clone(), result))
                .collect()
                .await;

        let streams_ok = stream_results.values().all(|s| s.success);
        let restricted = !options.streams.is_empty();

        let mut error = None;
        let mut transforms = Vec::new();
        let mut transforms_skipped = true;

        if cancel.is_cancelled() {
            warn!("Run cancelled, transforms skipped");
            error = Some(Error::Cancelled.to_string());
        } else if !streams_ok {
            warn!("Some streams failed, transforms skipped");
            error = Some("Some streams failed to sync".to_string());
        } else if options.skip_transforms || restricted {
            debug!("Transforms not requested for this run");
        } else {
            match self.run_transforms(cancel).await {
                Ok(results) => {
                    transforms_skipped = false;
                    if results.iter().any(|t| !t.success) {
                        error = Some("Some transforms failed".to_string());
                    }
                    transforms = results;
                }
                Err(e) => error = Some(e.to_string()),
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = RunResult {
            run_id,
            success: error.is_none(),
            streams: stream_results,
            transforms,
            transforms_skipped,
            duration_ms,
            completed_at: Utc::now().to_rfc3339(),
            error,
        };

        if result.success {
            info!(
                "Sync completed successfully in {}ms. Rows inserted: {}, Streams synced: {}",
                duration_ms,
                result.total_inserted(),
                result.streams.len()
            );
        } else {
            warn!(
                "Sync completed with errors in {}ms. Inserted: {}, Failed streams: {:?}",
                duration_ms,
                result.total_inserted(),
                result.failed_streams()
            );
        }

        Ok(result)
    }

    /// Run the transform stages on their own.
    pub async fn run_transforms(&self, cancel: &CancellationToken) -> Result<Vec<TransformResult>> {
        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            results = self.transforms.run(&self.config.transforms) => results,
        };
        for _ in results.iter().filter(|t| t.success) {
            self.metrics.record_script();
        }
        Ok(results)
    }

    /// Stored watermark of every enabled stream.
    ///
    /// Unlike the sync path, read errors are returned.
    pub async fn status(&self) -> Result<Vec<StreamStatus>> {
        let mut statuses = Vec::new();
        for stream in self.config.enabled_streams() {
            let lookup = self.store.last_batch_date(&stream.workflow_key);
            let last_batch_date =
                with_timeout("read watermark", self.config.sync.timeout(), lookup).await?;
            statuses.push(StreamStatus {
                source: stream.source.clone(),
                table: stream.table_name().to_string(),
                workflow_key: stream.workflow_key.clone(),
                last_batch_date,
            });
        }
        Ok(statuses)
    }

    /// Move the watermark of a configured stream to `to`, in either
    /// direction. The next run refetches everything newer than `to`.
    pub async fn rewind(&self, workflow_key: &str, to: DateTime<Utc>) -> Result<()> {
        if !self.config.streams.iter().any(|s| s.workflow_key == workflow_key) {
            return Err(Error::config(format!(
                "Unknown workflow key '{}'",
                workflow_key
            )));
        }
        self.watermarks.advance_watermark(workflow_key, to).await
    }

    /// Resolve names to streams, once each even when a stream is named by
    /// both its collection and its workflow key.
    fn select_streams(&self, names: &[String]) -> Result<Vec<&StreamDescriptor>> {
        if names.is_empty() {
            return Ok(self.config.enabled_streams().collect());
        }

        let mut selected: Vec<&StreamDescriptor> = Vec::with_capacity(names.len());
        for name in names {
            let stream = self
                .config
                .streams
                .iter()
                .find(|s| &s.source == name || &s.workflow_key == name)
                .ok_or_else(|| Error::config(format!("Unknown stream '{}'", name)))?;
            if !selected.iter().any(|s| s.workflow_key == stream.workflow_key) {
                selected.push(stream);
            }
        }
        Ok(selected)
    }

    /// Sync a single stream with retries.
    #[instrument(skip(self, stream, cancel), fields(stream = %stream.source))]
    async fn sync_stream(
        &self,
        stream: &StreamDescriptor,
        cancel: &CancellationToken,
    ) -> StreamSyncResult {
        let timer = Timer::start(format!("sync {}", stream.source));
        let retry = &self.config.retry;
        let mut backoff = create_backoff(retry);
        let mut attempts = 0u32;

        let outcome = loop {
            attempts += 1;
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.sync_stream_once(stream, attempts) => result,
            };

            match attempt {
                Ok(report) => break Ok(report),
                Err(e) if e.is_retryable() && attempts <= retry.max_retries => {
                    let delay = backoff.next_backoff().unwrap_or_else(|| retry.max_backoff());
                    warn!(
                        "Attempt {} for {} failed, retrying in {:?}: {}",
                        attempts, stream.source, delay, e
                    );
                    self.metrics.record_retry();
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_retryable() && attempts > 1 => {
                    break Err(Error::RetryExhausted {
                        attempts,
                        message: format!("{} could not be synced", stream.source),
                        last_error: Some(Box::new(e)),
                    });
                }
                Err(e) => break Err(e),
            }
        };

        let duration_ms = timer.stop();
        let mut result = StreamSyncResult {
            source: stream.source.clone(),
            table: stream.table_name().to_string(),
            workflow_key: stream.workflow_key.clone(),
            success: false,
            attempts,
            report: LoadReport::default(),
            duration_ms,
            error: None,
        };

        match outcome {
            Ok(report) => {
                self.metrics.record_stream(&stream.source, Some(&report), duration_ms);
                self.report_progress(stream, SyncPhase::Completed, attempts, Some(report.inserted));
                result.success = true;
                result.report = report;
            }
            Err(e) => {
                error!(code = e.code(), "Failed to sync {}: {}", stream.source, e);
                self.metrics.record_stream(&stream.source, None, duration_ms);
                self.report_progress(stream, SyncPhase::Failed, attempts, None);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// One watermark read, fetch and load pass over a stream.
    async fn sync_stream_once(&self, stream: &StreamDescriptor, attempt: u32) -> Result<LoadReport> {
        self.report_progress(stream, SyncPhase::ReadingWatermark, attempt, None);
        let watermark = self
            .watermarks
            .get_last_batch_date(&stream.workflow_key)
            .await;

        self.report_progress(stream, SyncPhase::Fetching, attempt, None);
        let extraction = self.extractor.fetch(stream, watermark).await;
        if let Some(e) = extraction.error {
            return Err(e);
        }

        self.report_progress(
            stream,
            SyncPhase::Loading,
            attempt,
            Some(extraction.documents.len()),
        );
        self.loader.load(&extraction.documents, stream).await
    }

    /// Report progress via callback.
    fn report_progress(
        &self,
        stream: &StreamDescriptor,
        phase: SyncPhase,
        attempt: u32,
        documents: Option<usize>,
    ) {
        if let Some(ref callback) = self.progress_callback {
            callback(SyncProgress {
                stream: stream.source.clone(),
                phase,
                attempt,
                documents,
            });
        }
    }
}

/// Create the retry backoff from config.
///
/// Attempts are bounded by `max_retries`, not by elapsed time.
pub fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    let randomization = if config.jitter { 0.5 } else { 0.0 };
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_max_interval(config.max_backoff())
        .with_multiplier(config.multiplier)
        .with_randomization_factor(randomization)
        .with_max_elapsed_time(None)
        .build()
}

//! Downstream transformation stages.
//!
//! Scripts are opaque SQL applied against the staging database after every
//! stream of a run has been staged. Each script runs as one transaction.

use crate::config::TransformScript;
use crate::error::{Error, Result, with_timeout};
use crate::store::StagingStore;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Outcome of one transformation script.
#[derive(Debug, Clone, Serialize)]
pub struct TransformResult {
    /// Script name
    pub name: String,
    /// Stage the script belongs to
    pub stage: u32,
    /// Whether the script was applied
    pub success: bool,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Error message if failed
    pub error: Option<String>,
}

/// Applies transformation scripts stage by stage.
#[derive(Clone)]
pub struct TransformRunner {
    store: Arc<dyn StagingStore>,
    timeout: Duration,
}

impl TransformRunner {
    /// Create a runner.
    pub fn new(store: Arc<dyn StagingStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Apply the enabled `scripts` in ascending stage order.
    ///
    /// Scripts sharing a stage run concurrently. When any script of a stage
    /// fails, later stages are not started.
    #[instrument(skip(self, scripts), fields(scripts = scripts.len()))]
    pub async fn run(&self, scripts: &[TransformScript]) -> Vec<TransformResult> {
        let mut stages: BTreeMap<u32, Vec<&TransformScript>> = BTreeMap::new();
        for script in scripts.iter().filter(|s| s.enabled) {
            stages.entry(script.stage).or_default().push(script);
        }

        let mut results = Vec::new();
        for (stage, scripts) in stages {
            info!("Running transform stage {} ({} scripts)", stage, scripts.len());
            let stage_results = join_all(scripts.into_iter().map(|s| self.apply(s))).await;
            let failed = stage_results.iter().any(|r| !r.success);
            results.extend(stage_results);

            if failed {
                warn!("Transform stage {} failed, later stages skipped", stage);
                break;
            }
        }
        results
    }

    async fn apply(&self, script: &TransformScript) -> TransformResult {
        let start = Instant::now();
        let outcome = self.apply_inner(script).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                info!("Applied {} in {}ms", script.name, duration_ms);
                TransformResult {
                    name: script.name.clone(),
                    stage: script.stage,
                    success: true,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                error!(code = e.code(), "Transform {} failed: {}", script.name, e);
                TransformResult {
                    name: script.name.clone(),
                    stage: script.stage,
                    success: false,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn apply_inner(&self, script: &TransformScript) -> Result<()> {
        let sql = tokio::fs::read_to_string(&script.script).await.map_err(|e| {
            Error::transform(
                &script.name,
                format!("cannot read {}: {}", script.script.display(), e),
            )
        })?;

        let operation = format!("transform {}", script.name);
        with_timeout(&operation, self.timeout, self.store.apply_script(&script.name, &sql)).await
    }
}

//! Batch orchestration over independent generation items.
//!
//! Items run either one at a time with a pacing pause between them, or with
//! at most K in flight. A failure or panic in one item is recorded and the
//! batch carries on. Each successful item gets a JSON artifact in the output
//! directory, and the run ends by writing `batch_summary.json` there.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ch_core::config::{BatchConfig, BatchMode};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use ch_telemetry::tracing_setup::{create_child_span, create_operation_span};

use crate::capability::GenerationError;
use crate::critique::CritiqueError;
use crate::pool::PoolError;
use crate::tournament::TournamentError;

pub const SUMMARY_FILE: &str = "batch_summary.json";

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A chapter's worth of scenes to generate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInput {
    pub chapter_id: String,
    pub scenes: Vec<BatchItem>,
}

impl BatchInput {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| BatchError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub outline: String,
    /// Reference documents the item depends on.
    #[serde(default)]
    pub required_context: Vec<String>,
    /// Ids of earlier items this one follows.
    #[serde(default)]
    pub previous_scenes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why one item failed. Recorded, never raised out of the batch.
#[derive(Debug, Error)]
pub enum BatchItemError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("critique failed: {0}")]
    Critique(#[from] CritiqueError),

    #[error("tournament failed: {0}")]
    Tournament(#[from] TournamentError),

    #[error("failed to write artifact: {0}")]
    Artifact(String),

    #[error("item panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Batch-level failures: the input could not be read or the summary could
/// not be written.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Processing contract
// ---------------------------------------------------------------------------

/// What a processor reports for one successful item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Written verbatim into the item's artifact.
    pub output: serde_json::Value,
    pub cost: f64,
    pub tokens: u64,
    /// Named quality scores averaged across the batch.
    #[serde(default)]
    pub quality_scores: BTreeMap<String, f64>,
}

#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, chapter_id: &str, item: &BatchItem)
        -> Result<ItemOutcome, BatchItemError>;
}

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential { pacing: Duration },
    Parallel { workers: usize },
}

impl From<&BatchConfig> for ExecutionMode {
    fn from(config: &BatchConfig) -> Self {
        match config.mode {
            BatchMode::Sequential => ExecutionMode::Sequential {
                pacing: config.pacing(),
            },
            BatchMode::Parallel => ExecutionMode::Parallel {
                workers: config.workers.max(1),
            },
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential { pacing } => {
                write!(f, "sequential (pacing {}ms)", pacing.as_millis())
            }
            ExecutionMode::Parallel { workers } => write!(f, "parallel ({workers} workers)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Position of the item in the input.
    pub index: usize,
    pub item_id: String,
    pub success: bool,
    pub cost: f64,
    pub tokens: u64,
    #[serde(default)]
    pub quality_scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub chapter_id: String,
    /// Trace id shared by the run's log spans and artifacts.
    pub trace_id: String,
    pub total_items: usize,
    pub processed: usize,
    pub failed: usize,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total: f64,
    /// Over processed items only.
    pub average_per_item: f64,
    /// Successful items in input order. Ids need not be unique.
    pub per_item: Vec<ItemCost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCost {
    pub index: usize,
    pub item_id: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualitySummary {
    pub averages: BTreeMap<String, f64>,
    pub scored_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub item_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRef {
    pub item_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub metadata: BatchMetadata,
    pub cost: CostSummary,
    pub quality: QualitySummary,
    pub failed_items: Vec<FailedItem>,
    pub outputs: Vec<OutputRef>,
    /// In completion order.
    pub results: Vec<BatchItemResult>,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        self.metadata.failed > 0
    }

    /// Process exit status: non-zero if any item failed.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    fn build(
        chapter_id: &str,
        trace_id: &str,
        total_items: usize,
        mode: ExecutionMode,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        results: Vec<BatchItemResult>,
    ) -> Self {
        let mut cost = CostSummary::default();
        let mut score_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut scored_items = 0;
        let mut failed_items = Vec::new();
        let mut outputs = Vec::new();

        for result in &results {
            if !result.success {
                failed_items.push(FailedItem {
                    item_id: result.item_id.clone(),
                    error: result.error.clone().unwrap_or_default(),
                });
                continue;
            }
            cost.total += result.cost;
            cost.per_item.push(ItemCost {
                index: result.index,
                item_id: result.item_id.clone(),
                cost: result.cost,
            });
            if let Some(path) = &result.output_path {
                outputs.push(OutputRef {
                    item_id: result.item_id.clone(),
                    path: path.clone(),
                });
            }
            if !result.quality_scores.is_empty() {
                scored_items += 1;
            }
            for (name, score) in &result.quality_scores {
                let entry = score_sums.entry(name.clone()).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
        }

        cost.per_item.sort_by_key(|c| c.index);
        let processed = results.len() - failed_items.len();
        if processed > 0 {
            cost.average_per_item = cost.total / processed as f64;
        }

        let averages = score_sums
            .into_iter()
            .map(|(name, (sum, n))| (name, sum / n as f64))
            .collect();

        Self {
            metadata: BatchMetadata {
                chapter_id: chapter_id.to_string(),
                trace_id: trace_id.to_string(),
                total_items,
                processed,
                failed: failed_items.len(),
                mode: mode.to_string(),
                started_at,
                completed_at: Utc::now(),
                elapsed_secs: elapsed.as_secs_f64(),
            },
            cost,
            quality: QualitySummary {
                averages,
                scored_items,
            },
            failed_items,
            outputs,
            results,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct BatchOrchestrator {
    processor: Arc<dyn ItemProcessor>,
    mode: ExecutionMode,
    output_dir: PathBuf,
}

/// Running totals, logged as items complete.
#[derive(Default)]
struct Progress {
    processed: usize,
    failed: usize,
    total_cost: f64,
}

impl BatchOrchestrator {
    pub fn new(
        processor: Arc<dyn ItemProcessor>,
        mode: ExecutionMode,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            processor,
            mode,
            output_dir: output_dir.into(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run every item, write artifacts and the summary, and return the
    /// summary. Item failures are recorded in the summary, not returned.
    pub async fn run(&self, input: &BatchInput) -> Result<BatchSummary, BatchError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| BatchError::Io {
                path: self.output_dir.clone(),
                source,
            })?;

        let (span, trace_id) = create_operation_span("batch");
        let started_at = Utc::now();
        let started = Instant::now();
        span.in_scope(|| {
            info!(
                chapter = %input.chapter_id,
                items = input.scenes.len(),
                mode = %self.mode,
                "batch started"
            );
        });

        let results = match self.mode {
            ExecutionMode::Sequential { pacing } => {
                self.run_sequential(input, pacing, &trace_id)
                    .instrument(span.clone())
                    .await
            }
            ExecutionMode::Parallel { workers } => {
                self.run_parallel(input, workers, &trace_id)
                    .instrument(span.clone())
                    .await
            }
        };

        let summary = BatchSummary::build(
            &input.chapter_id,
            &trace_id,
            input.scenes.len(),
            self.mode,
            started_at,
            started.elapsed(),
            results,
        );
        self.write_summary(&summary).await?;

        span.in_scope(|| {
            info!(
                processed = summary.metadata.processed,
                failed = summary.metadata.failed,
                total_cost = summary.cost.total,
                elapsed_secs = summary.metadata.elapsed_secs,
                "batch complete"
            );
        });
        Ok(summary)
    }

    async fn run_sequential(
        &self,
        input: &BatchInput,
        pacing: Duration,
        trace_id: &str,
    ) -> Vec<BatchItemResult> {
        let mut progress = Progress::default();
        let mut results = Vec::with_capacity(input.scenes.len());
        let last = input.scenes.len().saturating_sub(1);

        for (idx, item) in input.scenes.iter().enumerate() {
            let outcome = process_isolated(
                Arc::clone(&self.processor),
                input.chapter_id.clone(),
                item.clone(),
            )
            .instrument(create_child_span(trace_id, &item.id))
            .await;
            results.push(
                self.finish_item(input, idx, trace_id, outcome, &mut progress)
                    .await,
            );

            if idx < last {
                tokio::time::sleep(pacing).await;
            }
        }
        results
    }

    async fn run_parallel(
        &self,
        input: &BatchInput,
        workers: usize,
        trace_id: &str,
    ) -> Vec<BatchItemResult> {
        let workers = workers.max(1);
        let mut progress = Progress::default();
        let mut results = Vec::with_capacity(input.scenes.len());
        let mut queue = input.scenes.iter().enumerate();
        let mut in_flight: JoinSet<(usize, Result<ItemOutcome, BatchItemError>)> = JoinSet::new();
        let mut outstanding: HashSet<usize> = HashSet::new();

        loop {
            while in_flight.len() < workers {
                let Some((idx, item)) = queue.next() else { break };
                outstanding.insert(idx);
                let processor = Arc::clone(&self.processor);
                let chapter_id = input.chapter_id.clone();
                let item = item.clone();
                let child = create_child_span(trace_id, &item.id);
                in_flight.spawn(
                    async move { (idx, process_isolated(processor, chapter_id, item).await) }
                        .instrument(child),
                );
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((idx, outcome)) => {
                    outstanding.remove(&idx);
                    results.push(
                        self.finish_item(input, idx, trace_id, outcome, &mut progress)
                            .await,
                    );
                }
                Err(err) => {
                    // Panics are caught inside the task, so this is a
                    // cancelled task; its item is recorded after the loop.
                    error!(error = %err, "batch worker task did not complete");
                }
            }
        }

        let mut lost: Vec<usize> = outstanding.into_iter().collect();
        lost.sort_unstable();
        for idx in lost {
            let outcome = Err(BatchItemError::Other("worker task was cancelled".into()));
            results.push(
                self.finish_item(input, idx, trace_id, outcome, &mut progress)
                    .await,
            );
        }
        results
    }

    /// Write the artifact for a successful item and update running totals.
    async fn finish_item(
        &self,
        input: &BatchInput,
        index: usize,
        trace_id: &str,
        outcome: Result<ItemOutcome, BatchItemError>,
        progress: &mut Progress,
    ) -> BatchItemResult {
        let item = &input.scenes[index];
        let outcome = match outcome {
            Ok(outcome) => self
                .write_artifact(&input.chapter_id, trace_id, index, item, &outcome)
                .await
                .map(|path| (outcome, path)),
            Err(err) => Err(err),
        };

        match outcome {
            Ok((outcome, path)) => {
                progress.processed += 1;
                progress.total_cost += outcome.cost;
                info!(
                    item = %item.id,
                    processed = progress.processed,
                    failed = progress.failed,
                    cost = outcome.cost,
                    total_cost = progress.total_cost,
                    "item complete"
                );
                BatchItemResult {
                    index,
                    item_id: item.id.clone(),
                    success: true,
                    cost: outcome.cost,
                    tokens: outcome.tokens,
                    quality_scores: outcome.quality_scores,
                    output_path: Some(path.display().to_string()),
                    error: None,
                }
            }
            Err(err) => {
                progress.failed += 1;
                warn!(
                    item = %item.id,
                    processed = progress.processed,
                    failed = progress.failed,
                    error = %err,
                    "item failed"
                );
                BatchItemResult {
                    index,
                    item_id: item.id.clone(),
                    success: false,
                    cost: 0.0,
                    tokens: 0,
                    quality_scores: BTreeMap::new(),
                    output_path: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Artifact file for the item at `index`. The input position prefix
    /// keeps names unique when ids repeat or sanitize to the same stem.
    pub fn artifact_path(&self, index: usize, item_id: &str) -> PathBuf {
        self.output_dir
            .join(format!("{index:03}-{}.json", sanitize_file_stem(item_id)))
    }

    async fn write_artifact(
        &self,
        chapter_id: &str,
        trace_id: &str,
        index: usize,
        item: &BatchItem,
        outcome: &ItemOutcome,
    ) -> Result<PathBuf, BatchItemError> {
        let path = self.artifact_path(index, &item.id);
        let artifact = serde_json::json!({
            "chapter_id": chapter_id,
            "trace_id": trace_id,
            "item_id": item.id,
            "title": item.title,
            "output": outcome.output,
            "cost": outcome.cost,
            "tokens": outcome.tokens,
            "quality_scores": outcome.quality_scores,
            "completed_at": Utc::now(),
        });
        let text = serde_json::to_string_pretty(&artifact)
            .map_err(|e| BatchItemError::Artifact(e.to_string()))?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| BatchItemError::Artifact(format!("{}: {e}", path.display())))?;
        Ok(path)
    }

    async fn write_summary(&self, summary: &BatchSummary) -> Result<(), BatchError> {
        let path = self.output_dir.join(SUMMARY_FILE);
        let text = serde_json::to_string_pretty(summary)?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|source| BatchError::Io { path, source })
    }
}

/// Run one item, turning a panic into an item error.
async fn process_isolated(
    processor: Arc<dyn ItemProcessor>,
    chapter_id: String,
    item: BatchItem,
) -> Result<ItemOutcome, BatchItemError> {
    match AssertUnwindSafe(processor.process(&chapter_id, &item))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(BatchItemError::Panicked(message))
        }
    }
}

/// File-system-safe stem for an item id.
pub fn sanitize_file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "item".into()
    } else {
        stem
    }
}

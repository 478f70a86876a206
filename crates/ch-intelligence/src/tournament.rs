//! Batch adapter over an external tournament runner.
//!
//! The runner's scoring rubric is its own business; this module only relies
//! on the summary block every run returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{BatchItem, BatchItemError, ItemOutcome, ItemProcessor};

#[derive(Debug, Error)]
pub enum TournamentError {
    #[error("tournament run failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentSummary {
    /// Backend (or variant) that won.
    pub highest_scoring: String,
    pub highest_score: f64,
    #[serde(default)]
    pub hybrid_score: Option<f64>,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// A tournament result: the summary plus whatever else the runner reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentOutcome {
    pub summary: TournamentSummary,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait TournamentRunner: Send + Sync {
    async fn run_tournament(
        &self,
        chapter_id: &str,
        item: &BatchItem,
    ) -> Result<TournamentOutcome, TournamentError>;
}

pub struct TournamentProcessor {
    runner: Arc<dyn TournamentRunner>,
}

impl TournamentProcessor {
    pub fn new(runner: Arc<dyn TournamentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ItemProcessor for TournamentProcessor {
    async fn process(
        &self,
        chapter_id: &str,
        item: &BatchItem,
    ) -> Result<ItemOutcome, BatchItemError> {
        let outcome = self.runner.run_tournament(chapter_id, item).await?;

        let mut quality_scores = BTreeMap::new();
        quality_scores.insert("highest_score".to_string(), outcome.summary.highest_score);
        if let Some(hybrid) = outcome.summary.hybrid_score {
            quality_scores.insert("hybrid_score".to_string(), hybrid);
        }

        Ok(ItemOutcome {
            cost: outcome.summary.total_cost,
            tokens: outcome.summary.total_tokens,
            output: serde_json::to_value(&outcome)
                .map_err(|e| BatchItemError::Artifact(e.to_string()))?,
            quality_scores,
        })
    }
}

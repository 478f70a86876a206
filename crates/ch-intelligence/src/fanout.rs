//! Batch items generated by fanning out to the backend pool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::batch::{BatchItem, BatchItemError, ItemOutcome, ItemProcessor};
use crate::capability::GenerationParams;
use crate::critique::{CritiqueService, Variant};
use crate::pool::{BackendPool, Targets};

/// Generates each item on every target backend and, when a critique service
/// is attached, critiques the resulting variants.
pub struct FanOutProcessor {
    pool: Arc<BackendPool>,
    targets: Targets,
    params: GenerationParams,
    critique: Option<Arc<CritiqueService>>,
}

impl FanOutProcessor {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool,
            targets: Targets::AllEnabled,
            params: GenerationParams::default(),
            critique: None,
        }
    }

    pub fn with_targets(mut self, targets: Targets) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_critique(mut self, critique: Arc<CritiqueService>) -> Self {
        self.critique = Some(critique);
        self
    }
}

pub fn build_item_prompt(chapter_id: &str, item: &BatchItem) -> String {
    let mut prompt = format!("Write scene {} of chapter {}.", item.id, chapter_id);
    if !item.title.is_empty() {
        prompt.push_str(&format!("\n\nTitle: {}", item.title));
    }
    prompt.push_str(&format!("\n\nOutline:\n{}", item.outline));
    if !item.required_context.is_empty() {
        prompt.push_str("\n\nDraw on these reference documents:\n");
        for reference in &item.required_context {
            prompt.push_str(&format!("- {reference}\n"));
        }
    }
    if !item.previous_scenes.is_empty() {
        prompt.push_str(&format!(
            "\n\nThis scene follows: {}.",
            item.previous_scenes.join(", ")
        ));
    }
    prompt
}

#[async_trait]
impl ItemProcessor for FanOutProcessor {
    async fn process(
        &self,
        chapter_id: &str,
        item: &BatchItem,
    ) -> Result<ItemOutcome, BatchItemError> {
        let prompt = build_item_prompt(chapter_id, item);
        let result = self
            .pool
            .execute_parallel(&prompt, &self.targets, &self.params)
            .await?;

        if result.success_count() == 0 {
            let errors: Vec<String> = result
                .responses
                .iter()
                .map(|r| format!("{}: {}", r.backend, r.error.as_deref().unwrap_or("no output")))
                .collect();
            return Err(BatchItemError::Other(format!(
                "no backend produced output ({})",
                errors.join("; ")
            )));
        }

        let mut cost = result.total_cost;
        let mut tokens = result.total_tokens;

        let critique = match &self.critique {
            Some(service) => {
                let variants = Variant::from_parallel(&result);
                let report = service.critique(&prompt, &variants).await?;
                cost += report.total_cost;
                tokens += report.total_tokens();
                Some(report)
            }
            None => None,
        };

        let variants: Vec<_> = result
            .successful()
            .map(|r| {
                json!({
                    "backend": r.backend,
                    "model": r.model,
                    "content": r.content,
                    "cost": r.cost,
                    "tokens": r.total_tokens(),
                })
            })
            .collect();
        let failures: Vec<_> = result
            .responses
            .iter()
            .filter(|r| !r.success())
            .map(|r| json!({ "backend": r.backend, "error": r.error }))
            .collect();

        Ok(ItemOutcome {
            output: json!({
                "session_id": result.session_id,
                "prompt": prompt,
                "variants": variants,
                "failures": failures,
                "critique": critique,
            }),
            cost,
            tokens,
            quality_scores: Default::default(),
        })
    }
}

//! Comparative critique of generated variants.
//!
//! Each variant is critiqued independently against a fixed rubric by one
//! designated critic backend, then a single comparative call ranks the
//! critiqued variants against each other.

use std::sync::Arc;

use ch_core::config::CritiqueConfig;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::capability::GenerationParams;
use crate::pool::{BackendPool, ParallelResult, PoolError};

#[derive(Debug, Error)]
pub enum CritiqueError {
    #[error("no variants to critique")]
    NoVariants,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// One candidate output and the backend that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub backend: String,
    pub content: String,
}

impl Variant {
    pub fn new(backend: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            content: content.into(),
        }
    }

    /// Successful responses of a fan-out, in request order.
    pub fn from_parallel(result: &ParallelResult) -> Vec<Variant> {
        result
            .successful()
            .map(|r| Variant::new(&r.backend, &r.content))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantCritique {
    pub backend: String,
    pub critique: String,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueFailure {
    pub backend: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComparativeAnalysis {
    Completed {
        content: String,
        cost: f64,
        tokens: u64,
    },
    Failed {
        error: String,
    },
}

impl ComparativeAnalysis {
    pub fn cost(&self) -> f64 {
        match self {
            ComparativeAnalysis::Completed { cost, .. } => *cost,
            ComparativeAnalysis::Failed { .. } => 0.0,
        }
    }

    pub fn tokens(&self) -> u64 {
        match self {
            ComparativeAnalysis::Completed { tokens, .. } => *tokens,
            ComparativeAnalysis::Failed { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub critic: String,
    pub rubric: Vec<String>,
    pub critiques: Vec<VariantCritique>,
    pub failures: Vec<CritiqueFailure>,
    pub comparative: ComparativeAnalysis,
    /// Individual critiques plus the comparative call.
    pub total_cost: f64,
}

impl CritiqueReport {
    pub fn total_tokens(&self) -> u64 {
        self.critiques.iter().map(|c| c.tokens).sum::<u64>() + self.comparative.tokens()
    }
}

pub struct CritiqueService {
    pool: Arc<BackendPool>,
    critic: String,
    rubric: Vec<String>,
    params: GenerationParams,
}

impl CritiqueService {
    pub fn new(pool: Arc<BackendPool>, critic: impl Into<String>, rubric: Vec<String>) -> Self {
        Self {
            pool,
            critic: critic.into(),
            rubric,
            params: GenerationParams::default().with_temperature(0.3),
        }
    }

    /// `None` when no critic backend is configured.
    pub fn from_config(pool: Arc<BackendPool>, config: &CritiqueConfig) -> Option<Self> {
        let critic = config.critic.as_deref()?;
        Some(
            Self::new(pool, critic, config.rubric.clone()).with_params(
                GenerationParams::default()
                    .with_temperature(config.temperature)
                    .with_max_tokens(config.max_tokens),
            ),
        )
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn critic(&self) -> &str {
        &self.critic
    }

    pub fn rubric(&self) -> &[String] {
        &self.rubric
    }

    /// Critique every variant, then compare the ones that were critiqued.
    ///
    /// Individual or comparative call failures are recorded in the report;
    /// only a critic that is unusable when the critiques start is an error.
    pub async fn critique(
        &self,
        task: &str,
        variants: &[Variant],
    ) -> Result<CritiqueReport, CritiqueError> {
        if variants.is_empty() {
            return Err(CritiqueError::NoVariants);
        }

        let calls = variants.iter().map(|variant| async move {
            let prompt = build_critique_prompt(task, variant, &self.rubric);
            let response = self
                .pool
                .execute_single(&self.critic, &prompt, &self.params)
                .await?;
            Ok::<_, PoolError>((variant, response))
        });

        let mut critiques = Vec::new();
        let mut failures = Vec::new();
        let mut critiqued = Vec::new();
        for outcome in join_all(calls).await {
            let (variant, response) = outcome?;
            match response.error {
                None => {
                    critiques.push(VariantCritique {
                        backend: variant.backend.clone(),
                        tokens: response.input_tokens + response.output_tokens,
                        critique: response.content,
                        cost: response.cost,
                    });
                    critiqued.push(variant);
                }
                Some(error) => {
                    warn!(variant = %variant.backend, error = %error, "variant critique failed");
                    failures.push(CritiqueFailure {
                        backend: variant.backend.clone(),
                        error,
                    });
                }
            }
        }

        let comparative = if critiqued.is_empty() {
            ComparativeAnalysis::Failed {
                error: "no variant critiques succeeded".into(),
            }
        } else {
            let prompt = build_comparative_prompt(task, &critiqued, &critiques, &self.rubric);
            // A critic that became unusable fails only the comparison.
            match self
                .pool
                .execute_single(&self.critic, &prompt, &self.params)
                .await
            {
                Ok(response) => match response.error {
                    None => ComparativeAnalysis::Completed {
                        tokens: response.input_tokens + response.output_tokens,
                        content: response.content,
                        cost: response.cost,
                    },
                    Some(error) => {
                        warn!(error = %error, "comparative analysis failed");
                        ComparativeAnalysis::Failed { error }
                    }
                },
                Err(pool_err) => {
                    warn!(error = %pool_err, "critic unavailable for comparative analysis");
                    ComparativeAnalysis::Failed {
                        error: pool_err.to_string(),
                    }
                }
            }
        };

        let total_cost = critiques.iter().map(|c| c.cost).sum::<f64>() + comparative.cost();
        info!(
            critic = %self.critic,
            critiqued = critiques.len(),
            failed = failures.len(),
            total_cost,
            "critique complete"
        );

        Ok(CritiqueReport {
            critic: self.critic.clone(),
            rubric: self.rubric.clone(),
            critiques,
            failures,
            comparative,
            total_cost,
        })
    }
}

fn rubric_lines(rubric: &[String]) -> String {
    rubric
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_critique_prompt(task: &str, variant: &Variant, rubric: &[String]) -> String {
    format!(
        "You are reviewing one draft written for the task below.\n\n\
         ## Task\n{task}\n\n\
         ## Draft (from {backend})\n{content}\n\n\
         ## Criteria\n{criteria}\n\n\
         For each criterion give a score from 1 to 10 and a short justification, \
         then list the draft's main strengths and weaknesses.",
        backend = variant.backend,
        content = variant.content,
        criteria = rubric_lines(rubric),
    )
}

pub fn build_comparative_prompt(
    task: &str,
    variants: &[&Variant],
    critiques: &[VariantCritique],
    rubric: &[String],
) -> String {
    let mut sections = String::new();
    for (i, (variant, critique)) in variants.iter().zip(critiques).enumerate() {
        sections.push_str(&format!(
            "### Variant {n} ({backend})\n{content}\n\n#### Critique\n{critique}\n\n",
            n = i + 1,
            backend = variant.backend,
            content = variant.content,
            critique = critique.critique,
        ));
    }
    format!(
        "Compare the following drafts written for the same task.\n\n\
         ## Task\n{task}\n\n\
         {sections}\
         ## Criteria\n{criteria}\n\n\
         Provide:\n\
         1. An overall ranking of the variants.\n\
         2. The leading variant for each criterion.\n\
         3. The unique strengths of each variant.\n\
         4. A recommendation for synthesising the best final version.",
        criteria = rubric_lines(rubric),
    )
}

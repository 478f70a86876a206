//! Registry of named generation backends with fan-out execution.
//!
//! The pool owns every registered [`Backend`] and one [`AgentStats`] record
//! per backend. Backend failures during execution are captured into
//! [`AgentResponse`] values; only "nothing could run" conditions (unknown
//! backend, disabled backend, no eligible targets) are returned as errors.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use ch_core::config::ConfigValidationError;
use ch_telemetry::tracing_setup::{create_child_span, create_operation_span};

use crate::capability::{Backend, GenerationCapability, GenerationParams, GenerationResult};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("backend '{0}' is disabled")]
    BackendDisabled(String),

    #[error("no enabled backends to run")]
    NoEnabledBackends,

    #[error("backend '{0}' is already registered")]
    DuplicateBackend(String),

    #[error("invalid backend configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Outcome of one backend call as seen by pool callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub backend: String,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub model: String,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn from_result(backend: impl Into<String>, result: GenerationResult) -> Self {
        Self {
            backend: backend.into(),
            content: result.content,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            cost: result.cost,
            model: result.model,
            response_time_ms: result.response_time_ms,
            timestamp: result.timestamp,
            metadata: result.metadata,
            error: None,
        }
    }

    /// A failed call: no content, zero usage and cost.
    pub fn failure(
        backend: impl Into<String>,
        model: impl Into<String>,
        error: impl Into<String>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            backend: backend.into(),
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            model: model.into(),
            response_time_ms,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
            error: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// All responses of one fan-out, in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelResult {
    pub session_id: Uuid,
    pub prompt: String,
    pub responses: Vec<AgentResponse>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Sum over successful responses only.
    pub total_cost: f64,
    /// Sum over successful responses only.
    pub total_tokens: u64,
}

impl ParallelResult {
    pub fn assemble(
        prompt: impl Into<String>,
        responses: Vec<AgentResponse>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let (total_cost, total_tokens) = responses
            .iter()
            .filter(|r| r.success())
            .fold((0.0, 0u64), |(cost, tokens), r| {
                (cost + r.cost, tokens + r.total_tokens())
            });
        Self {
            session_id: Uuid::new_v4(),
            prompt: prompt.into(),
            responses,
            started_at,
            completed_at,
            total_cost,
            total_tokens,
        }
    }

    pub fn successful(&self) -> impl Iterator<Item = &AgentResponse> {
        self.responses.iter().filter(|r| r.success())
    }

    pub fn success_count(&self) -> usize {
        self.successful().count()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-backend execution statistics covering successes and failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub total_response_time_ms: u64,
}

impl AgentStats {
    /// Count one response. Bumps `total` and exactly one outcome counter.
    pub fn record(&mut self, response: &AgentResponse) {
        self.total_requests += 1;
        self.total_response_time_ms += response.response_time_ms;
        if response.success() {
            self.successful_requests += 1;
            self.total_input_tokens += response.input_tokens;
            self.total_output_tokens += response.output_tokens;
            self.total_cost += response.cost;
        } else {
            self.failed_requests += 1;
        }
    }

    pub fn merge(&mut self, other: &AgentStats) {
        self.total_requests += other.total_requests;
        self.successful_requests += other.successful_requests;
        self.failed_requests += other.failed_requests;
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
        self.total_cost += other.total_cost;
        self.total_response_time_ms += other.total_response_time_ms;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Mean cost of a successful request.
    pub fn average_cost(&self) -> f64 {
        if self.successful_requests == 0 {
            0.0
        } else {
            self.total_cost / self.successful_requests as f64
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.total_requests as f64
        }
    }
}

/// Snapshot of every backend's stats plus their sum.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub backends: BTreeMap<String, AgentStats>,
    pub aggregate: AgentStats,
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Which backends a fan-out should hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Targets {
    /// Every enabled backend, alphabetically.
    #[default]
    AllEnabled,
    /// The named backends that are also enabled, in the given order.
    Named(Vec<String>),
}

impl Targets {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Targets::Named(names.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// BackendPool
// ---------------------------------------------------------------------------

struct PoolEntry {
    backend: Arc<Backend>,
    enabled: bool,
}

/// Shared registry of generation backends. Construct once and pass around as
/// `Arc<BackendPool>`.
#[derive(Default)]
pub struct BackendPool {
    entries: RwLock<BTreeMap<String, PoolEntry>>,
    stats: Mutex<BTreeMap<String, AgentStats>>,
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool").finish_non_exhaustive()
    }
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its configured name. Validation and the
    /// duplicate check both happen before anything is inserted.
    pub async fn register(&self, adapter: Arc<dyn GenerationCapability>) -> Result<(), PoolError> {
        let backend = Backend::new(adapter)?;
        let name = backend.name().to_string();
        let enabled = backend.config().enabled;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&name) {
            return Err(PoolError::DuplicateBackend(name));
        }
        self.stats
            .lock()
            .await
            .insert(name.clone(), AgentStats::default());
        entries.insert(
            name.clone(),
            PoolEntry {
                backend: Arc::new(backend),
                enabled,
            },
        );
        info!(backend = %name, enabled, "backend registered");
        Ok(())
    }

    /// Remove a backend and discard its stats.
    pub async fn unregister(&self, name: &str) -> Result<(), PoolError> {
        let mut entries = self.entries.write().await;
        if entries.remove(name).is_none() {
            return Err(PoolError::UnknownBackend(name.to_string()));
        }
        self.stats.lock().await.remove(name);
        info!(backend = %name, "backend unregistered");
        Ok(())
    }

    pub async fn enable(&self, name: &str) -> Result<(), PoolError> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> Result<(), PoolError> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), PoolError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))?;
        entry.enabled = enabled;
        info!(backend = %name, enabled, "backend eligibility changed");
        Ok(())
    }

    pub async fn is_enabled(&self, name: &str) -> Result<bool, PoolError> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|e| e.enabled)
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))
    }

    /// Backend names in alphabetical order.
    pub async fn list_backends(&self, enabled_only: bool) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| !enabled_only || e.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn backend(&self, name: &str) -> Result<Arc<Backend>, PoolError> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|e| Arc::clone(&e.backend))
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))
    }

    async fn runnable(&self, name: &str) -> Result<Arc<Backend>, PoolError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))?;
        if !entry.enabled {
            return Err(PoolError::BackendDisabled(name.to_string()));
        }
        Ok(Arc::clone(&entry.backend))
    }

    /// Run one backend. Generation failures come back as a response with
    /// `error` set; only unknown or disabled backends are errors.
    pub async fn execute_single(
        &self,
        name: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<AgentResponse, PoolError> {
        let backend = self.runnable(name).await?;
        Ok(self.run_backend(&backend, prompt, params).await)
    }

    async fn run_backend(
        &self,
        backend: &Backend,
        prompt: &str,
        params: &GenerationParams,
    ) -> AgentResponse {
        let started = Instant::now();
        let response = match backend.generate_with_retry(prompt, params).await {
            Ok(result) => AgentResponse::from_result(backend.name(), result),
            Err(err) => {
                warn!(backend = %backend.name(), error = %err, "backend call failed");
                AgentResponse::failure(
                    backend.name(),
                    &backend.config().model,
                    err.to_string(),
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        // A backend unregistered mid-call has no stats entry to update.
        if let Some(stats) = self.stats.lock().await.get_mut(backend.name()) {
            stats.record(&response);
        }
        response
    }

    async fn resolve_targets(&self, targets: &Targets) -> Vec<Arc<Backend>> {
        let entries = self.entries.read().await;
        match targets {
            Targets::AllEnabled => entries
                .values()
                .filter(|e| e.enabled)
                .map(|e| Arc::clone(&e.backend))
                .collect(),
            Targets::Named(names) => {
                let mut seen = HashSet::new();
                names
                    .iter()
                    .filter(|name| seen.insert(name.as_str()))
                    .filter_map(|name| entries.get(name))
                    .filter(|e| e.enabled)
                    .map(|e| Arc::clone(&e.backend))
                    .collect()
            }
        }
    }

    /// Fan one prompt out to every target concurrently and wait for all.
    pub async fn execute_parallel(
        &self,
        prompt: &str,
        targets: &Targets,
        params: &GenerationParams,
    ) -> Result<ParallelResult, PoolError> {
        let backends = self.resolve_targets(targets).await;
        if backends.is_empty() {
            return Err(PoolError::NoEnabledBackends);
        }

        let (span, trace_id) = create_operation_span("execute_parallel");
        let started_at = Utc::now();
        let started = Instant::now();

        let calls = backends.iter().map(|backend| {
            let child = create_child_span(&trace_id, backend.name());
            self.run_backend(backend, prompt, params).instrument(child)
        });
        let responses = join_all(calls).instrument(span.clone()).await;

        let result = ParallelResult::assemble(prompt, responses, started_at, Utc::now());
        span.in_scope(|| {
            info!(
                successful = result.success_count(),
                total = result.responses.len(),
                total_cost = result.total_cost,
                duration_ms = started.elapsed().as_millis() as u64,
                "parallel execution complete"
            );
        });
        Ok(result)
    }

    pub async fn stats(&self, name: &str) -> Result<AgentStats, PoolError> {
        self.stats
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))
    }

    pub async fn all_stats(&self) -> PoolStats {
        let stats = self.stats.lock().await;
        let mut aggregate = AgentStats::default();
        for s in stats.values() {
            aggregate.merge(s);
        }
        PoolStats {
            backends: stats.clone(),
            aggregate,
        }
    }

    pub async fn reset_stats(&self, name: &str) -> Result<(), PoolError> {
        let mut stats = self.stats.lock().await;
        let entry = stats
            .get_mut(name)
            .ok_or_else(|| PoolError::UnknownBackend(name.to_string()))?;
        *entry = AgentStats::default();
        Ok(())
    }

    pub async fn reset_all_stats(&self) {
        for s in self.stats.lock().await.values_mut() {
            *s = AgentStats::default();
        }
    }
}

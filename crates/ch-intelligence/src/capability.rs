//! The generation capability contract.
//!
//! Every backend adapter (cloud model, local model, test double) implements
//! [`GenerationCapability`]. The pool never talks to an adapter directly: it
//! wraps each one in a [`Backend`], which validates the adapter's
//! configuration up front, applies the configured timeout, retries with
//! exponential backoff and keeps success-only usage totals.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ch_core::config::{BackendConfig, ConfigValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Characters per token used when a provider reports no usage.
pub const CHARS_PER_TOKEN: usize = 4;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors a single generation call can fail with.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request exceeded the backend's configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The configured credential env var is unset.
    #[error("backend '{backend}': credential env var {var} is not set")]
    MissingCredentials { backend: String, var: String },

    /// Any other adapter-specific failure.
    #[error("backend failure: {0}")]
    Backend(String),

    /// Every attempt of the retrying wrapper failed.
    #[error("backend '{backend}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        backend: String,
        attempts: u32,
        #[source]
        last: Box<GenerationError>,
    },
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::Timeout
        } else {
            GenerationError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Per-call generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    /// Output cap; `None` means the backend's configured maximum.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Provider-specific extras. `system` is honoured by all HTTP adapters.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl GenerationParams {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The output cap to send, never above the backend's `max_output_tokens`.
    pub fn effective_max_tokens(&self, config: &BackendConfig) -> u32 {
        self.max_tokens
            .unwrap_or(config.max_output_tokens)
            .min(config.max_output_tokens)
    }

    /// Optional system prompt carried in `extra["system"]`.
    pub fn system_prompt(&self) -> Option<&str> {
        self.extra.get("system").and_then(|v| v.as_str())
    }
}

/// Output of one successful generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in USD.
    pub cost: f64,
    /// Model version reported by the provider.
    pub model: String,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl GenerationResult {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Estimate a token count at [`CHARS_PER_TOKEN`] characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

// ---------------------------------------------------------------------------
// GenerationCapability trait
// ---------------------------------------------------------------------------

/// The one operation every backend adapter provides.
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    /// Static configuration of this backend.
    fn config(&self) -> &BackendConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Generate output for `prompt`. A single attempt; no retries.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError>;
}

// ---------------------------------------------------------------------------
// Usage totals
// ---------------------------------------------------------------------------

/// Cumulative usage of one backend across successful requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl UsageTotals {
    pub fn record(&mut self, result: &GenerationResult) {
        self.requests += 1;
        self.input_tokens += result.input_tokens;
        self.output_tokens += result.output_tokens;
        self.cost += result.cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// A validated adapter plus its usage totals.
pub struct Backend {
    adapter: Arc<dyn GenerationCapability>,
    usage: Mutex<UsageTotals>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("model", &self.config().model)
            .finish()
    }
}

impl Backend {
    /// Wrap an adapter, rejecting it if its configuration is invalid.
    pub fn new(adapter: Arc<dyn GenerationCapability>) -> Result<Self, ConfigValidationError> {
        adapter.config().validate()?;
        Ok(Self {
            adapter,
            usage: Mutex::new(UsageTotals::default()),
        })
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn config(&self) -> &BackendConfig {
        self.adapter.config()
    }

    /// Snapshot of usage across successful calls.
    pub fn usage(&self) -> UsageTotals {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One attempt, bounded by the backend's configured timeout.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let timeout = self.config().timeout();
        let result = match tokio::time::timeout(timeout, self.adapter.generate(prompt, params)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(GenerationError::Timeout),
        };
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&result);
        debug!(
            backend = %self.name(),
            tokens = result.total_tokens(),
            cost = result.cost,
            "generation succeeded"
        );
        Ok(result)
    }

    /// Up to `retry_attempts` attempts; after failed attempt `i` (zero-based)
    /// waits `retry_delay * 2^i` unless it was the last one.
    pub async fn generate_with_retry(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let attempts = self.config().retry_attempts.max(1);
        let base_delay = self.config().retry_delay();
        let mut attempt = 0u32;
        loop {
            match self.generate(prompt, params).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    attempt += 1;
                    warn!(
                        backend = %self.name(),
                        attempt,
                        attempts,
                        error = %err,
                        "generation attempt failed"
                    );
                    if attempt >= attempts {
                        return Err(GenerationError::RetryExhausted {
                            backend: self.name().to_string(),
                            attempts,
                            last: Box::new(err),
                        });
                    }
                    tokio::time::sleep(backoff_delay(base_delay, attempt - 1)).await;
                }
            }
        }
    }
}

/// `base * 2^attempt`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

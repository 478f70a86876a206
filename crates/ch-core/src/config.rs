use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.chorus/config.toml`.
///
/// **Security**: This struct NEVER stores API keys or tokens. Backends and
/// the analytical knowledge source only carry the *name* of the environment
/// variable holding their secret. See [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub critique: CritiqueConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub cache: QueryCacheConfig,
}

impl Config {
    /// Load config from `~/.chorus/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        tracing::debug!(path = %path.display(), backends = cfg.backends.len(), "config loaded");
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::BTreeSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "backends contains duplicate name '{}'",
                    backend.name
                )));
            }
        }
        self.batch.validate()?;
        self.cache.validate()?;
        if let Some(critic) = &self.critique.critic {
            if !self.backends.is_empty() && !names.contains(critic.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "critique.critic '{}' is not a configured backend",
                    critic
                )));
            }
        }
        if self.knowledge.analytical_enabled && self.knowledge.analytical_endpoint.is_none() {
            return Err(ConfigError::Validation(
                "knowledge.analytical_enabled requires knowledge.analytical_endpoint".to_string(),
            ));
        }
        Ok(())
    }

    /// Look up a configured backend by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    fn default_path() -> PathBuf {
        chorus_home().join("config.toml")
    }
}

/// `~/.chorus`, or `./.chorus` when no home directory is known.
pub fn chorus_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chorus")
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("backend: {0}")]
    Backend(#[from] ConfigValidationError),
}

/// A backend configuration that violates one of its invariants.
///
/// Raised eagerly when a backend is constructed or registered, never at
/// first use.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("backend name must not be empty")]
    EmptyName,
    #[error("backend '{backend}': model must not be empty")]
    EmptyModel { backend: String },
    #[error("backend '{backend}': {field} must be positive")]
    NonPositive { backend: String, field: &'static str },
    #[error("backend '{backend}': max_output_tokens ({max_output}) exceeds context_window ({context_window})")]
    OutputExceedsContext {
        backend: String,
        max_output: u32,
        context_window: u32,
    },
    #[error("backend '{backend}': {field} must not be negative")]
    NegativeCost { backend: String, field: &'static str },
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_project_name() -> String {
    "chorus".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Which adapter implementation a configured backend is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    /// OpenAI-compatible local inference server (vllm, llama.cpp, Ollama).
    Local,
    /// Adapter supplied in code rather than built from config.
    #[default]
    Custom,
}

/// Static description of one generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub provider: ProviderKind,
    pub model: String,
    /// Env var name holding the API key (e.g. `ANTHROPIC_API_KEY`).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// USD per 1k input tokens.
    #[serde(default)]
    pub cost_per_1k_input: f64,
    /// USD per 1k output tokens.
    #[serde(default)]
    pub cost_per_1k_output: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Whether the backend starts out eligible for default fan-out.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl BackendConfig {
    /// A custom-adapter backend with default limits, zero cost and the
    /// default retry policy.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: ProviderKind::Custom,
            model: model.into(),
            api_key_env: None,
            base_url: None,
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            enabled: true,
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_costs(mut self, per_1k_input: f64, per_1k_output: f64) -> Self {
        self.cost_per_1k_input = per_1k_input;
        self.cost_per_1k_output = per_1k_output;
        self
    }

    pub fn with_limits(mut self, context_window: u32, max_output_tokens: u32) -> Self {
        self.context_window = context_window;
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Check every invariant of a backend configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigValidationError::EmptyName);
        }
        let backend = self.name.clone();
        if self.model.trim().is_empty() {
            return Err(ConfigValidationError::EmptyModel { backend });
        }
        if self.context_window == 0 {
            return Err(ConfigValidationError::NonPositive {
                backend,
                field: "context_window",
            });
        }
        if self.max_output_tokens == 0 {
            return Err(ConfigValidationError::NonPositive {
                backend,
                field: "max_output_tokens",
            });
        }
        if self.max_output_tokens > self.context_window {
            return Err(ConfigValidationError::OutputExceedsContext {
                backend,
                max_output: self.max_output_tokens,
                context_window: self.context_window,
            });
        }
        if self.retry_attempts == 0 {
            return Err(ConfigValidationError::NonPositive {
                backend,
                field: "retry_attempts",
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigValidationError::NonPositive {
                backend,
                field: "timeout_secs",
            });
        }
        if self.cost_per_1k_input < 0.0 {
            return Err(ConfigValidationError::NegativeCost {
                backend,
                field: "cost_per_1k_input",
            });
        }
        if self.cost_per_1k_output < 0.0 {
            return Err(ConfigValidationError::NegativeCost {
                backend,
                field: "cost_per_1k_output",
            });
        }
        Ok(())
    }

    /// Cost in USD of a request with the given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (output_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Resolve the API key from the environment, if one is configured.
    pub fn credentials(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(CredentialProvider::from_env)
    }
}

fn default_context_window() -> u32 {
    200_000
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub mode: BatchMode,
    /// Worker pool size for parallel mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Courtesy delay between items in sequential mode.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            workers: default_workers(),
            pacing_ms: default_pacing_ms(),
            output_dir: default_output_dir(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation(
                "batch.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

fn default_workers() -> usize {
    3
}
fn default_pacing_ms() -> u64 {
    2000
}
fn default_output_dir() -> String {
    "./output".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueConfig {
    /// Backend used for individual and comparative critiques.
    #[serde(default)]
    pub critic: Option<String>,
    #[serde(default = "default_rubric")]
    pub rubric: Vec<String>,
    #[serde(default = "default_critique_temperature")]
    pub temperature: f32,
    #[serde(default = "default_critique_max_tokens")]
    pub max_tokens: u32,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            critic: None,
            rubric: default_rubric(),
            temperature: default_critique_temperature(),
            max_tokens: default_critique_max_tokens(),
        }
    }
}

pub fn default_rubric() -> Vec<String> {
    [
        "prose quality",
        "character voice",
        "pacing",
        "dialogue",
        "emotional impact",
        "fidelity to outline",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_critique_temperature() -> f32 {
    0.3
}
fn default_critique_max_tokens() -> u32 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// SQLite full-text index over the project's reference documents.
    #[serde(default = "default_index_path")]
    pub index_path: String,
    #[serde(default)]
    pub analytical_endpoint: Option<String>,
    #[serde(default)]
    pub analytical_enabled: bool,
    #[serde(default = "default_analytical_key_env")]
    pub analytical_api_key_env: String,
    #[serde(default = "default_analytical_timeout")]
    pub analytical_timeout_secs: u64,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            analytical_endpoint: None,
            analytical_enabled: false,
            analytical_api_key_env: default_analytical_key_env(),
            analytical_timeout_secs: default_analytical_timeout(),
            default_max_results: default_max_results(),
        }
    }
}

fn default_index_path() -> String {
    "~/.chorus/knowledge.db".into()
}
fn default_analytical_key_env() -> String {
    "CHORUS_ANALYTICAL_API_KEY".into()
}
fn default_analytical_timeout() -> u64 {
    60
}
fn default_max_results() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl QueryCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_entries() -> usize {
    256
}
fn default_cache_ttl() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Credential provider: reads secrets from the environment at runtime
// ---------------------------------------------------------------------------

/// Resolves env var *names* stored in config to their values on demand.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var. Empty values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Names of configured backends whose credentials are resolvable.
    pub fn available_backends(config: &Config) -> Vec<&str> {
        config
            .backends
            .iter()
            .filter(|b| b.api_key_env.is_none() || b.credentials().is_some())
            .map(|b| b.name.as_str())
            .collect()
    }
}

//! HTTP backend adapters built from [`BackendConfig`].
//!
//! API keys are never stored on the adapter; each call resolves the key from
//! the env var named in the config so rotated keys are picked up without a
//! restart.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ch_core::config::{BackendConfig, ConfigValidationError, CredentialProvider, ProviderKind};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::capability::{
    estimate_tokens, GenerationCapability, GenerationError, GenerationParams, GenerationResult,
};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const LOCAL_BASE_URL: &str = "http://127.0.0.1:11434";
pub const ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Error)]
pub enum ProviderBuildError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error("backend '{0}' uses a custom adapter and cannot be built from config")]
    CustomAdapter(String),
}

/// Build the adapter a config entry names.
pub fn build_backend(
    config: &BackendConfig,
) -> Result<Arc<dyn GenerationCapability>, ProviderBuildError> {
    match config.provider {
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicBackend::new(config.clone())?)),
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiBackend::new(config.clone())?)),
        ProviderKind::Local => Ok(Arc::new(LocalBackend::new(config.clone())?)),
        ProviderKind::Custom => Err(ProviderBuildError::CustomAdapter(config.name.clone())),
    }
}

/// Env var the adapter for `config` reads its key from, if it needs one.
pub fn credential_var(config: &BackendConfig) -> Option<&str> {
    match config.provider {
        ProviderKind::Anthropic => Some(config.api_key_env.as_deref().unwrap_or(ANTHROPIC_KEY_ENV)),
        ProviderKind::OpenAi => Some(config.api_key_env.as_deref().unwrap_or(OPENAI_KEY_ENV)),
        ProviderKind::Local | ProviderKind::Custom => config.api_key_env.as_deref(),
    }
}

/// Whether the adapter's key is required and resolvable. Local servers
/// treat a configured key as optional.
pub fn credentials_available(config: &BackendConfig) -> bool {
    match config.provider {
        ProviderKind::Local => true,
        _ => credential_var(config)
            .map(|var| CredentialProvider::from_env(var).is_some())
            .unwrap_or(true),
    }
}

fn http_client(config: &BackendConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn resolve_key(config: &BackendConfig, default_var: &str) -> Result<String, GenerationError> {
    let var = config.api_key_env.as_deref().unwrap_or(default_var);
    CredentialProvider::from_env(var).ok_or_else(|| GenerationError::MissingCredentials {
        backend: config.name.clone(),
        var: var.to_string(),
    })
}

/// Map 429 and other non-success statuses to errors.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = resp.status().as_u16();

    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(GenerationError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(GenerationError::Api {
            status,
            message: text,
        });
    }

    Ok(resp)
}

/// Assemble a result, estimating tokens where the provider reported none.
fn finish(
    config: &BackendConfig,
    prompt: &str,
    content: String,
    model: Option<String>,
    usage: Option<(u64, u64)>,
    started: Instant,
) -> GenerationResult {
    let (input_tokens, output_tokens) =
        usage.unwrap_or_else(|| (estimate_tokens(prompt), estimate_tokens(&content)));
    GenerationResult {
        cost: config.calculate_cost(input_tokens, output_tokens),
        model: model.unwrap_or_else(|| config.model.clone()),
        response_time_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
        metadata: serde_json::Map::new(),
        content,
        input_tokens,
        output_tokens,
    }
}

fn chat_messages(prompt: &str, params: &GenerationParams) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = params.system_prompt() {
        messages.push(serde_json::json!({ "role": "system", "content": system }));
    }
    messages.push(serde_json::json!({ "role": "user", "content": prompt }));
    messages
}

// ---------------------------------------------------------------------------
// AnthropicBackend
// ---------------------------------------------------------------------------

/// Adapter for the Anthropic Messages API.
pub struct AnthropicBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        Ok(Self {
            client: http_client(&config),
            config,
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL)
    }

    /// The system prompt goes in the top-level `system` field, not a message.
    pub fn build_request_body(
        config: &BackendConfig,
        prompt: &str,
        params: &GenerationParams,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": params.effective_max_tokens(config),
            "temperature": params.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(system) = params.system_prompt() {
            body["system"] = serde_json::Value::String(system.to_string());
        }
        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl GenerationCapability for AnthropicBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let api_key = resolve_key(&self.config, ANTHROPIC_KEY_ENV)?;
        let body = Self::build_request_body(&self.config, prompt, params);
        let url = format!("{}/v1/messages", self.base_url());
        let started = Instant::now();

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let api_resp: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(finish(
            &self.config,
            prompt,
            content,
            api_resp.model,
            api_resp.usage.map(|u| (u.input_tokens, u.output_tokens)),
            started,
        ))
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible response schema (OpenAI and local servers)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl ChatResponse {
    fn into_parts(self) -> Result<(String, Option<String>, Option<(u64, u64)>), GenerationError> {
        let content = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Parse("no choices in response".into()))?
            .message
            .content
            .unwrap_or_default();
        let usage = self.usage.and_then(|u| match (u.prompt_tokens, u.completion_tokens) {
            (Some(input), Some(output)) => Some((input, output)),
            _ => None,
        });
        Ok((content, self.model, usage))
    }
}

fn chat_body(config: &BackendConfig, prompt: &str, params: &GenerationParams) -> serde_json::Value {
    serde_json::json!({
        "model": config.model,
        "max_tokens": params.effective_max_tokens(config),
        "temperature": params.temperature,
        "messages": chat_messages(prompt, params),
    })
}

// ---------------------------------------------------------------------------
// OpenAiBackend
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI Chat Completions API.
pub struct OpenAiBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        Ok(Self {
            client: http_client(&config),
            config,
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL)
    }
}

#[async_trait]
impl GenerationCapability for OpenAiBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let api_key = resolve_key(&self.config, OPENAI_KEY_ENV)?;
        let body = chat_body(&self.config, prompt, params);
        let url = format!("{}/v1/chat/completions", self.base_url());
        let started = Instant::now();

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let api_resp: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;
        let (content, model, usage) = api_resp.into_parts()?;

        Ok(finish(&self.config, prompt, content, model, usage, started))
    }
}

// ---------------------------------------------------------------------------
// LocalBackend
// ---------------------------------------------------------------------------

/// Adapter for OpenAI-compatible local inference servers (vllm, llama.cpp,
/// Ollama, TGI).
///
/// Calls are queued through a per-backend gate so a burst of parallel
/// requests does not overload a single model server.
pub struct LocalBackend {
    config: BackendConfig,
    client: reqwest::Client,
    gate: Semaphore,
}

fn local_max_concurrent() -> usize {
    std::env::var("CHORUS_LOCAL_MAX_CONCURRENT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

impl LocalBackend {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        Ok(Self {
            client: http_client(&config),
            gate: Semaphore::new(local_max_concurrent()),
            config,
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(LOCAL_BASE_URL)
    }
}

#[async_trait]
impl GenerationCapability for LocalBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| GenerationError::Http("local inference queue unavailable".into()))?;

        let body = chat_body(&self.config, prompt, params);
        let url = format!("{}/v1/chat/completions", self.base_url());
        let started = Instant::now();

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        // Local servers usually run without auth.
        if let Some(key) = self.config.credentials() {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else if e.is_connect() {
                GenerationError::Http(format!(
                    "cannot connect to local inference server at {}: {}",
                    self.base_url(),
                    e
                ))
            } else {
                GenerationError::Http(e.to_string())
            }
        })?;
        let resp = check_status(resp).await?;

        let api_resp: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;
        let (content, model, usage) = api_resp.into_parts()?;

        Ok(finish(&self.config, prompt, content, model, usage, started))
    }
}

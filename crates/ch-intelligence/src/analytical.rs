//! HTTP client for the external analytical knowledge service.

use std::time::Duration;

use async_trait::async_trait;
use ch_core::config::{CredentialProvider, KnowledgeConfig};
use serde::Deserialize;

use crate::knowledge::{AnalyticalSource, KnowledgeError, KnowledgeSourceKind, QueryResult};

/// POSTs `{query, max_results}` as JSON and expects an answer object back.
pub struct HttpAnalyticalSource {
    client: reqwest::Client,
    endpoint: String,
    api_key_env: Option<String>,
}

#[derive(Deserialize)]
struct AnalyticalResponse {
    answer: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl HttpAnalyticalSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            api_key_env: None,
        }
    }

    /// Bearer key resolved from this env var on each request, when set.
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &KnowledgeConfig) -> Option<Self> {
        let endpoint = config.analytical_endpoint.as_deref()?;
        Some(
            Self::new(endpoint, Duration::from_secs(config.analytical_timeout_secs))
                .with_api_key_env(&config.analytical_api_key_env),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalyticalSource for HttpAnalyticalSource {
    async fn ask(&self, query: &str, max_results: usize) -> Result<QueryResult, KnowledgeError> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "query": query,
            "max_results": max_results,
        }));
        if let Some(key) = self.api_key_env.as_deref().and_then(CredentialProvider::from_env) {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(KnowledgeError::SourceUnavailable {
                source_kind: KnowledgeSourceKind::External,
                reason: format!("status {}: {}", status.as_u16(), text),
            });
        }

        let body: AnalyticalResponse =
            resp.json()
                .await
                .map_err(|e| KnowledgeError::SourceUnavailable {
                    source_kind: KnowledgeSourceKind::External,
                    reason: format!("malformed response: {e}"),
                })?;

        Ok(QueryResult {
            source: KnowledgeSourceKind::External,
            answer: body.answer,
            confidence: body.confidence.unwrap_or(0.0).clamp(0.0, 0.99),
            references: body.references,
            metadata: body.metadata,
        })
    }
}

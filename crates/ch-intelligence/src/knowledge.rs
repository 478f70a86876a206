//! Knowledge query routing across a local full-text index and an external
//! analytical source.
//!
//! Queries are classified by keyword heuristics, routed to a source, served
//! through the [`QueryCache`] and retried once on the alternate source when
//! the chosen one fails.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::query_cache::QueryCache;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Analytical,
    Factual,
    Conceptual,
    General,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryType::Analytical => "analytical",
            QueryType::Factual => "factual",
            QueryType::Conceptual => "conceptual",
            QueryType::General => "general",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSourceKind {
    /// Full-text index over the project's reference documents.
    Local,
    /// Slower analytical service that may be down.
    External,
}

impl KnowledgeSourceKind {
    pub fn alternate(self) -> Self {
        match self {
            KnowledgeSourceKind::Local => KnowledgeSourceKind::External,
            KnowledgeSourceKind::External => KnowledgeSourceKind::Local,
        }
    }
}

impl fmt::Display for KnowledgeSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnowledgeSourceKind::Local => f.write_str("local"),
            KnowledgeSourceKind::External => f.write_str("external"),
        }
    }
}

impl FromStr for KnowledgeSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(KnowledgeSourceKind::Local),
            "external" | "analytical" => Ok(KnowledgeSourceKind::External),
            other => Err(format!("unknown knowledge source: {other}")),
        }
    }
}

/// Answer to one knowledge query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub source: KnowledgeSourceKind,
    pub answer: String,
    /// In `[0.0, 1.0)`.
    pub confidence: f64,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl QueryResult {
    pub fn new(source: KnowledgeSourceKind, answer: impl Into<String>, confidence: f64) -> Self {
        Self {
            source,
            answer: answer.into(),
            confidence,
            references: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// One ranked hit from the full-text index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMatch {
    pub document_id: String,
    pub excerpt: String,
    /// Higher is more relevant.
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("{source_kind} knowledge source unavailable: {reason}")]
    SourceUnavailable {
        source_kind: KnowledgeSourceKind,
        reason: String,
    },

    #[error(
        "all knowledge sources failed (primary {primary}: {primary_error}; fallback: {})",
        .fallback_error.as_deref().unwrap_or("not attempted")
    )]
    AllSourcesFailed {
        primary: KnowledgeSourceKind,
        primary_error: String,
        fallback_error: Option<String>,
    },

    #[error("index error: {0}")]
    Index(String),
}

impl From<reqwest::Error> for KnowledgeError {
    fn from(err: reqwest::Error) -> Self {
        KnowledgeError::SourceUnavailable {
            source_kind: KnowledgeSourceKind::External,
            reason: if err.is_timeout() {
                "request timed out".into()
            } else {
                err.to_string()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Source traits
// ---------------------------------------------------------------------------

/// Ranked full-text search over reference documents.
#[async_trait]
pub trait FullTextIndex: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<DocumentMatch>, KnowledgeError>;
}

/// Request/response analytical query service.
#[async_trait]
pub trait AnalyticalSource: Send + Sync {
    async fn ask(&self, query: &str, max_results: usize) -> Result<QueryResult, KnowledgeError>;
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const ANALYTICAL_KEYWORDS: &[&str] = &[
    "why",
    "how does",
    "how do",
    "how did",
    "compare",
    "contrast",
    "analyze",
    "analyse",
    "analysis",
    "explain",
    "evaluate",
    "relationship between",
    "difference between",
    "implications",
    "impact of",
];

const FACTUAL_KEYWORDS: &[&str] = &[
    "what is",
    "what was",
    "who",
    "when",
    "where",
    "which",
    "how many",
    "how much",
    "list",
    "name",
];

const CONCEPTUAL_KEYWORDS: &[&str] = &[
    "concept",
    "theory",
    "meaning of",
    "define",
    "definition",
    "idea",
    "principle",
    "theme",
];

/// Lowercase, punctuation to spaces, padded so phrase matches respect word
/// boundaries.
fn normalize(query: &str) -> String {
    let words: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    format!(" {} ", words.join(" "))
}

fn matches_any(normalized: &str, keywords: &[&str]) -> bool {
    keywords
        .iter()
        .any(|kw| normalized.contains(&format!(" {kw} ")))
}

/// Analytical phrasing is checked first, then factual, then conceptual.
pub fn classify(query: &str) -> QueryType {
    let normalized = normalize(query);
    if matches_any(&normalized, ANALYTICAL_KEYWORDS) {
        QueryType::Analytical
    } else if matches_any(&normalized, FACTUAL_KEYWORDS) {
        QueryType::Factual
    } else if matches_any(&normalized, CONCEPTUAL_KEYWORDS) {
        QueryType::Conceptual
    } else {
        QueryType::General
    }
}

/// Confidence for a local answer built from `matches` references.
pub fn local_confidence(matches: usize) -> f64 {
    if matches == 0 {
        0.0
    } else {
        (0.5 + 0.1 * matches as f64).min(0.95)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub local_queries: u64,
    pub external_queries: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

pub struct KnowledgeRouter {
    local: Arc<dyn FullTextIndex>,
    analytical: Option<Arc<dyn AnalyticalSource>>,
    analytical_enabled: bool,
    cache: QueryCache,
    stats: Mutex<RouterStats>,
}

impl KnowledgeRouter {
    pub fn new(local: Arc<dyn FullTextIndex>, cache: QueryCache) -> Self {
        Self {
            local,
            analytical: None,
            analytical_enabled: false,
            cache,
            stats: Mutex::new(RouterStats::default()),
        }
    }

    pub fn with_analytical(mut self, source: Arc<dyn AnalyticalSource>, enabled: bool) -> Self {
        self.analytical = Some(source);
        self.analytical_enabled = enabled;
        self
    }

    pub fn analytical_enabled(&self) -> bool {
        self.analytical_enabled && self.analytical.is_some()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn route(&self, query: &str) -> KnowledgeSourceKind {
        if classify(query) == QueryType::Analytical && self.analytical_enabled() {
            KnowledgeSourceKind::External
        } else {
            KnowledgeSourceKind::Local
        }
    }

    /// Answer `query` from cache, the forced or routed source, or its
    /// fallback.
    pub async fn query(
        &self,
        query: &str,
        max_results: usize,
        force_source: Option<KnowledgeSourceKind>,
    ) -> Result<QueryResult, KnowledgeError> {
        let params = BTreeMap::from([(
            "max_results".to_string(),
            serde_json::Value::from(max_results),
        )]);

        if let Some(hit) = self.cache.get(query, &params).await {
            self.stats.lock().await.cache_hits += 1;
            debug!(source = %hit.source, "knowledge query served from cache");
            return Ok(hit);
        }

        let primary = force_source.unwrap_or_else(|| self.route(query));
        let result = match self.execute(primary, query, max_results).await {
            Ok(result) => result,
            Err(primary_err) => self.fallback(primary, primary_err, query, max_results).await?,
        };

        self.cache.set(query, &params, result.clone()).await;
        Ok(result)
    }

    async fn fallback(
        &self,
        primary: KnowledgeSourceKind,
        primary_err: KnowledgeError,
        query: &str,
        max_results: usize,
    ) -> Result<QueryResult, KnowledgeError> {
        warn!(source = %primary, error = %primary_err, "knowledge source failed");
        let secondary = primary.alternate();
        let can_fall_back = match secondary {
            KnowledgeSourceKind::Local => true,
            KnowledgeSourceKind::External => self.analytical_enabled(),
        };

        if !can_fall_back {
            self.stats.lock().await.failures += 1;
            return Err(KnowledgeError::AllSourcesFailed {
                primary,
                primary_error: primary_err.to_string(),
                fallback_error: None,
            });
        }

        self.stats.lock().await.fallbacks += 1;
        info!(from = %primary, to = %secondary, "falling back to alternate knowledge source");
        match self.execute(secondary, query, max_results).await {
            Ok(result) => Ok(result),
            Err(fallback_err) => {
                self.stats.lock().await.failures += 1;
                Err(KnowledgeError::AllSourcesFailed {
                    primary,
                    primary_error: primary_err.to_string(),
                    fallback_error: Some(fallback_err.to_string()),
                })
            }
        }
    }

    async fn execute(
        &self,
        source: KnowledgeSourceKind,
        query: &str,
        max_results: usize,
    ) -> Result<QueryResult, KnowledgeError> {
        match source {
            KnowledgeSourceKind::Local => {
                self.stats.lock().await.local_queries += 1;
                self.execute_local(query, max_results).await
            }
            KnowledgeSourceKind::External => {
                self.stats.lock().await.external_queries += 1;
                let source = match &self.analytical {
                    None => {
                        return Err(KnowledgeError::SourceUnavailable {
                            source_kind: KnowledgeSourceKind::External,
                            reason: "no analytical source configured".into(),
                        })
                    }
                    Some(_) if !self.analytical_enabled => {
                        return Err(KnowledgeError::SourceUnavailable {
                            source_kind: KnowledgeSourceKind::External,
                            reason: "analytical source is disabled".into(),
                        })
                    }
                    Some(source) => source,
                };
                let mut result = source.ask(query, max_results).await?;
                result.source = KnowledgeSourceKind::External;
                Ok(result)
            }
        }
    }

    async fn execute_local(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<QueryResult, KnowledgeError> {
        let mut matches = self.local.search(query, max_results).await?;
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(max_results);
        Ok(synthesize_local(query, &matches))
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.lock().await.clone()
    }
}

/// Build a multi-reference answer from ranked matches.
pub fn synthesize_local(query: &str, matches: &[DocumentMatch]) -> QueryResult {
    let query_type = classify(query);
    if matches.is_empty() {
        let mut result = QueryResult::new(
            KnowledgeSourceKind::Local,
            format!("No relevant information found for: {query}"),
            0.0,
        );
        result
            .metadata
            .insert("query_type".into(), query_type.to_string().into());
        result.metadata.insert("match_count".into(), 0.into());
        return result;
    }

    let mut answer = format!("Found {} relevant reference(s):\n", matches.len());
    for (i, m) in matches.iter().enumerate() {
        answer.push_str(&format!("\n[{}] {}: {}", i + 1, m.document_id, m.excerpt.trim()));
    }

    let mut result = QueryResult::new(
        KnowledgeSourceKind::Local,
        answer,
        local_confidence(matches.len()),
    );
    result.references = matches.iter().map(|m| m.document_id.clone()).collect();
    result
        .metadata
        .insert("query_type".into(), query_type.to_string().into());
    result
        .metadata
        .insert("match_count".into(), matches.len().into());
    result
}

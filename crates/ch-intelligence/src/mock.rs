//! A scripted backend for tests and dry runs.
//!
//! Each call pops the next queued reply; when the queue is empty the default
//! reply is returned (or an error when the mock is set to always fail).
//! Every call is logged with the prompt, the params and the instant it
//! started, which lets paused-clock tests assert retry spacing.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ch_core::config::BackendConfig;
use chrono::Utc;
use tokio::time::Instant;

use crate::capability::{GenerationCapability, GenerationError, GenerationParams, GenerationResult};

/// Canned output of one mock call.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Fixed cost; `None` prices the tokens with the backend config.
    pub cost: Option<f64>,
}

impl MockReply {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 10,
            output_tokens: 5,
            cost: None,
        }
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub prompt: String,
    pub params: GenerationParams,
    pub at: Instant,
}

pub struct MockBackend {
    config: BackendConfig,
    queue: Mutex<VecDeque<Result<MockReply, GenerationError>>>,
    default_reply: MockReply,
    always_fail: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            default_reply: MockReply::new("Mock response"),
            always_fail: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a mock with a default config under `name`.
    pub fn named(name: &str) -> Self {
        Self::new(BackendConfig::new(name, format!("mock-{name}")))
    }

    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Queue a successful reply.
    pub fn with_reply(self, reply: MockReply) -> Self {
        self.lock_queue().push_back(Ok(reply));
        self
    }

    /// Queue a failure.
    pub fn with_error(self, error: GenerationError) -> Self {
        self.lock_queue().push_back(Err(error));
        self
    }

    /// Fail every call whose queue entry is exhausted.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.always_fail = Some(message.into());
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<MockReply, GenerationError>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_reply(&self) -> Result<MockReply, GenerationError> {
        if let Some(queued) = self.lock_queue().pop_front() {
            return queued;
        }
        match &self.always_fail {
            Some(message) => Err(GenerationError::Backend(message.clone())),
            None => Ok(self.default_reply.clone()),
        }
    }
}

#[async_trait]
impl GenerationCapability for MockBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let started = Instant::now();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall {
                prompt: prompt.to_string(),
                params: params.clone(),
                at: started,
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.next_reply()?;
        Ok(GenerationResult {
            cost: reply.cost.unwrap_or_else(|| {
                self.config
                    .calculate_cost(reply.input_tokens, reply.output_tokens)
            }),
            model: self.config.model.clone(),
            response_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
            content: reply.content,
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
        })
    }
}

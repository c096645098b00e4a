//! The only conduit to the hosted inference service.
//!
//! [`LlmGateway`] owns the timeout, rate-limit and transient-retry policy and
//! hands raw completion text back to the stages. It performs no semantic
//! validation of that text.

pub mod mock;
pub mod openai;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::PipelineConfig;
use crate::rate_limit::AdaptivePacer;

/// Failure of a single completion call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure or timeout. Eligible for retry.
    #[error("transient inference error: {0}")]
    Transient(String),
    /// Server returned 429.
    #[error("inference service rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    /// Any other non-2xx response. Not retried.
    #[error("inference service error (HTTP {status}): {message}")]
    Service { status: u16, message: String },
    /// 2xx with a body that carries no completion text.
    #[error("inference service returned an empty response")]
    EmptyResponse,
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_) | GatewayError::RateLimited { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A role-tagged prompt message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One chat-style completion request, minus the model identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A chat completion endpoint.
pub trait ChatBackend: Send + Sync {
    /// Short name used in logs (e.g., "groq", "mock").
    fn name(&self) -> &str;

    /// Issue one completion request and return the raw completion text.
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + 'a>>;
}

/// Policy for retrying transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), doubled per attempt
    /// with up to 10% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(1 << attempt.min(6));
        let jitter_ms = (base.as_millis() as u64 / 10).max(1);
        base + Duration::from_millis(fastrand::u64(0..jitter_ms))
    }
}

/// Cheaply cloneable handle shared by every run that uses the same endpoint.
#[derive(Clone)]
pub struct LlmGateway {
    backend: Arc<dyn ChatBackend>,
    limiter: Option<Arc<AdaptivePacer>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("backend", &self.backend.name())
            .field("limiter", &self.limiter)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl LlmGateway {
    /// Wrap an arbitrary backend with the policy from `config`.
    pub fn new(backend: Arc<dyn ChatBackend>, config: &PipelineConfig) -> Self {
        let limiter = (config.requests_per_minute > 0)
            .then(|| Arc::new(AdaptivePacer::per_minute(config.requests_per_minute)));
        Self {
            backend,
            limiter,
            timeout: config.request_timeout(),
            retry: RetryPolicy {
                max_retries: config.max_transient_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        }
    }

    /// Gateway talking to the OpenAI-compatible endpoint named in `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let backend = openai::OpenAiCompatBackend::new(config);
        Self::new(Arc::new(backend), config)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `complete(messages, temperature, max_tokens) -> text`.
    ///
    /// Each attempt is bounded by the per-call timeout. Transient failures are
    /// retried up to the policy's limit with backoff; a 429 honours Retry-After
    /// capped at the timeout. Everything else is returned as-is.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let request = CompletionRequest {
            messages,
            temperature: temperature.clamp(0.0, 1.0),
            max_tokens,
        };

        let mut attempt = 0;
        loop {
            if let Some(lim) = &self.limiter {
                lim.wait().await;
            }

            let result =
                match tokio::time::timeout(self.timeout, self.backend.complete(&request, self.timeout))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(GatewayError::Transient(format!(
                        "request timed out after {}s",
                        self.timeout.as_secs()
                    ))),
                };

            let err = match result {
                Ok(text) if text.trim().is_empty() => return Err(GatewayError::EmptyResponse),
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.retry.max_retries {
                tracing::debug!(backend = self.backend.name(), error = %err, attempt, "gateway call failed");
                return Err(err);
            }

            let wait = match &err {
                GatewayError::RateLimited { retry_after } => {
                    if let Some(lim) = &self.limiter {
                        lim.throttled();
                    }
                    retry_after
                        .unwrap_or_else(|| self.retry.delay(attempt))
                        .min(self.timeout)
                }
                _ => self.retry.delay(attempt),
            };
            tracing::info!(
                backend = self.backend.name(),
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "transient inference error, retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

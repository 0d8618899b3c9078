//! External capabilities consumed by the research engine.
//!
//! The engine only talks to two narrow interfaces:
//! - [`SearchProvider`]: one query in, a list of [`SourceItem`](crate::types::SourceItem)s out.
//! - [`ModelProvider`]: a system/user prompt pair plus a JSON schema in, a
//!   structured JSON value and its token usage out.
//!
//! Concrete clients live in submodules; `create_*_provider()` builds them from config.

pub mod firecrawl;
pub mod mock;
pub mod openai_compat;

use crate::config::{ModelConfig, RetryConfig, SearchConfig};
use crate::error::{ConfigError, ModelError, SearchError};
use crate::types::{SearchOptions, SearchResponse, TokenUsage};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use firecrawl::FirecrawlSearchProvider;
pub use mock::{MockModelProvider, MockSearchProvider};
pub use openai_compat::OpenAiCompatibleProvider;

/// A request for a structured (JSON schema constrained) completion.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Name of the output schema. Also used by providers to label the request.
    pub schema_name: String,
    /// JSON schema the reply must satisfy.
    pub schema: Value,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
}

/// A structured reply and the tokens it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResponse {
    pub value: Value,
    pub usage: TokenUsage,
}

impl StructuredResponse {
    /// Deserialize the reply into `T`, reporting a schema mismatch on failure.
    pub fn parse<T: DeserializeOwned>(&self, schema_name: &str) -> Result<T, ModelError> {
        serde_json::from_value(self.value.clone()).map_err(|e| ModelError::SchemaMismatch {
            schema: schema_name.to_string(),
            message: e.to_string(),
        })
    }
}

/// The model capability.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a JSON value conforming to `request.schema`.
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, ModelError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// The search capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run one query. Timeouts are enforced by the implementation.
    async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError>;

    /// Return the provider name.
    fn name(&self) -> &str;
}

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `ModelError::RateLimited` (respects `retry_after_secs`),
/// `ModelError::Timeout` and `ModelError::ApiRequest`. Auth and parse errors return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ModelError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient model error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Check if an error is retryable (transient).
fn is_retryable(err: &ModelError) -> bool {
    matches!(
        err,
        ModelError::RateLimited { .. } | ModelError::Timeout { .. } | ModelError::ApiRequest { .. }
    )
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ModelError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let ModelError::RateLimited { retry_after_secs } = err {
        return (retry_after_secs * 1000).max(computed);
    }
    computed
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        let jitter = (capped as f64 * 0.25 * jitter_fraction()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Cheap jitter source in `[0, 1)` taken from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Resolve an API key: inline value first, then the named environment variable.
pub fn resolve_api_key(inline: Option<&str>, env_var: &str) -> Option<String> {
    inline
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .filter(|key| !key.trim().is_empty())
}

/// Build the model capability described by `config`.
///
/// Fails with [`ConfigError::EnvVarMissing`] when no API key can be resolved
/// for a remote endpoint.
pub fn create_model_provider(
    config: &ModelConfig,
) -> Result<Arc<dyn ModelProvider>, ConfigError> {
    Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
}

/// Build the search capability described by `config`.
pub fn create_search_provider(
    config: &SearchConfig,
    default_timeout: Duration,
) -> Result<Arc<dyn SearchProvider>, ConfigError> {
    Ok(Arc::new(FirecrawlSearchProvider::new(
        config,
        default_timeout,
    )?))
}

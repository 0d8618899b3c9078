//! Configuration system for Delve.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/delve/config.toml` and/or `.delve/config.toml`
//! in the workspace directory.

use crate::error::ValidationError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for Delve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelveConfig {
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl DelveConfig {
    /// Validate the whole config and return human-readable warnings.
    ///
    /// Returns an empty Vec if the config is valid. Problems are reported as
    /// warnings; the components clamp values into a usable range.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.research.validate() {
            warnings.push(format!("[research] {w}"));
        }
        for w in self.dispatcher.validate() {
            warnings.push(format!("[dispatcher] {w}"));
        }
        for w in self.cache.validate() {
            warnings.push(format!("[cache] {w}"));
        }
        warnings
    }
}

/// Limits and defaults for research sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Largest accepted depth.
    pub max_depth: usize,
    /// Largest accepted breadth.
    pub max_breadth: usize,
    pub default_depth: usize,
    pub default_breadth: usize,
    /// Halve breadth (rounding up) at every deeper level.
    pub breadth_decay: bool,
    /// Maximum concurrent evaluator and digest calls within one level.
    pub evaluation_concurrency: usize,
    /// Source content beyond this many characters is dropped from prompts.
    pub max_content_chars: usize,
    /// Token cap applied when a session does not supply one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_token_budget: Option<u64>,
    /// Results requested per search query.
    pub search_result_limit: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_breadth: 5,
            default_depth: 2,
            default_breadth: 3,
            breadth_decay: true,
            evaluation_concurrency: 4,
            max_content_chars: 25_000,
            default_token_budget: None,
            search_result_limit: 5,
        }
    }
}

impl ResearchConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.default_depth == 0 || self.default_depth > self.max_depth {
            warnings.push(format!(
                "default_depth {} is outside 1..={}",
                self.default_depth, self.max_depth
            ));
        }
        if self.default_breadth == 0 || self.default_breadth > self.max_breadth {
            warnings.push(format!(
                "default_breadth {} is outside 1..={}",
                self.default_breadth, self.max_breadth
            ));
        }
        if self.evaluation_concurrency == 0 {
            warnings.push("evaluation_concurrency is 0; treated as 1".to_string());
        }
        if self.max_content_chars < 500 {
            warnings.push(format!(
                "max_content_chars is {}; evaluations will see very little content",
                self.max_content_chars
            ));
        }
        warnings
    }

    /// Check session parameters before any external call is made.
    pub fn validate_request(
        &self,
        query: &str,
        depth: usize,
        breadth: usize,
    ) -> Result<(), ValidationError> {
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        if depth == 0 || depth > self.max_depth {
            return Err(ValidationError::DepthOutOfRange {
                value: depth,
                max: self.max_depth,
            });
        }
        if breadth == 0 || breadth > self.max_breadth {
            return Err(ValidationError::BreadthOutOfRange {
                value: breadth,
                max: self.max_breadth,
            });
        }
        Ok(())
    }
}

/// Tuning for the search dispatcher's adaptive concurrency controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    /// Minimum time between two ceiling adjustments.
    pub adjustment_interval_secs: u64,
    /// Samples required since the last adjustment before adjusting again.
    pub min_samples: usize,
    /// p95 latency under which the ceiling may grow.
    pub low_latency_ms: u64,
    /// p95 latency over which the ceiling shrinks.
    pub high_latency_ms: u64,
    /// Maximum number of samples kept in the rolling window.
    pub sample_window: usize,
    /// Default per-call search timeout.
    pub search_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 8,
            initial_concurrency: 2,
            adjustment_interval_secs: 5,
            min_samples: 5,
            low_latency_ms: 1_000,
            high_latency_ms: 5_000,
            sample_window: 100,
            search_timeout_secs: 15,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.min_concurrency == 0 {
            warnings.push("min_concurrency is 0; treated as 1".to_string());
        }
        if self.min_concurrency > self.max_concurrency {
            warnings.push(format!(
                "min_concurrency {} exceeds max_concurrency {}; max is raised to min",
                self.min_concurrency, self.max_concurrency
            ));
        }
        if self.initial_concurrency < self.min_concurrency
            || self.initial_concurrency > self.max_concurrency
        {
            warnings.push(format!(
                "initial_concurrency {} is outside [{}, {}]; clamped",
                self.initial_concurrency, self.min_concurrency, self.max_concurrency
            ));
        }
        if self.low_latency_ms >= self.high_latency_ms {
            warnings.push(format!(
                "low_latency_ms {} is not below high_latency_ms {}",
                self.low_latency_ms, self.high_latency_ms
            ));
        }
        if self.sample_window < self.min_samples {
            warnings.push(format!(
                "sample_window {} is smaller than min_samples {}; the ceiling can never adjust",
                self.sample_window, self.min_samples
            ));
        }
        if self.adjustment_interval_secs == 0 {
            warnings.push(
                "adjustment_interval_secs is 0; the ceiling may move on every min_samples calls"
                    .to_string(),
            );
        }
        if self.search_timeout_secs == 0 {
            warnings.push("search_timeout_secs is 0; every search will time out".to_string());
        }
        warnings
    }

    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_secs(self.adjustment_interval_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum entries held by the in-process tier.
    pub near_max_entries: usize,
    /// TTL cap for the in-process tier.
    pub near_max_ttl_secs: u64,
    /// TTL for reliability assessments.
    pub evaluation_ttl_secs: u64,
    /// TTL for search responses.
    pub search_ttl_secs: u64,
    /// Item count above which a write sweeps expired entries.
    pub sweep_threshold: usize,
    /// SQLite file backing the shared tier. Absent means in-process only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            near_max_entries: 1_000,
            near_max_ttl_secs: 300,
            evaluation_ttl_secs: 3_600,
            search_ttl_secs: 900,
            sweep_threshold: 800,
            shared_path: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.enabled && self.near_max_entries == 0 {
            warnings.push("near_max_entries is 0; treated as 1".to_string());
        }
        if self.sweep_threshold > self.near_max_entries {
            warnings.push(format!(
                "sweep_threshold {} exceeds near_max_entries {}; the near tier evicts before sweeping",
                self.sweep_threshold, self.near_max_entries
            ));
        }
        if self.enabled {
            for (name, secs) in [
                ("near_max_ttl_secs", self.near_max_ttl_secs),
                ("evaluation_ttl_secs", self.evaluation_ttl_secs),
                ("search_ttl_secs", self.search_ttl_secs),
            ] {
                if secs == 0 {
                    warnings.push(format!(
                        "{name} is 0; entries expire as soon as they are written"
                    ));
                }
            }
        }
        warnings
    }

    pub fn near_max_ttl(&self) -> Duration {
        Duration::from_secs(self.near_max_ttl_secs)
    }

    pub fn evaluation_ttl(&self) -> Duration {
        Duration::from_secs(self.evaluation_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }
}

/// Model capability (OpenAI-compatible endpoint) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Inline API key. Takes precedence over `api_key_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub retry: RetryConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            timeout_secs: 60,
            temperature: 0.2,
            retry: RetryConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry policy for transient model failures (rate limits, timeouts, connection errors).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Search capability (Firecrawl-style endpoint) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.firecrawl.dev/v1".to_string(),
            api_key_env: "FIRECRAWL_API_KEY".to_string(),
            api_key: None,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DELVE_`)
/// 3. Workspace-local config (`.delve/config.toml`)
/// 4. User config (`~/.config/delve/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DelveConfig>,
) -> Result<DelveConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DelveConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "delve", "delve") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".delve").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DELVE_RESEARCH__MAX_DEPTH, DELVE_DISPATCHER__MAX_CONCURRENCY, ...
    figment = figment.merge(Env::prefixed("DELVE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any Delve configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "delve", "delve")
        && config_dir.config_dir().join("config.toml").exists()
    {
        return true;
    }

    workspace.is_some_and(|ws| ws.join(".delve").join("config.toml").exists())
}

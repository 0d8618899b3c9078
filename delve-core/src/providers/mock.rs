//! Scriptable in-process providers.
//!
//! Used by the test suites and by the CLI's `--offline` mode, so a full
//! research session can run without network access or API keys.

use super::{ModelProvider, SearchProvider, StructuredRequest, StructuredResponse};
use crate::error::{ModelError, SearchError};
use crate::types::{SearchOptions, SearchResponse, SourceItem, TokenUsage};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Script = Result<Vec<SourceItem>, SearchError>;

/// A search provider that replays scripted results per query text.
///
/// Unscripted queries return an empty successful response, unless the
/// provider was built with [`MockSearchProvider::synthetic`].
pub struct MockSearchProvider {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
    per_query: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
    synthesize: bool,
}

impl MockSearchProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            per_query: Mutex::new(HashMap::new()),
            latency: None,
            synthesize: false,
        }
    }

    /// A provider that fabricates two sources for any unscripted query.
    pub fn synthetic() -> Self {
        Self {
            synthesize: true,
            ..Self::new()
        }
    }

    /// Return `items` whenever `query` is searched.
    pub fn with_results(self, query: &str, items: Vec<SourceItem>) -> Self {
        self.script(query, Ok(items));
        self
    }

    /// Fail whenever `query` is searched.
    pub fn with_failure(self, query: &str, error: SearchError) -> Self {
        self.script(query, Err(error));
        self
    }

    /// Sleep for `latency` before answering each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replace the script for `query`.
    pub fn script(&self, query: &str, outcome: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(query.to_string(), outcome);
        }
    }

    /// Total number of search calls received.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls received for one query text.
    pub fn calls_for(&self, query: &str) -> usize {
        self.per_query
            .lock()
            .map(|m| m.get(query).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn synthesized(query: &str, limit: usize) -> Vec<SourceItem> {
        let slug: String = query
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        (1..=limit.min(2))
            .map(|n| {
                SourceItem::new(format!("https://offline.delve.invalid/{slug}/{n}"))
                    .with_title(format!("{query} (offline source {n})"))
                    .with_content(format!(
                        "Offline placeholder content number {n} about {query}."
                    ))
            })
            .collect()
    }
}

impl Default for MockSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut per_query) = self.per_query.lock() {
            *per_query.entry(query.to_string()).or_insert(0) += 1;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|scripts| scripts.get(query).cloned());
        let items = match scripted {
            Some(outcome) => outcome?,
            None if self.synthesize => Self::synthesized(query, options.limit.unwrap_or(2)),
            None => Vec::new(),
        };
        let items = match options.limit {
            Some(limit) => items.into_iter().take(limit).collect(),
            None => items,
        };
        Ok(SearchResponse {
            items,
            success: true,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

type Handler = Box<dyn Fn(&StructuredRequest) -> Result<Value, ModelError> + Send + Sync>;

/// A model provider that answers through a handler closure.
///
/// The handler sees the full request and usually branches on
/// `request.schema_name`. Every call is counted per schema and reports the
/// usage configured for that schema (or the default usage).
pub struct MockModelProvider {
    handler: Handler,
    default_usage: TokenUsage,
    usage: HashMap<String, TokenUsage>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockModelProvider {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&StructuredRequest) -> Result<Value, ModelError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            default_usage: TokenUsage::new(100, 50),
            usage: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Usage reported by calls whose schema has no specific usage.
    pub fn with_default_usage(mut self, usage: TokenUsage) -> Self {
        self.default_usage = usage;
        self
    }

    /// Usage reported by calls for `schema_name`.
    pub fn with_usage(mut self, schema_name: &str, usage: TokenUsage) -> Self {
        self.usage.insert(schema_name.to_string(), usage);
        self
    }

    /// Number of calls made for `schema_name`.
    pub fn calls_for(&self, schema_name: &str) -> usize {
        self.calls
            .lock()
            .map(|m| m.get(schema_name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of calls across all schemas.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|m| m.values().sum()).unwrap_or(0)
    }

    /// Deterministic answers for the three research schemas, derived from
    /// the tagged sections of each prompt.
    pub fn offline() -> Self {
        Self::new(offline_reply).with_default_usage(TokenUsage::new(0, 0))
    }
}

#[async_trait]
impl ModelProvider for MockModelProvider {
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.schema_name.clone()).or_insert(0) += 1;
        }
        let value = (self.handler)(&request)?;
        let usage = self
            .usage
            .get(&request.schema_name)
            .copied()
            .unwrap_or(self.default_usage);
        Ok(StructuredResponse { value, usage })
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

/// Contents of every `<tag>...</tag>` section in `text`.
fn tagged<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        found.push(after[..end].trim());
        rest = &after[end + close.len()..];
    }
    found
}

/// Values of every `url="..."` attribute in `text`.
fn url_attributes(text: &str) -> Vec<&str> {
    text.split("url=\"")
        .skip(1)
        .filter_map(|s| s.split('"').next())
        .collect()
}

fn offline_reply(request: &StructuredRequest) -> Result<Value, ModelError> {
    let prompt = request.user_prompt.as_str();
    match request.schema_name.as_str() {
        "serp_queries" => {
            let topic = tagged(prompt, "query").first().copied().unwrap_or("topic");
            let mut candidates: Vec<String> = tagged(prompt, "direction")
                .into_iter()
                .map(str::to_string)
                .collect();
            for angle in ["overview", "trade-offs", "recent developments"] {
                candidates.push(format!("{topic} {angle}"));
            }
            let queries: Vec<Value> = candidates
                .into_iter()
                .map(|q| json!({ "query": q, "researchGoal": format!("Understand {q}") }))
                .collect();
            Ok(json!({ "queries": queries }))
        }
        "source_reliability" => Ok(json!({
            "score": 0.7,
            "reasoning": "Offline mode assigns every source the same moderate score.",
            "shouldUse": true,
            "preferenceViolation": null,
        })),
        "serp_digest" => {
            let learnings: Vec<Value> = url_attributes(prompt)
                .into_iter()
                .map(|url| {
                    json!({ "text": format!("Offline finding from {url}"), "sourceUrl": url })
                })
                .collect();
            Ok(json!({ "learnings": learnings, "followUpQuestions": [] }))
        }
        other => Err(ModelError::SchemaMismatch {
            schema: other.to_string(),
            message: "offline provider has no answer for this schema".to_string(),
        }),
    }
}

//! Firecrawl-style search provider.
//!
//! Posts to `{base_url}/search` and asks for markdown content of each hit,
//! so the engine receives extracted page text rather than bare snippets.

use super::{SearchProvider, resolve_api_key};
use crate::config::SearchConfig;
use crate::error::{ConfigError, SearchError};
use crate::types::{SearchOptions, SearchResponse, SourceItem};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_LIMIT: usize = 5;

/// Search capability backed by a Firecrawl-compatible HTTP API.
pub struct FirecrawlSearchProvider {
    client: Client,
    base_url: String,
    api_key: String,
    default_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct FirecrawlResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<FirecrawlDocument>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlDocument {
    url: Option<String>,
    title: Option<String>,
    description: Option<String>,
    markdown: Option<String>,
    #[serde(default)]
    metadata: Option<FirecrawlMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirecrawlMetadata {
    title: Option<String>,
    #[serde(alias = "sourceURL")]
    source_url: Option<String>,
    published_time: Option<String>,
}

impl From<FirecrawlDocument> for SourceItem {
    fn from(doc: FirecrawlDocument) -> Self {
        let metadata = doc.metadata;
        let (meta_title, meta_url, published) = match metadata {
            Some(m) => (m.title, m.source_url, m.published_time),
            None => (None, None, None),
        };
        SourceItem {
            url: doc.url.or(meta_url),
            title: doc.title.or(meta_title),
            content: doc.markdown.or(doc.description),
            published_date: published,
        }
    }
}

impl FirecrawlSearchProvider {
    pub fn new(config: &SearchConfig, default_timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), &config.api_key_env)
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: config.api_key_env.clone(),
            })?;
        Ok(Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_timeout,
        })
    }

    fn parse_body(query: &str, body: &str) -> Result<SearchResponse, SearchError> {
        let parsed: FirecrawlResponse =
            serde_json::from_str(body).map_err(|e| SearchError::ResponseParse {
                message: format!("Invalid search response: {e}"),
            })?;
        if !parsed.success {
            return Err(SearchError::Unsuccessful {
                query: query.to_string(),
            });
        }
        Ok(SearchResponse {
            items: parsed.data.into_iter().map(SourceItem::from).collect(),
            success: true,
        })
    }
}

#[async_trait]
impl SearchProvider for FirecrawlSearchProvider {
    async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let limit = options.limit.unwrap_or(DEFAULT_LIMIT);
        let url = format!("{}/search", self.base_url);
        let body = json!({
            "query": query,
            "limit": limit,
            "timeout": timeout.as_millis() as u64,
            "scrapeOptions": { "formats": ["markdown"] },
        });

        debug!(url = %url, query, limit, "Sending search request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                } else {
                    SearchError::Request {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| SearchError::Request {
            message: format!("Failed to read response body: {e}"),
        })?;

        match status.as_u16() {
            200..=299 => Self::parse_body(query, &text),
            401 | 403 => Err(SearchError::AuthFailed {
                provider: "firecrawl".to_string(),
            }),
            code => Err(SearchError::Http {
                status: code,
                body: text,
            }),
        }
    }

    fn name(&self) -> &str {
        "firecrawl"
    }
}

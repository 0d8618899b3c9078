//! Core data types shared by the research engine and provider clients.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single query planned for one depth level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The text sent to the search capability.
    pub query: String,
    /// What the planner hopes this query answers. Feeds follow-up directions.
    #[serde(default)]
    pub research_goal: String,
    /// Maximum number of results to request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Per-call timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            research_goal: String::new(),
            limit: None,
            timeout: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.research_goal = goal.into();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Options to hand to the search capability for this query.
    pub fn options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.limit,
            timeout: self.timeout,
        }
    }
}

/// Per-call options for the search capability.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub timeout: Option<Duration>,
}

/// One result returned by the search capability.
///
/// Treated as an opaque payload: the engine only truncates `content`
/// when building evaluation prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

impl SourceItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Raw reply from the search capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<SourceItem>,
    pub success: bool,
}

/// Token usage statistics from a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// The evaluator's verdict on one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityAssessment {
    /// Reliability score in `[0.0, 1.0]`.
    pub score: f64,
    pub reasoning: String,
    /// Whether the source should contribute learnings.
    pub should_use: bool,
    /// Set only when source preferences were supplied and this source breaks them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_violation: Option<String>,
    /// Host of the source URL; empty when the URL could not be parsed.
    pub domain: String,
}

impl ReliabilityAssessment {
    /// The verdict recorded for a source whose evaluation failed.
    pub fn unusable(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            reasoning: reason.into(),
            should_use: false,
            preference_violation: None,
            domain: domain.into(),
        }
    }
}

/// One retained finding, weighted by the reliability of its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub text: String,
    pub reliability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// A follow-up question to explore at the next depth level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchDirection {
    pub question: String,
    /// 1 = highest.
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_goal: Option<String>,
}

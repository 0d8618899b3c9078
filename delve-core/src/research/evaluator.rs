//! Source reliability evaluation.

use super::prompts::{self, RELIABILITY_SCHEMA};
use crate::cache::{ResultCache, cache_key, content_hash};
use crate::error::ModelError;
use crate::providers::{ModelProvider, StructuredRequest};
use crate::types::{ReliabilityAssessment, SourceItem, TokenUsage};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationReply {
    score: f64,
    #[serde(default)]
    reasoning: String,
    should_use: bool,
    #[serde(default)]
    preference_violation: Option<String>,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub assessment: ReliabilityAssessment,
    /// Tokens spent; zero on a cache hit.
    pub usage: TokenUsage,
    pub cached: bool,
}

/// Scores one source against a query through the model capability.
///
/// Results are cached per (query, url, preferences, content); a live entry
/// answers without calling the model. Failures are returned, never cached.
pub struct ReliabilityEvaluator {
    model: Arc<dyn ModelProvider>,
    cache: Arc<ResultCache>,
    max_content_chars: usize,
    ttl: Duration,
}

impl ReliabilityEvaluator {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        cache: Arc<ResultCache>,
        max_content_chars: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            model,
            cache,
            max_content_chars,
            ttl,
        }
    }

    pub async fn evaluate(
        &self,
        item: &SourceItem,
        query: &str,
        preferences: Option<&str>,
    ) -> Result<Evaluation, ModelError> {
        let url = item.url.as_deref().unwrap_or_default();
        let domain = resolve_domain(url);
        let content = truncate_chars(
            item.content.as_deref().unwrap_or_default(),
            self.max_content_chars,
        );

        let key = cache_key(
            "eval",
            &[query, url, preferences.unwrap_or_default(), &content_hash(content)],
        );
        if let Some(assessment) = self.cache.get::<ReliabilityAssessment>(&key).await {
            debug!(url, score = assessment.score, "reliability cache hit");
            return Ok(Evaluation {
                assessment,
                usage: TokenUsage::default(),
                cached: true,
            });
        }

        let request = StructuredRequest {
            system_prompt: prompts::system_prompt(),
            user_prompt: prompts::evaluation_prompt(query, item, &domain, content, preferences),
            schema_name: RELIABILITY_SCHEMA.to_string(),
            schema: prompts::reliability_schema(preferences.is_some()),
            timeout: None,
        };
        let response = self.model.generate_structured(request).await?;
        let reply: EvaluationReply = response.parse(RELIABILITY_SCHEMA)?;

        let preference_violation = preferences
            .and(reply.preference_violation)
            .filter(|reason| !reason.trim().is_empty());
        let assessment = ReliabilityAssessment {
            score: if reply.score.is_finite() {
                reply.score.clamp(0.0, 1.0)
            } else {
                0.0
            },
            reasoning: reply.reasoning,
            should_use: reply.should_use,
            preference_violation,
            domain,
        };
        debug!(
            url,
            score = assessment.score,
            use_source = assessment.should_use,
            "source evaluated"
        );

        self.cache.set(&key, &assessment, self.ttl).await;
        Ok(Evaluation {
            assessment,
            usage: response.usage,
            cached: false,
        })
    }
}

/// Host of `url`, or an empty string when it cannot be parsed.
pub fn resolve_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// The first `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockModelProvider;
    use serde_json::json;

    fn evaluator(model: Arc<MockModelProvider>) -> ReliabilityEvaluator {
        ReliabilityEvaluator::new(
            model,
            Arc::new(ResultCache::in_memory()),
            20,
            Duration::from_secs(300),
        )
    }

    fn scoring_model(score: f64) -> Arc<MockModelProvider> {
        Arc::new(MockModelProvider::new(move |_| {
            Ok(json!({
                "score": score,
                "reasoning": "well known publisher",
                "shouldUse": score >= 0.5,
                "preferenceViolation": "ignored without preferences"
            }))
        }))
    }

    #[test]
    fn test_resolve_domain() {
        assert_eq!(resolve_domain("https://docs.rs/tokio/latest"), "docs.rs");
        assert_eq!(resolve_domain("not a url"), "");
        assert_eq!(resolve_domain(""), "");
    }

    #[test]
    fn test_truncate_chars_is_boundary_safe() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[tokio::test]
    async fn test_evaluate_maps_reply() {
        let model = scoring_model(0.9);
        let eval = evaluator(model.clone());
        let item = SourceItem::new("https://www.rust-lang.org/blog").with_content("x".repeat(100));

        let result = eval.evaluate(&item, "rust editions", None).await.unwrap();
        assert!(!result.cached);
        assert_eq!(result.assessment.domain, "www.rust-lang.org");
        assert!(result.assessment.should_use);
        assert!(result.assessment.preference_violation.is_none());
        assert_eq!(result.usage.total(), 150);
        assert_eq!(model.calls_for(RELIABILITY_SCHEMA), 1);
    }

    #[tokio::test]
    async fn test_evaluate_cache_hit_skips_model() {
        let model = scoring_model(0.42);
        let eval = evaluator(model.clone());
        let item = SourceItem::new("https://a.dev").with_content("body");

        let first = eval.evaluate(&item, "q", None).await.unwrap();
        let second = eval.evaluate(&item, "q", None).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.assessment, second.assessment);
        assert_eq!(second.usage, TokenUsage::default());
        assert_eq!(model.calls_for(RELIABILITY_SCHEMA), 1);

        // A different query is a different key.
        eval.evaluate(&item, "other", None).await.unwrap();
        assert_eq!(model.calls_for(RELIABILITY_SCHEMA), 2);
    }

    #[tokio::test]
    async fn test_content_beyond_limit_does_not_change_key() {
        let model = scoring_model(0.7);
        let eval = evaluator(model.clone());
        let base = "a".repeat(20);
        let a = SourceItem::new("https://a.dev").with_content(format!("{base}tail one"));
        let b = SourceItem::new("https://a.dev").with_content(format!("{base}tail two"));

        eval.evaluate(&a, "q", None).await.unwrap();
        assert!(eval.evaluate(&b, "q", None).await.unwrap().cached);
        assert_eq!(model.calls_for(RELIABILITY_SCHEMA), 1);
    }

    #[tokio::test]
    async fn test_preferences_request_violation_field() {
        let model = Arc::new(MockModelProvider::new(|req| {
            assert!(req.schema["properties"].get("preferenceViolation").is_some());
            assert!(req.user_prompt.contains("<preferences>no blogs</preferences>"));
            Ok(json!({
                "score": 1.7,
                "reasoning": "personal blog",
                "shouldUse": false,
                "preferenceViolation": "source is a blog"
            }))
        }));
        let eval = evaluator(model);
        let item = SourceItem::new("https://someone.blog/post");
        let result = eval
            .evaluate(&item, "q", Some("no blogs"))
            .await
            .unwrap();
        assert_eq!(result.assessment.score, 1.0);
        assert_eq!(
            result.assessment.preference_violation.as_deref(),
            Some("source is a blog")
        );
    }

    #[tokio::test]
    async fn test_model_failure_is_returned_and_not_cached() {
        let model = Arc::new(MockModelProvider::new(|_| {
            Err(ModelError::Timeout { timeout_secs: 60 })
        }));
        let eval = evaluator(model.clone());
        let item = SourceItem::new("https://a.dev");
        assert!(matches!(
            eval.evaluate(&item, "q", None).await,
            Err(ModelError::Timeout { .. })
        ));
        assert!(eval.evaluate(&item, "q", None).await.is_err());
        assert_eq!(model.calls_for(RELIABILITY_SCHEMA), 2);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_schema_mismatch() {
        let model = Arc::new(MockModelProvider::new(|_| Ok(json!({ "verdict": "yes" }))));
        let eval = evaluator(model);
        let err = eval
            .evaluate(&SourceItem::new("https://a.dev"), "q", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::SchemaMismatch { .. }));
    }
}

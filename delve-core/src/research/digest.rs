//! Learning extraction from accepted sources.

use super::evaluator::truncate_chars;
use super::prompts::{self, DIGEST_SCHEMA, DigestSource, MAX_FOLLOW_UPS};
use crate::error::ModelError;
use crate::providers::{ModelProvider, StructuredRequest};
use crate::types::{Learning, ResearchDirection, SearchQuery, SourceItem, TokenUsage};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DigestReply {
    #[serde(default)]
    learnings: Vec<DigestLearning>,
    #[serde(default)]
    follow_up_questions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DigestLearning {
    text: String,
    source_url: String,
}

/// A source that passed evaluation, with the score it was given.
#[derive(Debug, Clone)]
pub struct AcceptedSource {
    pub item: SourceItem,
    pub url: String,
    pub score: f64,
}

/// Characters of source content kept in a fallback learning.
const FALLBACK_CHARS: usize = 280;

/// A learning for an accepted source the digest did not cover.
///
/// Built from the source's title and the start of its content, weighted by
/// the source's score.
pub fn fallback_learning(source: &AcceptedSource) -> Learning {
    let title = source.item.title.as_deref().map(str::trim).unwrap_or_default();
    let content = source.item.content.as_deref().map(str::trim).unwrap_or_default();
    let snippet = truncate_chars(content, FALLBACK_CHARS).trim_end();
    let text = match (title.is_empty(), snippet.is_empty()) {
        (false, false) => format!("{title}: {snippet}"),
        (false, true) => title.to_string(),
        (true, false) => snippet.to_string(),
        (true, true) => format!("Accepted source {}", source.url),
    };
    Learning {
        text,
        reliability: source.score,
        source_url: Some(source.url.clone()),
    }
}

/// What one query's accepted sources taught us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Digest {
    pub learnings: Vec<Learning>,
    pub directions: Vec<ResearchDirection>,
    pub usage: TokenUsage,
}

/// Turns accepted sources into weighted learnings and follow-up directions.
pub struct LearningDigester {
    model: Arc<dyn ModelProvider>,
    max_content_chars: usize,
}

impl LearningDigester {
    pub fn new(model: Arc<dyn ModelProvider>, max_content_chars: usize) -> Self {
        Self {
            model,
            max_content_chars,
        }
    }

    /// Extract learnings for `query` from `sources`.
    ///
    /// Only learnings attributed to one of `sources` survive, one per source,
    /// weighted by that source's score. Sources the reply leaves out get a
    /// [`fallback_learning`].
    pub async fn digest(
        &self,
        query: &SearchQuery,
        sources: &[AcceptedSource],
    ) -> Result<Digest, ModelError> {
        if sources.is_empty() {
            return Ok(Digest::default());
        }

        let budget = (self.max_content_chars / sources.len()).max(1);
        let prompt_sources: Vec<DigestSource<'_>> = sources
            .iter()
            .map(|s| DigestSource {
                url: &s.url,
                title: s.item.title.as_deref(),
                content: truncate_chars(s.item.content.as_deref().unwrap_or_default(), budget),
            })
            .collect();

        let request = StructuredRequest {
            system_prompt: prompts::system_prompt(),
            user_prompt: prompts::digest_prompt(
                &query.query,
                &query.research_goal,
                &prompt_sources,
            ),
            schema_name: DIGEST_SCHEMA.to_string(),
            schema: prompts::digest_schema(),
            timeout: None,
        };
        let response = self.model.generate_structured(request).await?;
        let reply: DigestReply = response.parse(DIGEST_SCHEMA)?;

        let mut used = HashSet::new();
        let mut dropped = 0usize;
        let mut learnings = Vec::new();
        for learning in reply.learnings {
            let text = learning.text.trim();
            let source = sources.iter().find(|s| s.url == learning.source_url.trim());
            match source {
                Some(source) if !text.is_empty() && used.insert(source.url.as_str()) => {
                    learnings.push(Learning {
                        text: text.to_string(),
                        reliability: source.score,
                        source_url: Some(source.url.clone()),
                    });
                }
                _ => dropped += 1,
            }
        }
        let uncovered: Vec<&AcceptedSource> = sources
            .iter()
            .filter(|s| !used.contains(s.url.as_str()))
            .collect();
        let fallbacks = uncovered.len();
        learnings.extend(uncovered.into_iter().map(fallback_learning));

        let parent_goal = (!query.research_goal.is_empty()).then(|| query.research_goal.clone());
        let directions: Vec<ResearchDirection> = reply
            .follow_up_questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(MAX_FOLLOW_UPS)
            .enumerate()
            .map(|(i, question)| ResearchDirection {
                question,
                priority: i as u32 + 1,
                parent_goal: parent_goal.clone(),
            })
            .collect();

        debug!(
            query = %query.query,
            learnings = learnings.len(),
            dropped,
            fallbacks,
            directions = directions.len(),
            "digested sources"
        );
        Ok(Digest {
            learnings,
            directions,
            usage: response.usage,
        })
    }
}

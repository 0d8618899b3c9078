//! Research results and the markdown report.

use super::session::StopReason;
use crate::budget::BudgetSummary;
use crate::types::{Learning, ResearchDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

/// Learnings with their reliability weights and the aggregate score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedLearnings {
    pub items: Vec<Learning>,
    /// Arithmetic mean of the item weights. `0.0` when there are no items,
    /// in which case it is a placeholder rather than a score.
    pub average_reliability: f64,
    pub sample_size: usize,
}

impl WeightedLearnings {
    pub fn new(items: Vec<Learning>) -> Self {
        let sample_size = items.len();
        let average_reliability = if sample_size == 0 {
            0.0
        } else {
            items.iter().map(|l| l.reliability).sum::<f64>() / sample_size as f64
        };
        Self {
            items,
            average_reliability,
            sample_size,
        }
    }

    /// Whether `average_reliability` is backed by at least one learning.
    pub fn has_average(&self) -> bool {
        self.sample_size > 0
    }
}

/// What is known about one considered source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    /// The planned query that surfaced this source.
    pub found_by: String,
    /// Depth remaining when the source was considered.
    pub depth: usize,
    pub reliability: f64,
    pub reasoning: String,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_violation: Option<String>,
    /// False when the evaluation call failed and the source was treated as unusable.
    pub evaluated: bool,
}

/// Counters that let a caller judge how complete a result is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchStats {
    pub levels_completed: usize,
    pub queries_planned: usize,
    pub queries_succeeded: usize,
    pub queries_failed: usize,
    pub sources_evaluated: usize,
    pub evaluation_failures: usize,
    /// Results skipped because their URL was already considered.
    pub duplicates_skipped: usize,
    /// Results skipped because they carried no URL.
    pub items_without_url: usize,
    pub digest_failures: usize,
    /// Searches and evaluations answered from the cache.
    pub cache_hits: usize,
    pub stop_reason: Option<StopReason>,
}

/// The outcome of one research session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub id: Uuid,
    pub query: String,
    pub depth: usize,
    pub breadth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<String>,
    /// Accepted learning texts, in the order they were found.
    pub learnings: Vec<String>,
    pub weighted_learnings: WeightedLearnings,
    /// Every URL considered, accepted or not, without duplicates.
    pub visited_urls: Vec<String>,
    pub source_metadata: Vec<SourceMetadata>,
    /// Follow-up directions produced along the way.
    pub directions: Vec<ResearchDirection>,
    pub budget: BudgetSummary,
    pub stats: ResearchStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ResearchResult {
    /// Render a markdown report.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# Research: {}\n\n", self.query);

        out.push_str("## Learnings\n\n");
        if self.weighted_learnings.items.is_empty() {
            out.push_str("_No learnings were retained._\n");
        }
        for (i, learning) in self.weighted_learnings.items.iter().enumerate() {
            let _ = write!(
                out,
                "{}. {} _(reliability {:.2}",
                i + 1,
                learning.text,
                learning.reliability
            );
            if let Some(url) = &learning.source_url {
                let _ = write!(out, ", <{url}>");
            }
            out.push_str(")_\n");
        }
        if self.weighted_learnings.has_average() {
            let _ = writeln!(
                out,
                "\nAverage reliability: {:.2} across {} learnings.",
                self.weighted_learnings.average_reliability, self.weighted_learnings.sample_size
            );
        }

        out.push_str("\n## Sources\n\n");
        for source in &self.source_metadata {
            let verdict = if !source.evaluated {
                "not evaluated"
            } else if source.used {
                "used"
            } else {
                "rejected"
            };
            let title = source.title.as_deref().unwrap_or(&source.url);
            let _ = write!(
                out,
                "- [{title}]({}) | {:.2} | {verdict}",
                source.url, source.reliability
            );
            if let Some(violation) = &source.preference_violation {
                let _ = write!(out, " | preference: {violation}");
            }
            out.push('\n');
        }

        if !self.directions.is_empty() {
            out.push_str("\n## Open directions\n\n");
            for direction in &self.directions {
                let _ = writeln!(out, "- {}", direction.question);
            }
        }

        let s = &self.stats;
        out.push_str("\n## Statistics\n\n");
        let _ = writeln!(out, "- Levels completed: {}", s.levels_completed);
        let _ = writeln!(
            out,
            "- Queries: {} planned, {} succeeded, {} failed",
            s.queries_planned, s.queries_succeeded, s.queries_failed
        );
        let _ = writeln!(
            out,
            "- Sources: {} evaluated, {} evaluation failures, {} duplicates skipped",
            s.sources_evaluated, s.evaluation_failures, s.duplicates_skipped
        );
        let _ = writeln!(out, "- Digest failures: {}", s.digest_failures);
        let _ = writeln!(out, "- Cache hits: {}", s.cache_hits);
        match self.budget.cap {
            Some(cap) => {
                let _ = writeln!(out, "- Tokens: {} of {cap}", self.budget.consumed);
            }
            None => {
                let _ = writeln!(out, "- Tokens: {}", self.budget.consumed);
            }
        }
        if let Some(reason) = s.stop_reason {
            let _ = writeln!(out, "- Stopped: {reason}");
        }
        out
    }

    /// Save the result as pretty JSON, atomically.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        crate::persistence::atomic_write_json(path, self)
    }

    /// Load a result saved with [`ResearchResult::save`].
    pub fn load(path: &Path) -> std::io::Result<Option<Self>> {
        crate::persistence::load_json(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn learning(text: &str, reliability: f64) -> Learning {
        Learning {
            text: text.to_string(),
            reliability,
            source_url: Some(format!("https://{text}.dev")),
        }
    }

    fn sample() -> ResearchResult {
        let now = Utc::now();
        ResearchResult {
            id: Uuid::new_v4(),
            query: "rust async runtimes".into(),
            depth: 2,
            breadth: 2,
            preferences: None,
            learnings: vec!["a".into(), "b".into()],
            weighted_learnings: WeightedLearnings::new(vec![
                learning("a", 0.9),
                learning("b", 0.5),
            ]),
            visited_urls: vec!["https://a.dev".into(), "https://b.dev".into()],
            source_metadata: vec![SourceMetadata {
                url: "https://a.dev".into(),
                title: Some("A".into()),
                domain: "a.dev".into(),
                published_date: None,
                found_by: "q".into(),
                depth: 2,
                reliability: 0.9,
                reasoning: "good".into(),
                used: true,
                preference_violation: None,
                evaluated: true,
            }],
            directions: vec![],
            budget: BudgetSummary {
                consumed: 420,
                cap: Some(1_000),
                remaining: Some(580),
                exceeded: false,
            },
            stats: ResearchStats {
                levels_completed: 2,
                stop_reason: Some(StopReason::DepthExhausted),
                ..Default::default()
            },
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_weighted_average() {
        let weighted = WeightedLearnings::new(vec![learning("a", 0.9), learning("b", 0.5)]);
        assert!((weighted.average_reliability - 0.7).abs() < 1e-9);
        assert_eq!(weighted.sample_size, 2);
        assert!(weighted.has_average());
    }

    #[test]
    fn test_empty_average_is_zero_not_nan() {
        let weighted = WeightedLearnings::new(Vec::new());
        assert_eq!(weighted.average_reliability, 0.0);
        assert!(!weighted.has_average());
    }

    #[test]
    fn test_markdown_report() {
        let md = sample().to_markdown();
        assert!(md.starts_with("# Research: rust async runtimes"));
        assert!(md.contains("1. a _(reliability 0.90, <https://a.dev.dev>)_"));
        assert!(md.contains("Average reliability: 0.70 across 2 learnings."));
        assert!(md.contains("- [A](https://a.dev) | 0.90 | used"));
        assert!(md.contains("- Tokens: 420 of 1000"));
        assert!(md.contains("- Stopped: depth exhausted"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("result.json");
        let result = sample();
        result.save(&path).unwrap();
        let loaded = ResearchResult::load(&path).unwrap().unwrap();
        assert_eq!(loaded.id, result.id);
        assert_eq!(loaded.weighted_learnings, result.weighted_learnings);
        assert_eq!(loaded.stats, result.stats);
    }
}

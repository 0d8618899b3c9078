//! Query planning.

use super::context::{ResearchContext, normalize_query};
use super::prompts::{self, PLANNING_SCHEMA};
use crate::error::ModelError;
use crate::providers::{ModelProvider, StructuredRequest};
use crate::types::{SearchQuery, TokenUsage};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct PlanningReply {
    #[serde(default)]
    queries: Vec<PlannedQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannedQuery {
    query: String,
    #[serde(default)]
    research_goal: String,
}

/// The queries planned for one level.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub queries: Vec<SearchQuery>,
    pub usage: TokenUsage,
}

/// Asks the model for the next level's search queries.
pub struct QueryPlanner {
    model: Arc<dyn ModelProvider>,
    result_limit: usize,
}

impl QueryPlanner {
    pub fn new(model: Arc<dyn ModelProvider>, result_limit: usize) -> Self {
        Self {
            model,
            result_limit,
        }
    }

    /// Plan at most `breadth` queries that were not issued before.
    ///
    /// Blank replies, repeats within the reply and queries already issued in
    /// this session are dropped. An empty plan means nothing is left to explore.
    pub async fn plan(
        &self,
        context: &ResearchContext,
        breadth: usize,
    ) -> Result<Plan, ModelError> {
        let request = StructuredRequest {
            system_prompt: prompts::system_prompt(),
            user_prompt: prompts::planning_prompt(context, breadth),
            schema_name: PLANNING_SCHEMA.to_string(),
            schema: prompts::planning_schema(breadth),
            timeout: None,
        };
        let response = self.model.generate_structured(request).await?;
        let reply: PlanningReply = response.parse(PLANNING_SCHEMA)?;
        let proposed = reply.queries.len();

        let mut seen = HashSet::new();
        let queries: Vec<SearchQuery> = reply
            .queries
            .into_iter()
            .filter_map(|planned| {
                let text = planned.query.trim();
                if text.is_empty() || context.has_issued(text) {
                    return None;
                }
                if !seen.insert(normalize_query(text)) {
                    return None;
                }
                Some(
                    SearchQuery::new(text)
                        .with_goal(planned.research_goal.trim())
                        .with_limit(self.result_limit),
                )
            })
            .take(breadth)
            .collect();

        debug!(
            proposed,
            accepted = queries.len(),
            breadth,
            "planned search queries"
        );
        Ok(Plan {
            queries,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockModelProvider;
    use serde_json::json;

    fn planner_replying(reply: serde_json::Value) -> QueryPlanner {
        let model = Arc::new(MockModelProvider::new(move |_| Ok(reply.clone())));
        QueryPlanner::new(model, 5)
    }

    #[tokio::test]
    async fn test_plan_truncates_to_breadth() {
        let planner = planner_replying(json!({
            "queries": [
                { "query": "a", "researchGoal": "ga" },
                { "query": "b", "researchGoal": "gb" },
                { "query": "c", "researchGoal": "gc" }
            ]
        }));
        let plan = planner
            .plan(&ResearchContext::new("topic", None), 2)
            .await
            .unwrap();
        assert_eq!(plan.queries.len(), 2);
        assert_eq!(plan.queries[0].query, "a");
        assert_eq!(plan.queries[0].research_goal, "ga");
        assert_eq!(plan.queries[1].limit, Some(5));
        assert_eq!(plan.usage.total(), 150);
    }

    #[tokio::test]
    async fn test_plan_drops_issued_and_repeated_queries() {
        let planner = planner_replying(json!({
            "queries": [
                { "query": "Rust Async", "researchGoal": "" },
                { "query": "rust   async", "researchGoal": "" },
                { "query": "  ", "researchGoal": "" },
                { "query": "tokio internals", "researchGoal": "" },
                { "query": "Tokio Internals", "researchGoal": "" }
            ]
        }));
        let mut ctx = ResearchContext::new("topic", None);
        ctx.record_issued("rust async");
        let plan = planner.plan(&ctx, 5).await.unwrap();
        let texts: Vec<&str> = plan.queries.iter().map(|q| q.query.as_str()).collect();
        assert_eq!(texts, vec!["tokio internals"]);
    }

    #[tokio::test]
    async fn test_plan_empty_reply() {
        let planner = planner_replying(json!({ "queries": [] }));
        let plan = planner
            .plan(&ResearchContext::new("topic", None), 3)
            .await
            .unwrap();
        assert!(plan.queries.is_empty());
    }

    #[tokio::test]
    async fn test_plan_failure_is_typed() {
        let model = Arc::new(MockModelProvider::new(|_| {
            Err(ModelError::RateLimited {
                retry_after_secs: 1,
            })
        }));
        let planner = QueryPlanner::new(model, 5);
        let err = planner
            .plan(&ResearchContext::new("topic", None), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::RateLimited { .. }));
    }
}

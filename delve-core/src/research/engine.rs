//! Research engine: the recursion controller.
//!
//! One session walks `Start -> Planning(d) -> Dispatching(d) -> Evaluating(d)
//! -> Merged(d)` for `d = depth, depth - 1, ..., 1`, stopping early when the
//! budget is exceeded or the planner has nothing new to search. Levels run
//! strictly one after another; the work inside a level runs concurrently and
//! the level waits for all of it before merging.

use super::context::ResearchContext;
use super::digest::{AcceptedSource, Digest, LearningDigester, fallback_learning};
use super::evaluator::{Evaluation, ReliabilityEvaluator, resolve_domain};
use super::output::{ResearchResult, ResearchStats, SourceMetadata, WeightedLearnings};
use super::planner::QueryPlanner;
use super::session::{NoOpResearchCallback, ResearchCallback, ResearchPhase, StopReason};
use crate::budget::BudgetAccountant;
use crate::cache::{ResultCache, cache_key};
use crate::config::{CacheConfig, DelveConfig, ResearchConfig};
use crate::dispatcher::SearchDispatcher;
use crate::error::{ModelError, SearchError, ValidationError};
use crate::providers::{ModelProvider, SearchProvider};
use crate::types::{ReliabilityAssessment, SearchQuery, SearchResponse, SourceItem};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A search result that survived deduplication and awaits evaluation.
struct Candidate {
    query_index: usize,
    url: String,
    item: SourceItem,
}

/// Everything one level produced, before it is merged into the context.
struct LevelOutcome {
    evaluated: Vec<(Candidate, Result<Evaluation, ModelError>)>,
    /// Per planned query: its accepted sources and the digest of them.
    digests: Vec<(Vec<AcceptedSource>, Result<Digest, ModelError>)>,
}

/// Drives research sessions over injected model, search and cache handles.
///
/// The dispatcher and cache are long-lived and may be shared across engines
/// and sessions; everything else about a session lives inside
/// [`ResearchEngine::conduct_research`].
pub struct ResearchEngine {
    config: ResearchConfig,
    search_ttl: Duration,
    dispatcher: Arc<SearchDispatcher>,
    cache: Arc<ResultCache>,
    planner: QueryPlanner,
    evaluator: ReliabilityEvaluator,
    digester: LearningDigester,
    callback: Arc<dyn ResearchCallback>,
}

impl ResearchEngine {
    pub fn new(
        config: ResearchConfig,
        cache_config: &CacheConfig,
        model: Arc<dyn ModelProvider>,
        dispatcher: Arc<SearchDispatcher>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            planner: QueryPlanner::new(model.clone(), config.search_result_limit),
            evaluator: ReliabilityEvaluator::new(
                model.clone(),
                cache.clone(),
                config.max_content_chars,
                cache_config.evaluation_ttl(),
            ),
            digester: LearningDigester::new(model, config.max_content_chars),
            search_ttl: cache_config.search_ttl(),
            config,
            dispatcher,
            cache,
            callback: Arc::new(NoOpResearchCallback),
        }
    }

    /// Build an engine, its dispatcher and its cache from configuration.
    pub fn from_config(
        config: &DelveConfig,
        model: Arc<dyn ModelProvider>,
        search: Arc<dyn SearchProvider>,
    ) -> crate::error::Result<Self> {
        let cache = Arc::new(ResultCache::from_config(&config.cache)?);
        let dispatcher = Arc::new(SearchDispatcher::new(search, &config.dispatcher));
        Ok(Self::new(
            config.research.clone(),
            &config.cache,
            model,
            dispatcher,
            cache,
        ))
    }

    /// Report progress to `callback`.
    pub fn with_callback(mut self, callback: Arc<dyn ResearchCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn dispatcher(&self) -> &Arc<SearchDispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Run one research session.
    ///
    /// Only invalid input is an error, and it is raised before any external
    /// call. Search, evaluation, digest and planning failures are counted in
    /// the result's stats and whatever was gathered is returned.
    pub async fn conduct_research(
        &self,
        query: &str,
        depth: usize,
        breadth: usize,
        budget_cap: Option<u64>,
        preferences: Option<&str>,
    ) -> Result<ResearchResult, ValidationError> {
        self.config.validate_request(query, depth, breadth)?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let query = query.trim();
        let preferences = preferences
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let budget = BudgetAccountant::new(budget_cap.or(self.config.default_token_budget));
        let mut context = ResearchContext::new(query, preferences.clone());
        let mut stats = ResearchStats::default();
        let mut sources: Vec<SourceMetadata> = Vec::new();

        info!(
            session = %id,
            query,
            depth,
            breadth,
            cap = ?budget.cap(),
            "research session started"
        );
        self.enter(ResearchPhase::Start);

        let mut level_depth = depth;
        let mut level_breadth = breadth;
        let stop_reason = loop {
            self.enter(ResearchPhase::Planning { depth: level_depth });
            self.callback.on_level_start(level_depth, level_breadth);

            let plan = match self.planner.plan(&context, level_breadth).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(
                        depth = level_depth,
                        error = %e,
                        "planning failed, returning partial results"
                    );
                    break StopReason::PlanningFailed;
                }
            };
            budget.charge_usage(&plan.usage);
            if plan.queries.is_empty() {
                break StopReason::NoNewQueries;
            }
            stats.queries_planned += plan.queries.len();
            for planned in &plan.queries {
                context.record_issued(&planned.query);
            }
            info!(
                depth = level_depth,
                queries = plan.queries.len(),
                "level planned"
            );

            self.enter(ResearchPhase::Dispatching { depth: level_depth });
            let responses = self.dispatch(&plan.queries, &mut stats).await;

            self.enter(ResearchPhase::Evaluating { depth: level_depth });
            let candidates = collect_candidates(&context, responses, &mut stats);
            let outcome = self
                .evaluate_level(&plan.queries, candidates, preferences.as_deref(), &budget)
                .await;

            self.enter(ResearchPhase::Merged { depth: level_depth });
            self.merge_level(
                &mut context,
                &mut sources,
                &mut stats,
                &plan.queries,
                outcome,
                level_depth,
            );
            stats.levels_completed += 1;
            self.callback.on_level_merged(
                level_depth,
                context.learnings().len(),
                budget.consumed(),
            );
            info!(
                depth = level_depth,
                learnings = context.learnings().len(),
                visited = context.visited_urls().len(),
                budget_used = budget.consumed(),
                "level merged"
            );

            if budget.is_exceeded() {
                break StopReason::BudgetExceeded;
            }
            level_depth -= 1;
            if level_depth == 0 {
                break StopReason::DepthExhausted;
            }
            if self.config.breadth_decay {
                level_breadth = level_breadth.div_ceil(2);
            }
        };

        stats.stop_reason = Some(stop_reason);
        self.enter(ResearchPhase::Done);
        info!(
            session = %id,
            stop_reason = %stop_reason,
            levels = stats.levels_completed,
            learnings = context.learnings().len(),
            queries_failed = stats.queries_failed,
            evaluation_failures = stats.evaluation_failures,
            "research session finished"
        );

        let learnings = context.learnings().to_vec();
        Ok(ResearchResult {
            id,
            query: query.to_string(),
            depth,
            breadth,
            preferences,
            learnings: learnings.iter().map(|l| l.text.clone()).collect(),
            weighted_learnings: WeightedLearnings::new(learnings),
            visited_urls: context.visited_urls().to_vec(),
            source_metadata: sources,
            directions: context.directions().to_vec(),
            budget: budget.summary(),
            stats,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn enter(&self, phase: ResearchPhase) {
        debug!(%phase, "research phase");
        self.callback.on_phase_change(&phase);
    }

    /// Search every planned query concurrently and wait for all of them.
    async fn dispatch(
        &self,
        queries: &[SearchQuery],
        stats: &mut ResearchStats,
    ) -> Vec<Option<SearchResponse>> {
        let searches = queries.iter().map(|q| self.search(q));
        let results = futures::future::join_all(searches).await;

        queries
            .iter()
            .zip(results)
            .map(|(query, result)| match result {
                Ok((response, cached)) => {
                    stats.queries_succeeded += 1;
                    if cached {
                        stats.cache_hits += 1;
                    }
                    self.callback
                        .on_query_complete(&query.query, Some(response.items.len()));
                    Some(response)
                }
                Err(e) => {
                    stats.queries_failed += 1;
                    warn!(query = %query.query, error = %e, "search failed, query dropped");
                    self.callback.on_query_complete(&query.query, None);
                    None
                }
            })
            .collect()
    }

    /// One search, answered from the cache when possible.
    ///
    /// Failures are never cached.
    async fn search(&self, query: &SearchQuery) -> Result<(SearchResponse, bool), SearchError> {
        let limit = query.limit.unwrap_or(self.config.search_result_limit);
        let key = cache_key("search", &[&query.query, &limit.to_string()]);
        if let Some(response) = self.cache.get::<SearchResponse>(&key).await {
            debug!(query = %query.query, "search cache hit");
            return Ok((response, true));
        }

        let options = query.clone().with_limit(limit).options();
        let response = self.dispatcher.search(&query.query, options).await?;
        self.cache.set(&key, &response, self.search_ttl).await;
        Ok((response, false))
    }

    /// Score every candidate, then digest each query's accepted sources.
    async fn evaluate_level(
        &self,
        queries: &[SearchQuery],
        candidates: Vec<Candidate>,
        preferences: Option<&str>,
        budget: &BudgetAccountant,
    ) -> LevelOutcome {
        let concurrency = self.config.evaluation_concurrency.max(1);

        let evaluated: Vec<(Candidate, Result<Evaluation, ModelError>)> =
            futures::stream::iter(candidates)
                .map(|candidate| async move {
                    let query = &queries[candidate.query_index].query;
                    let result = self
                        .evaluator
                        .evaluate(&candidate.item, query, preferences)
                        .await;
                    if let Ok(evaluation) = &result {
                        budget.charge_usage(&evaluation.usage);
                    }
                    (candidate, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

        let mut accepted: Vec<Vec<AcceptedSource>> = vec![Vec::new(); queries.len()];
        for (candidate, result) in &evaluated {
            if let Ok(evaluation) = result
                && evaluation.assessment.should_use
            {
                accepted[candidate.query_index].push(AcceptedSource {
                    item: candidate.item.clone(),
                    url: candidate.url.clone(),
                    score: evaluation.assessment.score,
                });
            }
        }

        let digests: Vec<(Vec<AcceptedSource>, Result<Digest, ModelError>)> =
            futures::stream::iter(queries.iter().zip(accepted))
                .map(|(query, sources)| async move {
                    let result = self.digester.digest(query, &sources).await;
                    if let Ok(digest) = &result {
                        budget.charge_usage(&digest.usage);
                    }
                    (sources, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

        LevelOutcome { evaluated, digests }
    }

    fn merge_level(
        &self,
        context: &mut ResearchContext,
        sources: &mut Vec<SourceMetadata>,
        stats: &mut ResearchStats,
        queries: &[SearchQuery],
        outcome: LevelOutcome,
        depth: usize,
    ) {
        for (candidate, result) in outcome.evaluated {
            let (assessment, evaluated) = match result {
                Ok(evaluation) => {
                    stats.sources_evaluated += 1;
                    if evaluation.cached {
                        stats.cache_hits += 1;
                    }
                    (evaluation.assessment, true)
                }
                Err(e) => {
                    stats.evaluation_failures += 1;
                    warn!(
                        url = %candidate.url,
                        error = %e,
                        "evaluation failed, source treated as unusable"
                    );
                    let assessment = ReliabilityAssessment::unusable(
                        resolve_domain(&candidate.url),
                        format!("evaluation failed: {e}"),
                    );
                    (assessment, false)
                }
            };
            self.callback.on_source_evaluated(&candidate.url, &assessment);
            context.mark_visited(&candidate.url);
            sources.push(SourceMetadata {
                url: candidate.url,
                title: candidate.item.title,
                domain: assessment.domain,
                published_date: candidate.item.published_date,
                found_by: queries[candidate.query_index].query.clone(),
                depth,
                reliability: assessment.score,
                reasoning: assessment.reasoning,
                used: assessment.should_use,
                preference_violation: assessment.preference_violation,
                evaluated,
            });
        }

        let mut directions = Vec::new();
        for (query, (accepted, result)) in queries.iter().zip(outcome.digests) {
            match result {
                Ok(digest) => {
                    for learning in digest.learnings {
                        context.add_learning(learning);
                    }
                    directions.extend(digest.directions);
                }
                Err(e) => {
                    stats.digest_failures += 1;
                    warn!(
                        query = %query.query,
                        error = %e,
                        accepted = accepted.len(),
                        "digest failed, falling back to source summaries"
                    );
                    for source in &accepted {
                        context.add_learning(fallback_learning(source));
                    }
                }
            }
        }
        context.push_level_directions(directions);
    }
}

/// Flatten a level's responses into candidates, in query order then item
/// order, skipping items without a URL and URLs already considered.
fn collect_candidates(
    context: &ResearchContext,
    responses: Vec<Option<SearchResponse>>,
    stats: &mut ResearchStats,
) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (query_index, response) in responses.into_iter().enumerate() {
        let Some(response) = response else {
            continue;
        };
        for item in response.items {
            let Some(url) = item.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
                stats.items_without_url += 1;
                continue;
            };
            if context.is_visited(url) || !seen.insert(url.to_string()) {
                stats.duplicates_skipped += 1;
                continue;
            }
            candidates.push(Candidate {
                query_index,
                url: url.to_string(),
                item,
            });
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::providers::{MockModelProvider, MockSearchProvider};
    use crate::research::prompts::{DIGEST_SCHEMA, PLANNING_SCHEMA, RELIABILITY_SCHEMA};
    use crate::types::TokenUsage;
    use serde_json::json;
    use std::sync::Mutex;

    fn engine(model: Arc<MockModelProvider>, search: Arc<MockSearchProvider>) -> ResearchEngine {
        let dispatcher = Arc::new(SearchDispatcher::new(search, &DispatcherConfig::default()));
        ResearchEngine::new(
            ResearchConfig::default(),
            &CacheConfig::default(),
            model,
            dispatcher,
            Arc::new(ResultCache::in_memory()),
        )
    }

    /// Plans `queries` on the first call and nothing afterwards; accepts
    /// every source; one learning per source.
    fn scripted_model(queries: &'static [&'static str]) -> Arc<MockModelProvider> {
        let planned = Mutex::new(false);
        Arc::new(MockModelProvider::new(move |req| match req.schema_name.as_str() {
            PLANNING_SCHEMA => {
                let mut done = planned.lock().unwrap();
                let list: Vec<_> = if *done {
                    Vec::new()
                } else {
                    queries
                        .iter()
                        .map(|q| json!({ "query": q, "researchGoal": "" }))
                        .collect()
                };
                *done = true;
                Ok(json!({ "queries": list }))
            }
            RELIABILITY_SCHEMA => Ok(json!({
                "score": 0.8,
                "reasoning": "ok",
                "shouldUse": true
            })),
            DIGEST_SCHEMA => {
                let learnings: Vec<_> = req
                    .user_prompt
                    .split("url=\"")
                    .skip(1)
                    .filter_map(|s| s.split('"').next())
                    .map(|url| json!({ "text": format!("learned from {url}"), "sourceUrl": url }))
                    .collect();
                Ok(json!({ "learnings": learnings, "followUpQuestions": [] }))
            }
            _ => unreachable!(),
        }))
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_call() {
        let model = scripted_model(&["a"]);
        let search = Arc::new(MockSearchProvider::new());
        let engine = engine(model.clone(), search.clone());

        for (depth, breadth) in [(0, 2), (2, 0), (6, 2), (2, 6)] {
            assert!(
                engine
                    .conduct_research("topic", depth, breadth, None, None)
                    .await
                    .is_err()
            );
        }
        assert!(matches!(
            engine.conduct_research("   ", 1, 1, None, None).await,
            Err(ValidationError::EmptyQuery)
        ));
        assert_eq!(model.total_calls(), 0);
        assert_eq!(search.call_count(), 0);
    }

    #[tokio::test]
    async fn test_single_level_collects_learnings() {
        let model = scripted_model(&["q1"]);
        let search = Arc::new(MockSearchProvider::new().with_results(
            "q1",
            vec![
                SourceItem::new("https://a.dev").with_content("alpha"),
                SourceItem::new("https://b.dev").with_content("beta"),
                SourceItem::default().with_content("no url"),
            ],
        ));
        let engine = engine(model.clone(), search);

        let result = engine
            .conduct_research("topic", 1, 1, None, None)
            .await
            .unwrap();
        assert_eq!(result.visited_urls, vec!["https://a.dev", "https://b.dev"]);
        assert_eq!(result.learnings.len(), 2);
        assert_eq!(result.weighted_learnings.sample_size, 2);
        assert!((result.weighted_learnings.average_reliability - 0.8).abs() < 1e-9);
        assert_eq!(result.stats.items_without_url, 1);
        assert_eq!(result.stats.stop_reason, Some(StopReason::DepthExhausted));
        assert_eq!(model.calls_for(RELIABILITY_SCHEMA), 2);
        assert_eq!(model.calls_for(DIGEST_SCHEMA), 1);
    }

    #[tokio::test]
    async fn test_planner_with_nothing_new_stops_session() {
        let model = scripted_model(&["q1"]);
        let search = Arc::new(
            MockSearchProvider::new().with_results("q1", vec![SourceItem::new("https://a.dev")]),
        );
        let engine = engine(model.clone(), search);
        let result = engine
            .conduct_research("topic", 3, 2, None, None)
            .await
            .unwrap();
        assert_eq!(result.stats.levels_completed, 1);
        assert_eq!(result.stats.stop_reason, Some(StopReason::NoNewQueries));
        assert_eq!(model.calls_for(PLANNING_SCHEMA), 2);
    }

    #[tokio::test]
    async fn test_planning_failure_returns_partial_result() {
        let model = Arc::new(MockModelProvider::new(|_| {
            Err(ModelError::ApiRequest {
                message: "503".into(),
            })
        }));
        let engine = engine(model, Arc::new(MockSearchProvider::new()));
        let result = engine
            .conduct_research("topic", 2, 2, Some(1_000), None)
            .await
            .unwrap();
        assert_eq!(result.stats.stop_reason, Some(StopReason::PlanningFailed));
        assert!(result.learnings.is_empty());
        assert_eq!(result.weighted_learnings.average_reliability, 0.0);
        assert_eq!(result.budget.consumed, 0);
    }

    #[tokio::test]
    async fn test_budget_is_charged_for_every_model_call() {
        let model = Arc::new(
            MockModelProvider::new(|req| match req.schema_name.as_str() {
                PLANNING_SCHEMA => {
                    Ok(json!({ "queries": [{ "query": "q", "researchGoal": "" }] }))
                }
                RELIABILITY_SCHEMA => {
                    Ok(json!({ "score": 0.5, "reasoning": "", "shouldUse": true }))
                }
                _ => Ok(json!({ "learnings": [], "followUpQuestions": [] })),
            })
            .with_usage(PLANNING_SCHEMA, TokenUsage::new(5, 5))
            .with_usage(RELIABILITY_SCHEMA, TokenUsage::new(3, 2))
            .with_usage(DIGEST_SCHEMA, TokenUsage::new(1, 1)),
        );
        let search = Arc::new(MockSearchProvider::new().with_results(
            "q",
            vec![SourceItem::new("https://a.dev"), SourceItem::new("https://b.dev")],
        ));
        let engine = engine(model, search);
        let result = engine
            .conduct_research("topic", 1, 1, None, None)
            .await
            .unwrap();
        // plan 10 + two evaluations of 5 + one digest of 2
        assert_eq!(result.budget.consumed, 22);
        assert!(!result.budget.exceeded);
        assert!(result.budget.cap.is_none());
    }

    #[test]
    fn test_collect_candidates_dedups_in_order() {
        let mut context = ResearchContext::new("topic", None);
        context.mark_visited("https://old.dev");
        let mut stats = ResearchStats::default();
        let responses = vec![
            Some(SearchResponse {
                items: vec![SourceItem::new("https://a.dev"), SourceItem::new("https://old.dev")],
                success: true,
            }),
            None,
            Some(SearchResponse {
                items: vec![SourceItem::new("https://a.dev"), SourceItem::new(" https://c.dev ")],
                success: true,
            }),
        ];
        let candidates = collect_candidates(&context, responses, &mut stats);
        let urls: Vec<(usize, &str)> = candidates
            .iter()
            .map(|c| (c.query_index, c.url.as_str()))
            .collect();
        assert_eq!(urls, vec![(0, "https://a.dev"), (2, "https://c.dev")]);
        assert_eq!(stats.duplicates_skipped, 2);
    }
}

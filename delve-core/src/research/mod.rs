//! Recursive research over the search and model capabilities.
//!
//! Each depth level runs four steps:
//! 1. **Plan**: ask the model for up to `breadth` new search queries
//! 2. **Dispatch**: run them concurrently through the search dispatcher
//! 3. **Evaluate**: score every new source, then digest accepted ones into learnings
//! 4. **Merge**: fold learnings, visited URLs and follow-up directions into the context
//!
//! The engine then recurses with the merged context until the depth, the
//! budget, or the planner's ideas run out.

pub mod context;
pub mod digest;
pub mod engine;
pub mod evaluator;
pub mod output;
pub mod planner;
pub mod prompts;
pub mod session;

pub use context::ResearchContext;
pub use engine::ResearchEngine;
pub use evaluator::ReliabilityEvaluator;
pub use output::{ResearchResult, ResearchStats, SourceMetadata, WeightedLearnings};
pub use planner::QueryPlanner;
pub use session::{NoOpResearchCallback, ResearchCallback, ResearchPhase, StopReason};

//! # Delve Core
//!
//! Core library for the Delve research engine.
//! Provides the recursive research controller, the adaptive search
//! dispatcher, reliability evaluation, the tiered result cache, budget
//! accounting, configuration, and the model/search provider clients.

pub mod budget;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod persistence;
pub mod providers;
pub mod research;
pub mod types;

// Re-export commonly used types at the crate root.
pub use budget::{BudgetAccountant, BudgetSummary, ChargeOutcome, Remaining};
pub use cache::{CacheTier, MemoryTier, ResultCache, SqliteTier, TieredCache};
pub use config::{DelveConfig, load_config};
pub use dispatcher::{ConcurrencyController, ConcurrencyState, SearchDispatcher};
pub use error::{
    CacheError, ConfigError, DelveError, ModelError, Result, SearchError, ValidationError,
};
pub use providers::{ModelProvider, SearchProvider};
pub use research::{
    NoOpResearchCallback, ResearchCallback, ResearchEngine, ResearchPhase, ResearchResult,
    StopReason,
};
pub use types::{
    Learning, ReliabilityAssessment, ResearchDirection, SearchOptions, SearchQuery,
    SearchResponse, SourceItem, TokenUsage,
};

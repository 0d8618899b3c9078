//! Recursion controller states and progress reporting.

use crate::types::ReliabilityAssessment;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current state of a research session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum ResearchPhase {
    /// Context and budget initialized.
    Start,
    /// Asking the planner for this level's queries.
    Planning { depth: usize },
    /// Searches for this level are in flight.
    Dispatching { depth: usize },
    /// Sources for this level are being scored and digested.
    Evaluating { depth: usize },
    /// This level's results have been folded into the context.
    Merged { depth: usize },
    /// Terminal.
    Done,
}

impl ResearchPhase {
    /// Depth remaining at this phase, if it belongs to a level.
    pub fn depth(&self) -> Option<usize> {
        match self {
            Self::Planning { depth }
            | Self::Dispatching { depth }
            | Self::Evaluating { depth }
            | Self::Merged { depth } => Some(*depth),
            Self::Start | Self::Done => None,
        }
    }
}

impl fmt::Display for ResearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Planning { depth } => write!(f, "planning({depth})"),
            Self::Dispatching { depth } => write!(f, "dispatching({depth})"),
            Self::Evaluating { depth } => write!(f, "evaluating({depth})"),
            Self::Merged { depth } => write!(f, "merged({depth})"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Why a session stopped expanding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The token budget reached its cap. A normal termination, not a failure.
    BudgetExceeded,
    /// Every requested level ran.
    DepthExhausted,
    /// The planner had nothing new to search.
    NoNewQueries,
    /// The planner failed; the context gathered so far was returned.
    PlanningFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BudgetExceeded => "budget exceeded",
            Self::DepthExhausted => "depth exhausted",
            Self::NoNewQueries => "no new queries",
            Self::PlanningFailed => "planning failed",
        };
        f.write_str(text)
    }
}

/// Callback trait for progressive research UI updates.
pub trait ResearchCallback: Send + Sync {
    /// Called on every state transition.
    fn on_phase_change(&self, _phase: &ResearchPhase) {}
    /// Called when a level starts, with its remaining depth and breadth.
    fn on_level_start(&self, depth: usize, breadth: usize);
    /// Called when a query's search settles. `None` means it failed.
    fn on_query_complete(&self, query: &str, items_found: Option<usize>);
    /// Called after each source is scored.
    fn on_source_evaluated(&self, url: &str, assessment: &ReliabilityAssessment);
    /// Called after a level's results are merged.
    fn on_level_merged(&self, depth: usize, learnings_total: usize, budget_used: u64);
}

/// No-op callback for testing.
pub struct NoOpResearchCallback;

impl ResearchCallback for NoOpResearchCallback {
    fn on_level_start(&self, _depth: usize, _breadth: usize) {}
    fn on_query_complete(&self, _query: &str, _items_found: Option<usize>) {}
    fn on_source_evaluated(&self, _url: &str, _assessment: &ReliabilityAssessment) {}
    fn on_level_merged(&self, _depth: usize, _learnings_total: usize, _budget_used: u64) {}
}

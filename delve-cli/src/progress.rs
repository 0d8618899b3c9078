//! Progress lines printed to stderr while a session runs.

use delve_core::{ReliabilityAssessment, ResearchCallback};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Prints one line per level, per query and per merge.
///
/// Sources are only counted; printing each one drowns the useful lines.
#[derive(Default)]
pub struct ProgressPrinter {
    quiet: bool,
    sources: AtomicUsize,
    accepted: AtomicUsize,
}

impl ProgressPrinter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            ..Self::default()
        }
    }
}

impl ResearchCallback for ProgressPrinter {
    fn on_level_start(&self, depth: usize, breadth: usize) {
        if !self.quiet {
            eprintln!("  ▸ depth {depth}: planning up to {breadth} queries");
        }
    }

    fn on_query_complete(&self, query: &str, items_found: Option<usize>) {
        if self.quiet {
            return;
        }
        match items_found {
            Some(n) => eprintln!("    ✓ {query} ({n} results)"),
            None => eprintln!("    ✗ {query} (search failed)"),
        }
    }

    fn on_source_evaluated(&self, _url: &str, assessment: &ReliabilityAssessment) {
        self.sources.fetch_add(1, Ordering::Relaxed);
        if assessment.should_use {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_level_merged(&self, depth: usize, learnings_total: usize, budget_used: u64) {
        if !self.quiet {
            eprintln!(
                "  ■ depth {depth} merged: {}/{} sources accepted, {learnings_total} learnings, {budget_used} tokens",
                self.accepted.load(Ordering::Relaxed),
                self.sources.load(Ordering::Relaxed),
            );
        }
    }
}

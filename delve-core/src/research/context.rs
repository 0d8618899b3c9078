//! Accumulated state of one research session.

use crate::types::{Learning, ResearchDirection};
use serde::Serialize;
use std::collections::HashSet;

/// Everything a session has learned so far.
///
/// Owned by the recursion controller. Concurrent work within a level only
/// ever sees a shared borrow; the level's results are merged afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResearchContext {
    query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preferences: Option<String>,
    learnings: Vec<Learning>,
    visited_urls: Vec<String>,
    #[serde(skip)]
    visited: HashSet<String>,
    directions: Vec<ResearchDirection>,
    /// Index of the first direction produced by the latest level.
    #[serde(skip)]
    pending_from: usize,
    issued_queries: Vec<String>,
    #[serde(skip)]
    issued: HashSet<String>,
}

impl ResearchContext {
    pub fn new(query: impl Into<String>, preferences: Option<String>) -> Self {
        Self {
            query: query.into(),
            preferences,
            ..Default::default()
        }
    }

    /// The top-level question.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn preferences(&self) -> Option<&str> {
        self.preferences.as_deref()
    }

    pub fn learnings(&self) -> &[Learning] {
        &self.learnings
    }

    /// Visited URLs in first-visit order, without duplicates.
    pub fn visited_urls(&self) -> &[String] {
        &self.visited_urls
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.visited.contains(url)
    }

    /// Mark `url` as visited. Returns false if it already was.
    pub fn mark_visited(&mut self, url: &str) -> bool {
        if !self.visited.insert(url.to_string()) {
            return false;
        }
        self.visited_urls.push(url.to_string());
        true
    }

    pub fn add_learning(&mut self, learning: Learning) {
        self.learnings.push(learning);
    }

    /// Every direction recorded so far, oldest first.
    pub fn directions(&self) -> &[ResearchDirection] {
        &self.directions
    }

    /// Directions produced by the most recent level, not yet planned from.
    pub fn pending_directions(&self) -> &[ResearchDirection] {
        &self.directions[self.pending_from..]
    }

    /// Replace the pending batch with the directions found by a new level.
    pub fn push_level_directions(&mut self, mut directions: Vec<ResearchDirection>) {
        self.pending_from = self.directions.len();
        directions.sort_by_key(|d| d.priority);
        self.directions.extend(directions);
    }

    /// Queries already sent to the search capability, in order.
    pub fn issued_queries(&self) -> &[String] {
        &self.issued_queries
    }

    /// Case- and whitespace-insensitive check against issued queries.
    pub fn has_issued(&self, query: &str) -> bool {
        self.issued.contains(&normalize_query(query))
    }

    pub fn record_issued(&mut self, query: &str) {
        if self.issued.insert(normalize_query(query)) {
            self.issued_queries.push(query.to_string());
        }
    }
}

/// Lowercased, whitespace-collapsed form used for query deduplication.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

//! Token budget accounting for a research session.
//!
//! The accountant is shared by every concurrent evaluation and digest task in
//! a depth level, so charging is lock-free: one atomic add for the running
//! total and a sticky flag for the exceeded state.

use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Units left before the soft cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Unbounded,
    Units(u64),
}

/// Result of a single charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeOutcome {
    /// Running total after this charge was applied.
    pub total: u64,
    pub exceeded: bool,
}

/// Snapshot of budget usage reported with a research result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub consumed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<u64>,
    /// `None` when no cap was configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    pub exceeded: bool,
}

/// Tracks consumed units against an optional soft cap.
///
/// The total never decreases. Once the total reaches the cap, `exceeded`
/// stays true for the rest of the session.
#[derive(Debug)]
pub struct BudgetAccountant {
    cap: Option<u64>,
    consumed: AtomicU64,
    exceeded: AtomicBool,
}

impl BudgetAccountant {
    /// Create an accountant. `None` means unlimited.
    pub fn new(cap: Option<u64>) -> Self {
        Self {
            cap,
            consumed: AtomicU64::new(0),
            exceeded: AtomicBool::new(false),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Add `units` to the running total.
    pub fn charge(&self, units: u64) -> ChargeOutcome {
        let previous = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(units))
            })
            .unwrap_or_else(|current| current);
        let total = previous.saturating_add(units);

        if let Some(cap) = self.cap
            && total >= cap
        {
            self.exceeded.store(true, Ordering::Release);
        }

        ChargeOutcome {
            total,
            exceeded: self.is_exceeded(),
        }
    }

    /// Charge the total tokens of a model call.
    pub fn charge_usage(&self, usage: &TokenUsage) -> ChargeOutcome {
        self.charge(usage.total())
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn cap(&self) -> Option<u64> {
        self.cap
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> Remaining {
        match self.cap {
            None => Remaining::Unbounded,
            Some(cap) => Remaining::Units(cap.saturating_sub(self.consumed())),
        }
    }

    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            consumed: self.consumed(),
            cap: self.cap,
            remaining: match self.remaining() {
                Remaining::Unbounded => None,
                Remaining::Units(units) => Some(units),
            },
            exceeded: self.is_exceeded(),
        }
    }
}

impl Default for BudgetAccountant {
    fn default() -> Self {
        Self::unlimited()
    }
}

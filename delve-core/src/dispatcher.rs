//! Search dispatcher with adaptive concurrency.
//!
//! Every search goes through a counting gate whose size (the *ceiling*) is
//! tuned by a [`ConcurrencyController`]. Each call's latency and outcome is
//! recorded; once per adjustment interval, and only after enough fresh
//! samples, the controller moves the ceiling by at most one step:
//!
//! - error rate above 20%: shrink
//! - error rate below 5% and p95 latency under the low threshold: grow
//! - p95 latency over the high threshold: shrink
//! - anything else: hold
//!
//! The ceiling never leaves `[min_concurrency, max_concurrency]`. Callers
//! beyond the ceiling wait at the gate; there is no queue limit.

use crate::config::DispatcherConfig;
use crate::error::SearchError;
use crate::providers::SearchProvider;
use crate::types::{SearchOptions, SearchResponse};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ERROR_RATE_SHRINK: f64 = 0.20;
const ERROR_RATE_GROW: f64 = 0.05;

/// Direction of a ceiling change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    success: bool,
}

/// Point-in-time view of the controller, for logging and reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyState {
    pub ceiling: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Successes in the rolling window.
    pub successes: usize,
    /// Failures in the rolling window.
    pub errors: usize,
    pub p95_latency_ms: u64,
    /// Time since the ceiling was last evaluated.
    pub since_last_adjustment_ms: u64,
}

/// Additive-increase/additive-decrease ceiling controller.
///
/// Pure bookkeeping: the caller supplies the clock, so the rules can be
/// exercised without a runtime.
#[derive(Debug)]
pub struct ConcurrencyController {
    min: usize,
    max: usize,
    ceiling: usize,
    interval: Duration,
    min_samples: usize,
    low_latency: Duration,
    high_latency: Duration,
    window: usize,
    samples: VecDeque<Sample>,
    fresh_samples: usize,
    last_adjustment: Instant,
}

impl ConcurrencyController {
    pub fn new(config: &DispatcherConfig, now: Instant) -> Self {
        let min = config.min_concurrency.max(1);
        let max = config.max_concurrency.max(min);
        Self {
            min,
            max,
            ceiling: config.initial_concurrency.clamp(min, max),
            interval: config.adjustment_interval(),
            min_samples: config.min_samples.max(1),
            low_latency: Duration::from_millis(config.low_latency_ms),
            high_latency: Duration::from_millis(config.high_latency_ms),
            window: config.sample_window.max(1),
            samples: VecDeque::new(),
            fresh_samples: 0,
            last_adjustment: now,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    /// Record one call and apply the adjustment rule if it is due.
    ///
    /// Returns the change made to the ceiling, if any.
    pub fn record(
        &mut self,
        success: bool,
        latency: Duration,
        now: Instant,
    ) -> Option<Adjustment> {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { latency, success });
        self.fresh_samples += 1;

        if now.saturating_duration_since(self.last_adjustment) < self.interval
            || self.fresh_samples < self.min_samples
        {
            return None;
        }

        self.last_adjustment = now;
        self.fresh_samples = 0;
        let adjustment = self.decide();
        match adjustment {
            Some(Adjustment::Increase) => self.ceiling += 1,
            Some(Adjustment::Decrease) => self.ceiling -= 1,
            None => {}
        }
        if adjustment.is_some() {
            // Judge the new ceiling on its own traffic.
            self.samples.clear();
        }
        adjustment
    }

    fn decide(&self) -> Option<Adjustment> {
        let error_rate = self.error_rate();
        let p95 = self.p95_latency();
        if error_rate > ERROR_RATE_SHRINK {
            (self.ceiling > self.min).then_some(Adjustment::Decrease)
        } else if error_rate < ERROR_RATE_GROW && p95 < self.low_latency {
            (self.ceiling < self.max).then_some(Adjustment::Increase)
        } else if p95 > self.high_latency {
            (self.ceiling > self.min).then_some(Adjustment::Decrease)
        } else {
            None
        }
    }

    /// Fraction of failed calls in the rolling window; 0.0 when empty.
    pub fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|s| !s.success).count();
        errors as f64 / self.samples.len() as f64
    }

    /// 95th-percentile latency of the rolling window (nearest rank).
    pub fn p95_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut latencies: Vec<Duration> = self.samples.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        let rank = (latencies.len() * 95).div_ceil(100);
        latencies[rank.clamp(1, latencies.len()) - 1]
    }

    pub fn state(&self, now: Instant) -> ConcurrencyState {
        let errors = self.samples.iter().filter(|s| !s.success).count();
        ConcurrencyState {
            ceiling: self.ceiling,
            min_concurrency: self.min,
            max_concurrency: self.max,
            successes: self.samples.len() - errors,
            errors,
            p95_latency_ms: self.p95_latency().as_millis() as u64,
            since_last_adjustment_ms: now
                .saturating_duration_since(self.last_adjustment)
                .as_millis() as u64,
        }
    }
}

/// A counting gate whose size can shrink while permits are held.
///
/// Shrinking takes an idle permit out of circulation when one is free;
/// otherwise the debt is recorded and paid by the next permit returned.
struct Gate {
    semaphore: Arc<Semaphore>,
    pending_shrink: AtomicUsize,
}

impl Gate {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            pending_shrink: AtomicUsize::new(0),
        }
    }

    fn take_debt(&self) -> bool {
        self.pending_shrink
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn grow(&self) {
        if !self.take_debt() {
            self.semaphore.add_permits(1);
        }
    }

    fn shrink(&self) {
        match self.semaphore.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                self.pending_shrink.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

struct GatePermit {
    permit: Option<OwnedSemaphorePermit>,
    gate: Arc<Gate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take()
            && self.gate.take_debt()
        {
            permit.forget();
        }
    }
}

/// Wraps a [`SearchProvider`] with the adaptive gate and latency sampling.
///
/// Long-lived: one dispatcher is meant to serve many research sessions so
/// that the ceiling amortizes over them.
pub struct SearchDispatcher {
    provider: Arc<dyn SearchProvider>,
    gate: Arc<Gate>,
    controller: Mutex<ConcurrencyController>,
    default_timeout: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl SearchDispatcher {
    pub fn new(provider: Arc<dyn SearchProvider>, config: &DispatcherConfig) -> Self {
        let controller = ConcurrencyController::new(config, Instant::now());
        Self {
            provider,
            gate: Arc::new(Gate::new(controller.ceiling())),
            controller: Mutex::new(controller),
            default_timeout: config.search_timeout(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Run one query through the gate.
    ///
    /// The per-call timeout is handed to the provider; if the provider
    /// overruns it, the call is abandoned and reported as a timeout.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let options = SearchOptions {
            timeout: Some(timeout),
            ..options
        };

        let permit = self
            .gate
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SearchError::Request {
                message: "search dispatcher is closed".to_string(),
            })?;
        let _permit = GatePermit {
            permit: Some(permit),
            gate: self.gate.clone(),
        };

        let running = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::AcqRel);

        let started = Instant::now();
        let call = self.provider.search(query, options);
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SearchError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        };
        let latency = started.elapsed();
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        match &outcome {
            Ok(response) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    query,
                    provider = self.provider.name(),
                    items = response.items.len(),
                    latency_ms = latency.as_millis() as u64,
                    "search completed"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    query,
                    provider = self.provider.name(),
                    latency_ms = latency.as_millis() as u64,
                    error = %e,
                    "search failed"
                );
            }
        }
        self.record(outcome.is_ok(), latency);
        outcome
    }

    fn record(&self, success: bool, latency: Duration) {
        let now = Instant::now();
        let (adjustment, ceiling) = match self.controller.lock() {
            Ok(mut controller) => {
                let adjustment = controller.record(success, latency, now);
                (adjustment, controller.ceiling())
            }
            Err(_) => return,
        };
        if let Some(adjustment) = adjustment {
            match adjustment {
                Adjustment::Increase => self.gate.grow(),
                Adjustment::Decrease => self.gate.shrink(),
            }
            info!(ceiling, ?adjustment, "search concurrency adjusted");
        }
    }

    /// Current concurrency ceiling.
    pub fn ceiling(&self) -> usize {
        self.controller.lock().map(|c| c.ceiling()).unwrap_or(0)
    }

    /// Snapshot of the controller state.
    pub fn state(&self) -> Option<ConcurrencyState> {
        self.controller
            .lock()
            .ok()
            .map(|c| c.state(Instant::now()))
    }

    /// Highest number of simultaneous in-flight searches observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    /// Lifetime (succeeded, failed) call counts.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

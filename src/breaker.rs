//! Circuit breaker for fault isolation.
//!
//! Generic gate around asynchronous operations: once failure density exceeds
//! a threshold the breaker opens and fails fast instead of letting callers
//! hang on a broken dependency. After a cooldown a single probe is allowed
//! (half-open); consecutive probe successes close the circuit again.
//!
//! The breaker is owned by one connection driver and mutated only from its
//! serialized event context, so no locking is needed. Lifetime counters
//! persist across state transitions; the rolling outcome window is pruned
//! lazily on every recording.
//!
//! # State Machine
//!
//! | State | Attempts | Transition |
//! |-------|----------|------------|
//! | `Closed` | allowed | threshold failures in window → `Open` |
//! | `Open` | rejected | retry timer elapsed → `HalfOpen` (before next attempt) |
//! | `HalfOpen` | allowed | one failure → `Open`; N consecutive successes → `Closed` |

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default failures within the monitoring period before opening.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default consecutive half-open successes before closing.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Default cooldown before an open circuit allows a probe.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default rolling window for recent-outcome accounting.
pub const DEFAULT_MONITORING_PERIOD: Duration = Duration::from_secs(60);

/// Default bound on retained outcome records.
pub const DEFAULT_MAX_HISTORY: usize = 128;

// ============================================================================
// CircuitState
// ============================================================================

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; attempts pass through.
    Closed,
    /// Failing fast; attempts are rejected without executing.
    Open,
    /// Probing; attempts pass, one failure reopens.
    HalfOpen,
}

// ============================================================================
// BreakerConfig
// ============================================================================

/// Tuning parameters for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within [`BreakerConfig::monitoring_period`] that open the
    /// circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long an open circuit rejects before allowing a probe.
    pub open_timeout: Duration,
    /// Rolling window for recent outcome accounting.
    pub monitoring_period: Duration,
    /// Bound on retained outcome records.
    pub max_history: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            monitoring_period: DEFAULT_MONITORING_PERIOD,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

// ============================================================================
// BreakerMetrics
// ============================================================================

/// Read-only metrics snapshot.
///
/// Lifetime counters persist across state transitions; the recent failure
/// rate is computed from the time-pruned window only.
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Total attempts seen (executed or rejected).
    pub total_requests: u64,
    /// Lifetime successes.
    pub successes: u64,
    /// Lifetime failures.
    pub failures: u64,
    /// Lifetime fast-fail rejections.
    pub rejections: u64,
    /// Lifetime success rate over executed attempts; 1.0 when none executed.
    pub success_rate: f64,
    /// Failure rate within the current monitoring window; 0.0 when empty.
    pub recent_failure_rate: f64,
    /// Instant of the last state transition.
    pub last_transition: Instant,
}

// ============================================================================
// Types
// ============================================================================

/// State-change observer, invoked with `(old, new)` after each transition.
pub type StateObserver = Box<dyn Fn(CircuitState, CircuitState) + Send>;

/// One recorded outcome inside the rolling window.
#[derive(Debug, Clone, Copy)]
struct OutcomeRecord {
    at: Instant,
    success: bool,
}

// ============================================================================
// CircuitBreaker
// ============================================================================

/// Fault-isolation gate with `Closed`/`Open`/`HalfOpen` states.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    /// Failures counted while closed; decayed by successes, floor zero.
    failure_count: u32,
    /// Consecutive successes while half-open.
    half_open_successes: u32,
    /// When an open circuit next allows a probe.
    next_attempt: Option<Instant>,
    /// Rolling `{timestamp, outcome}` window, pruned on every recording.
    history: VecDeque<OutcomeRecord>,
    total_requests: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
    last_transition: Instant,
    observers: Vec<StateObserver>,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            next_attempt: None,
            history: VecDeque::new(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
            last_transition: Instant::now(),
            observers: Vec::new(),
        }
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Registers a state-change observer.
    ///
    /// A panicking observer is caught and logged; the remaining observers
    /// still run and breaker state is unaffected.
    pub fn add_observer(&mut self, observer: StateObserver) {
        self.observers.push(observer);
    }

    /// Returns whether an attempt may proceed right now.
    ///
    /// While `Open`, the first call at or after the retry time transitions to
    /// `HalfOpen` and allows the attempt. The caller is responsible for
    /// recording the eventual outcome (or a rejection when this returns
    /// `false`).
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = self
                    .next_attempt
                    .is_some_and(|at| Instant::now() >= at);
                if due {
                    self.half_open_successes = 0;
                    self.transition(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a fast-fail rejection (no operation was executed).
    pub fn record_rejection(&mut self) {
        self.total_requests += 1;
        self.rejections += 1;
    }

    /// Records a successful outcome.
    pub fn record_success(&mut self) {
        let now = Instant::now();
        self.total_requests += 1;
        self.successes += 1;
        self.push_record(OutcomeRecord { at: now, success: true });

        match self.state {
            CircuitState::Closed => {
                // Isolated failures must not bias the breaker forever.
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.failure_count = 0;
                    self.half_open_successes = 0;
                    self.next_attempt = None;
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // Outcome of an attempt that raced the opening; counters only.
            }
        }
    }

    /// Records a failed outcome.
    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.total_requests += 1;
        self.failures += 1;
        self.push_record(OutcomeRecord { at: now, success: false });

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.open_at(now);
                }
            }
            CircuitState::HalfOpen => {
                // A single probe failure reopens immediately.
                self.open_at(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Gates `operation` through the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] without polling the operation
    /// when attempts are rejected; otherwise executes it and records the
    /// outcome.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when rejected, or the operation's own error.
    pub async fn execute<T, F>(&mut self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.can_attempt() {
            self.record_rejection();
            return Err(Error::CircuitOpen);
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Operational override of the breaker state.
    ///
    /// Forcing `Closed` also resets counters; forcing `Open` also arms the
    /// retry timer.
    pub fn force_state(&mut self, state: CircuitState) {
        match state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.half_open_successes = 0;
                self.next_attempt = None;
            }
            CircuitState::Open => {
                self.next_attempt = Some(Instant::now() + self.config.open_timeout);
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = 0;
            }
        }
        self.transition(state);
    }

    /// Read-only metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> BreakerMetrics {
        let executed = self.successes + self.failures;
        let success_rate = if executed == 0 {
            1.0
        } else {
            self.successes as f64 / executed as f64
        };

        BreakerMetrics {
            state: self.state,
            total_requests: self.total_requests,
            successes: self.successes,
            failures: self.failures,
            rejections: self.rejections,
            success_rate,
            recent_failure_rate: self.recent_failure_rate(),
            last_transition: self.last_transition,
        }
    }

    /// Failure rate within the monitoring window, independent of lifetime
    /// totals.
    #[must_use]
    pub fn recent_failure_rate(&self) -> f64 {
        let cutoff = Instant::now()
            .checked_sub(self.config.monitoring_period)
            .unwrap_or(self.last_transition);
        let mut total = 0u32;
        let mut failed = 0u32;
        for record in &self.history {
            if record.at >= cutoff {
                total += 1;
                if !record.success {
                    failed += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            f64::from(failed) / f64::from(total)
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn open_at(&mut self, now: Instant) {
        self.next_attempt = Some(now + self.config.open_timeout);
        self.half_open_successes = 0;
        self.transition(CircuitState::Open);
    }

    /// Appends one record, pruning aged and excess entries. Failure records
    /// that age out also release their contribution to the closed-state
    /// failure counter.
    fn push_record(&mut self, record: OutcomeRecord) {
        let cutoff = record
            .at
            .checked_sub(self.config.monitoring_period);

        while let Some(front) = self.history.front() {
            let aged = cutoff.is_some_and(|c| front.at < c);
            let over_capacity = self.history.len() >= self.config.max_history;
            if !aged && !over_capacity {
                break;
            }
            if !front.success {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            self.history.pop_front();
        }

        self.history.push_back(record);
    }

    fn transition(&mut self, new_state: CircuitState) {
        if new_state == self.state {
            return;
        }
        let old_state = self.state;
        self.state = new_state;
        self.last_transition = Instant::now();

        match new_state {
            CircuitState::Open => warn!(?old_state, ?new_state, "circuit breaker opened"),
            CircuitState::HalfOpen => debug!(?old_state, ?new_state, "circuit breaker half-open"),
            CircuitState::Closed => info!(?old_state, ?new_state, "circuit breaker closed"),
        }

        for observer in &self.observers {
            // One misbehaving observer must not silence the rest.
            if catch_unwind(AssertUnwindSafe(|| observer(old_state, new_state))).is_err() {
                warn!("circuit breaker observer panicked");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

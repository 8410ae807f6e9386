//! Exponential reconnect backoff.
//!
//! `delay = min(base * growth^attempt, max)`. The delay sequence is
//! monotonically non-decreasing and capped; the attempt counter resets only
//! after a successful authentication, not merely after a socket opens.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

// ============================================================================
// Backoff
// ============================================================================

/// Reconnect delay schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    growth: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Exponent cap; beyond this the delay has long since saturated at `max`.
    const MAX_ATTEMPT: u32 = 64;

    /// Creates a schedule. `growth` must be >= 1.0 (validated at config
    /// build time).
    #[must_use]
    pub fn new(base: Duration, growth: f64, max: Duration) -> Self {
        Self {
            base,
            growth,
            max,
            attempt: 0,
        }
    }

    /// Attempts made since the last reset.
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(Self::MAX_ATTEMPT);
        self.attempt = self.attempt.saturating_add(1);

        let scaled = self.base.as_millis() as f64 * self.growth.powi(exponent as i32);
        if scaled.is_finite() && scaled < self.max.as_millis() as f64 {
            Duration::from_millis(scaled as u64)
        } else {
            self.max
        }
    }

    /// Resets the schedule to the base delay.
    ///
    /// Called only after a successful authentication.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================

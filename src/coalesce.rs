//! Time-windowed coalescing of high-frequency push updates.
//!
//! Bursts of same-key events arriving within one batch window collapse into a
//! single downstream delivery that keeps only the latest value per key. The
//! batcher owns at most one armed flush deadline; the connection driver
//! sleeps on [`EntityBatcher::deadline`] and calls
//! [`EntityBatcher::take_batch`] when it fires.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::HubEvent;

// ============================================================================
// Constants
// ============================================================================

/// Default batch window.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(50);

// ============================================================================
// EntityBatcher
// ============================================================================

/// Merges same-key updates within a time window, last write wins.
///
/// Taking a batch atomically swaps and clears the internal mapping before the
/// consumer runs, so a re-entrant enqueue from the consumer lands in the next
/// window instead of corrupting the batch being flushed.
pub struct EntityBatcher {
    window: Duration,
    pending: FxHashMap<String, HubEvent>,
    /// Armed flush deadline; at most one outstanding per buffer.
    flush_at: Option<Instant>,
}

impl EntityBatcher {
    /// Creates a batcher with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: FxHashMap::default(),
            flush_at: None,
        }
    }

    /// Number of distinct keys currently buffered.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is buffered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffers `event` under `key`, overwriting any pending value for the
    /// same key.
    ///
    /// Arms the flush deadline if it is not already armed; later enqueues in
    /// the same window do not push the deadline out.
    pub fn enqueue(&mut self, key: impl Into<String>, event: HubEvent) {
        let key = key.into();
        trace!(%key, "buffered entity update");
        self.pending.insert(key, event);
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.window);
        }
    }

    /// Armed flush deadline, if any.
    #[inline]
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    /// Takes the accumulated batch and disarms the deadline.
    ///
    /// Returns an empty vector when nothing accumulated, in which case the
    /// caller delivers nothing (no spurious empty batches).
    #[must_use]
    pub fn take_batch(&mut self) -> Vec<HubEvent> {
        self.flush_at = None;
        if self.pending.is_empty() {
            return Vec::new();
        }
        let batch = std::mem::take(&mut self.pending);
        batch.into_values().collect()
    }

    /// Discards pending state and disarms the deadline without delivering.
    ///
    /// Used on connection teardown so stale updates are never delivered for a
    /// session that no longer exists.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.flush_at = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

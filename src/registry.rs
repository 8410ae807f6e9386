//! Request/response correlation.
//!
//! Outgoing command ids map to pending completions here. An entry is created
//! on send and removed exactly once, via exactly one of: matching result,
//! explicit rejection, timeout expiry, or a registry-wide clear on connection
//! loss.
//!
//! The registry is owned by the connection driver and mutated only from its
//! serialized event context; it never takes locks. Timeouts are not armed as
//! independent timers: the driver asks for [`CallbackRegistry::next_deadline`]
//! on every loop iteration and calls [`CallbackRegistry::expire`] when it
//! fires, which keeps every scheduled deadline cancellable by simply dropping
//! the registry.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Completion side of one pending request.
pub type Completion = oneshot::Sender<Result<Value>>;

// ============================================================================
// PendingRequest
// ============================================================================

/// One outstanding request awaiting its result frame.
struct PendingRequest {
    /// Resolves or rejects the caller's future. Consumed exactly once.
    completion: Completion,
    /// Local deadline after which the entry is failed with a timeout.
    deadline: Instant,
    /// Original timeout, kept for the error message.
    timeout_ms: u64,
}

// ============================================================================
// CallbackRegistry
// ============================================================================

/// Correlates request ids to pending completions and enforces per-request
/// deadlines.
///
/// Ids are unique per connection epoch; the driver recreates or clears the
/// registry whenever the transport is lost, so an id can only be reused after
/// every entry of the previous epoch has been rejected.
#[derive(Default)]
pub struct CallbackRegistry {
    pending: FxHashMap<u32, PendingRequest>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no requests are outstanding.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Stores a pending entry with a deadline of `now + timeout_ms`.
    ///
    /// Must be called before the request frame is transmitted, so a result
    /// arriving immediately still finds its entry.
    pub fn register(&mut self, id: u32, completion: Completion, timeout_ms: u64) {
        let deadline = Instant::now() + std::time::Duration::from_millis(timeout_ms);
        let previous = self.pending.insert(
            id,
            PendingRequest {
                completion,
                deadline,
                timeout_ms,
            },
        );
        debug_assert!(previous.is_none(), "correlation id {id} reused while pending");
        trace!(id, timeout_ms, "registered pending request");
    }

    /// Delivers a successful result to the matching entry.
    ///
    /// Safe to call spuriously: returns `false` if the id is unknown
    /// (already resolved, timed out, or never registered).
    pub fn resolve(&mut self, id: u32, payload: Value) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                let _ = entry.completion.send(Ok(payload));
                trace!(id, "resolved pending request");
                true
            }
            None => false,
        }
    }

    /// Rejects the matching entry with `error`.
    ///
    /// Safe to call spuriously: returns `false` if the id is unknown.
    pub fn reject(&mut self, id: u32, error: Error) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                let _ = entry.completion.send(Err(error));
                trace!(id, "rejected pending request");
                true
            }
            None => false,
        }
    }

    /// Earliest deadline among outstanding entries, if any.
    ///
    /// The driver sleeps until this instant; `None` means no timeout timer is
    /// needed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }

    /// Fails every entry whose deadline has passed with a timeout error.
    ///
    /// Returns the number of entries expired. Other entries and the
    /// connection itself are unaffected.
    pub fn expire(&mut self, now: Instant) -> usize {
        let overdue: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &overdue {
            if let Some(entry) = self.pending.remove(id) {
                let _ = entry
                    .completion
                    .send(Err(Error::request_timeout(*id, entry.timeout_ms)));
            }
        }

        if !overdue.is_empty() {
            debug!(count = overdue.len(), "expired pending requests");
        }
        overdue.len()
    }

    /// Rejects every outstanding entry with a transport error carrying
    /// `reason` and empties the registry.
    ///
    /// Called whenever the underlying transport is lost, so no request can
    /// hang across a reconnection. Returns the number of entries rejected.
    pub fn clear(&mut self, reason: &str) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.completion.send(Err(Error::transport(reason)));
        }
        if count > 0 {
            debug!(count, reason, "cleared pending requests");
        }
        count
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Push event payloads.
//!
//! The hub delivers an unbounded stream of push events over the multiplexed
//! connection once the client is authenticated and subscribed. The client
//! decodes them at the boundary and forwards them to the external event
//! observer, optionally coalesced by entity key.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// HubEvent
// ============================================================================

/// A decoded push event from the hub.
///
/// # Format
///
/// ```json
/// {
///   "event_type": "state_changed",
///   "data": { "entity_id": "light.kitchen", ... },
///   "origin": "LOCAL",
///   "time_fired": "2024-01-01T00:00:00+00:00"
/// }
/// ```
///
/// The payload under `data` is domain-specific and passed through opaque;
/// interpretation belongs to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    /// Event kind, e.g. `state_changed`.
    pub event_type: String,

    /// Domain-specific payload.
    #[serde(default)]
    pub data: Value,

    /// Where the event originated (`LOCAL` or `REMOTE`).
    #[serde(default)]
    pub origin: Option<String>,

    /// Hub-side firing timestamp.
    #[serde(default)]
    pub time_fired: Option<String>,
}

impl HubEvent {
    /// Returns the entity key used for coalescing, if the event carries one.
    ///
    /// Events without an entity key bypass the coalescer and are delivered
    /// immediately.
    #[inline]
    #[must_use]
    pub fn entity_key(&self) -> Option<&str> {
        self.data.get("entity_id").and_then(Value::as_str)
    }
}

// ============================================================================
// Tests
// ============================================================================

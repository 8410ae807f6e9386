//! Resilient WebSocket client for home-automation hubs.
//!
//! `hubwire` maintains a long-lived, authenticated, bidirectional WebSocket
//! connection to a hub that pushes entity state changes and answers
//! id-correlated commands. The connection survives network failures through
//! automatic reconnection with exponential backoff, and shields callers from
//! event floods through time-windowed per-entity coalescing.
//!
//! # Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`connection`] | [`HubClient`] handle, driver task, handshake, backoff |
//! | [`protocol`] | Wire frames: auth exchange, command requests, results, events |
//! | [`registry`] | Pending-request correlation and per-request timeouts |
//! | [`coalesce`] | Time-windowed last-write-wins batching of entity updates |
//! | [`breaker`] | Optional circuit breaker gating outbound commands |
//! | [`config`] | Builder-validated connection configuration |
//! | [`error`] | Unified error type |
//!
//! All connection state lives on a single driver task; callers interact
//! through a cheap handle and async request futures.
//!
//! # Example
//!
//! ```ignore
//! use hubwire::{ConnectionConfig, HubClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> hubwire::Result<()> {
//!     let config = ConnectionConfig::builder()
//!         .url("ws://hub.local:8123/api/websocket")
//!         .access_token(std::env::var("HUB_TOKEN").unwrap_or_default())
//!         .coalescing()
//!         .on_event(|batch| {
//!             for event in batch {
//!                 println!("{}: {}", event.event_type, event.data);
//!             }
//!         })
//!         .build()?;
//!
//!     let client = HubClient::connect(config);
//!     let states = client.send("get_states", json!(null)).await?;
//!     println!("{} entities", states.as_array().map_or(0, Vec::len));
//!
//!     client
//!         .send(
//!             "call_service",
//!             json!({"domain": "light", "service": "turn_on",
//!                    "service_data": {"entity_id": "light.kitchen"}}),
//!         )
//!         .await?;
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod breaker;
pub mod coalesce;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState};
pub use coalesce::EntityBatcher;
pub use config::{ConnectionConfig, ConnectionConfigBuilder, ConnectionStatus};
pub use connection::HubClient;
pub use error::{Error, Result};
pub use protocol::{CommandError, HubEvent, ServerFrame};

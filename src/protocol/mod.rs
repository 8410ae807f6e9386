//! Wire protocol message types.
//!
//! This module defines the frame format for communication between the client
//! and the hub. Every WebSocket text message is one JSON object.
//!
//! # Protocol Overview
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `auth_required` | Hub → Client | Handshake challenge |
//! | `auth` | Client → Hub | Credential reply |
//! | `auth_ok` / `auth_invalid` | Hub → Client | Handshake outcome |
//! | `{id, type, ...params}` | Client → Hub | Command request |
//! | `result` | Hub → Client | Command result, matched by id |
//! | `event` | Hub → Client | Push event |
//!
//! Unrecognized frame kinds decode into [`ServerFrame::Unknown`] so new
//! server versions cannot break routing.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Tagged frame union and outbound frame builders |
//! | `event` | Push event payloads |

// ============================================================================
// Submodules
// ============================================================================

/// Tagged frame union and outbound frame builders.
pub mod frame;

/// Push event payloads.
pub mod event;

// ============================================================================
// Re-exports
// ============================================================================

pub use event::HubEvent;
pub use frame::{AuthFrame, CommandError, CommandRequest, ServerFrame};

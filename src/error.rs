//! Error types for the hub client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use hubwire::{Result, Error};
//!
//! async fn example(client: &HubClient) -> Result<()> {
//!     let states = client.send("get_states", serde_json::json!({})).await?;
//!     println!("{states}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Transport | [`Error::Transport`], [`Error::ConnectionClosed`], [`Error::NotConnected`], [`Error::WebSocket`] |
//! | Protocol | [`Error::Protocol`], [`Error::Json`] |
//! | Authentication | [`Error::AuthInvalid`] |
//! | Request | [`Error::RequestTimeout`], [`Error::Command`], [`Error::CircuitOpen`] |
//! | Configuration | [`Error::Config`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. No variant is fatal
/// to the process: the worst outcome is a connection that stays failed until
/// the caller supplies a new configuration.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when the connection configuration is invalid, e.g. an
    /// unparseable target address or an empty credential.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket-level failure (open, read, write, or unexpected close).
    ///
    /// Handled internally by the reconnection path; surfaces to callers only
    /// as the rejection reason of requests that were in flight when the
    /// transport was lost.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The client is not in the connected state.
    ///
    /// Returned by `send` without touching the network when the handshake has
    /// not completed or a reconnect is in progress.
    #[error("Not connected")]
    NotConnected,

    /// The connection was closed and the client handle is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Authentication Errors
    // ========================================================================
    /// The hub rejected the credential.
    ///
    /// Terminal for the current configuration: automatic reconnection is
    /// disabled and the server-provided reason is surfaced to the status
    /// observer.
    #[error("Authentication rejected: {reason}")]
    AuthInvalid {
        /// Server-provided rejection reason.
        reason: String,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// A request did not receive its result within the deadline.
    ///
    /// Affects only the request that timed out; the connection and other
    /// pending requests are unaffected.
    #[error("Request {id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Correlation id of the request.
        id: u32,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The circuit breaker is open; the request was rejected without any
    /// network attempt.
    #[error("Circuit breaker open")]
    CircuitOpen,

    /// Server-reported command failure for a specific request.
    #[error("Command failed: {code}: {message}")]
    Command {
        /// Machine-readable error code from the hub.
        code: String,
        /// Human-readable error message from the hub.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an auth-invalid error.
    #[inline]
    pub fn auth_invalid(reason: impl Into<String>) -> Self {
        Self::AuthInvalid {
            reason: reason.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(id: u32, timeout_ms: u64) -> Self {
        Self::RequestTimeout { id, timeout_ms }
    }

    /// Creates a server-reported command error.
    #[inline]
    pub fn command(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::NotConnected
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a terminal authentication failure.
    #[inline]
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::AuthInvalid { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry; an `AuthInvalid` with the
    /// same credential will not.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::NotConnected
                | Self::RequestTimeout { .. }
                | Self::CircuitOpen
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Wire frame definitions.
//!
//! Every WebSocket text message carries exactly one JSON object. Inbound
//! frames decode into the [`ServerFrame`] tagged union at the boundary, with
//! an explicit [`ServerFrame::Unknown`] fallthrough for forward
//! compatibility; outbound frames are the authentication reply and
//! id-correlated command requests.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::HubEvent;

// ============================================================================
// ServerFrame
// ============================================================================

/// All frame kinds the hub may send, decoded by the `type` tag.
///
/// | Tag | Variant | Routing |
/// |-----|---------|---------|
/// | `auth_required` | [`ServerFrame::AuthRequired`] | consumed by handshake |
/// | `auth_ok` | [`ServerFrame::AuthOk`] | consumed by handshake |
/// | `auth_invalid` | [`ServerFrame::AuthInvalid`] | consumed by handshake |
/// | `result` | [`ServerFrame::CommandResult`] | matched by id |
/// | `event` | [`ServerFrame::Event`] | event path |
/// | anything else | [`ServerFrame::Unknown`] | logged and dropped |
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Unsolicited handshake challenge sent right after the socket opens.
    AuthRequired,

    /// Affirmative authentication; the connection is now usable.
    AuthOk,

    /// Credential rejected. Terminal for the current configuration.
    AuthInvalid {
        /// Server-provided rejection reason.
        #[serde(default)]
        message: String,
    },

    /// Result frame answering a command request by id.
    #[serde(rename = "result")]
    CommandResult {
        /// Correlation id of the originating request.
        id: u32,
        /// Whether the command succeeded on the hub.
        success: bool,
        /// Result payload (if success).
        #[serde(default)]
        result: Option<Value>,
        /// Error details (if failure).
        #[serde(default)]
        error: Option<CommandError>,
    },

    /// Push event frame.
    Event {
        /// Subscription id the event belongs to.
        id: u32,
        /// Decoded event payload.
        event: HubEvent,
    },

    /// Unrecognized frame kind; dropped with a diagnostic.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Decodes one frame from a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input; the caller logs and drops
    /// the frame without affecting connection state.
    #[inline]
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// CommandError
// ============================================================================

/// Server-reported error payload inside a failed result frame.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandError {
    /// Machine-readable error code.
    #[serde(default)]
    pub code: String,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        Error::command(err.code, err.message)
    }
}

// ============================================================================
// AuthFrame
// ============================================================================

/// Client authentication reply: `{"type": "auth", "access_token": ...}`.
#[derive(Debug, Serialize)]
pub struct AuthFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    /// Opaque credential supplied at configuration time.
    pub access_token: &'a str,
}

impl<'a> AuthFrame<'a> {
    /// Creates an auth frame borrowing the credential.
    #[inline]
    #[must_use]
    pub fn new(access_token: &'a str) -> Self {
        Self {
            frame_type: "auth",
            access_token,
        }
    }
}

// ============================================================================
// CommandRequest
// ============================================================================

/// An id-correlated command request: `{"id": N, "type": <command>, ...params}`.
///
/// Params are flattened into the top-level object, matching the wire format.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    /// Correlation id, monotonic per connection epoch.
    pub id: u32,

    /// Command name, e.g. `get_states` or `call_service`.
    #[serde(rename = "type")]
    pub command: String,

    /// Flattened command parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl CommandRequest {
    /// Keys owned by the envelope; params must not shadow them.
    const RESERVED_KEYS: [&'static str; 2] = ["id", "type"];

    /// Creates a command request.
    ///
    /// `params` must be a JSON object or `null`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `params` is neither an object nor
    /// `null`, or if it contains a reserved envelope key.
    pub fn new(id: u32, command: impl Into<String>, params: Value) -> Result<Self> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::protocol(format!(
                    "command params must be an object or null, got {other}"
                )))
            }
        };

        for key in Self::RESERVED_KEYS {
            if params.contains_key(key) {
                return Err(Error::protocol(format!(
                    "command params must not contain reserved key {key:?}"
                )));
            }
        }

        Ok(Self {
            id,
            command: command.into(),
            params,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

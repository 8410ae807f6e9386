//! Connection configuration and status observation.
//!
//! A [`ConnectionConfig`] is immutable once built and owned by the connection
//! driver for its lifetime. Reconfiguration means disconnecting and
//! connecting with a new config; the config is never mutated in place.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::breaker::BreakerConfig;
use crate::coalesce::DEFAULT_BATCH_WINDOW;
use crate::error::{Error, Result};
use crate::protocol::HubEvent;

// ============================================================================
// Constants
// ============================================================================

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// First reconnect delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Growth factor between successive reconnect delays.
pub const DEFAULT_BACKOFF_GROWTH: f64 = 1.5;

/// Cap on the reconnect delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

// ============================================================================
// Types
// ============================================================================

/// Event observer: receives batches of decoded push events.
///
/// With coalescing enabled a batch holds the latest value per entity key
/// accumulated over one window; otherwise every batch holds a single event.
pub type EventHandler = Box<dyn Fn(Vec<HubEvent>) + Send + Sync>;

/// Status observer: invoked on every connection-state transition.
pub type StatusHandler = Box<dyn Fn(ConnectionStatus) + Send + Sync>;

// ============================================================================
// ConnectionStatus
// ============================================================================

/// Externally observable connection state.
///
/// Transitions are the only way callers observe connectivity; consecutive
/// duplicates are not re-delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Constructed, no connection attempt yet.
    Idle,
    /// Opening the transport or authenticating (a retry re-enters this
    /// state once its backoff delay elapses).
    Connecting,
    /// Handshake completed; commands may be sent.
    Connected,
    /// The hub rejected the credential; automatic reconnection is disabled
    /// for this configuration.
    AuthInvalid(String),
    /// The caller disconnected; no further transitions occur.
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::AuthInvalid(reason) => write!(f, "auth_invalid({reason})"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Immutable parameters for one client instance.
///
/// Built via [`ConnectionConfig::builder`].
pub struct ConnectionConfig {
    pub(crate) url: Url,
    pub(crate) access_token: String,
    pub(crate) on_event: Option<EventHandler>,
    pub(crate) on_status: Option<StatusHandler>,
    pub(crate) request_timeout: Duration,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_growth: f64,
    pub(crate) backoff_max: Duration,
    pub(crate) coalesce_window: Option<Duration>,
    pub(crate) breaker: Option<BreakerConfig>,
    pub(crate) subscribe_events: bool,
}

impl ConnectionConfig {
    /// Starts building a configuration.
    #[inline]
    #[must_use]
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Target hub address.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Per-request timeout.
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url.as_str())
            .field("access_token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_growth", &self.backoff_growth)
            .field("backoff_max", &self.backoff_max)
            .field("coalesce_window", &self.coalesce_window)
            .field("breaker", &self.breaker)
            .field("subscribe_events", &self.subscribe_events)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionConfigBuilder
// ============================================================================

/// Builder for [`ConnectionConfig`].
///
/// # Example
///
/// ```ignore
/// let config = ConnectionConfig::builder()
///     .url("ws://hub.local:8123/api/websocket")
///     .access_token("secret")
///     .coalescing()
///     .on_event(|batch| println!("{} updates", batch.len()))
///     .build()?;
/// ```
#[derive(Default)]
pub struct ConnectionConfigBuilder {
    url: Option<String>,
    access_token: Option<String>,
    on_event: Option<EventHandler>,
    on_status: Option<StatusHandler>,
    request_timeout: Option<Duration>,
    backoff_base: Option<Duration>,
    backoff_growth: Option<f64>,
    backoff_max: Option<Duration>,
    coalesce_window: Option<Duration>,
    breaker: Option<BreakerConfig>,
    subscribe_events: Option<bool>,
}

impl ConnectionConfigBuilder {
    /// Sets the hub address (`ws://` or `wss://`).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the opaque credential.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Sets the event observer.
    #[must_use]
    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<HubEvent>) + Send + Sync + 'static,
    {
        self.on_event = Some(Box::new(handler));
        self
    }

    /// Sets the status observer.
    #[must_use]
    pub fn on_status<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Box::new(handler));
        self
    }

    /// Overrides the default per-request timeout (30 s).
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Overrides the reconnect backoff policy.
    ///
    /// Growth must be >= 1.0 so the delay sequence stays monotonic.
    #[must_use]
    pub fn backoff(mut self, base: Duration, growth: f64, max: Duration) -> Self {
        self.backoff_base = Some(base);
        self.backoff_growth = Some(growth);
        self.backoff_max = Some(max);
        self
    }

    /// Enables entity coalescing with the default window (50 ms).
    #[must_use]
    pub fn coalescing(self) -> Self {
        self.coalesce_window(DEFAULT_BATCH_WINDOW)
    }

    /// Enables entity coalescing with a custom window.
    #[must_use]
    pub fn coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = Some(window);
        self
    }

    /// Enables circuit breaking on `send` with the given policy.
    #[must_use]
    pub fn circuit_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    /// Controls the automatic post-auth event subscription (default on).
    #[must_use]
    pub fn subscribe_events(mut self, enabled: bool) -> Self {
        self.subscribe_events = Some(enabled);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the url is missing or not a WebSocket address,
    /// if the credential is missing or empty, or if the backoff growth
    /// factor is below 1.0.
    pub fn build(self) -> Result<ConnectionConfig> {
        let url = self
            .url
            .ok_or_else(|| Error::config("missing hub url"))?;
        let url = Url::parse(&url)
            .map_err(|e| Error::config(format!("invalid hub url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "hub url must use ws or wss scheme, got {}",
                url.scheme()
            )));
        }

        let access_token = self
            .access_token
            .ok_or_else(|| Error::config("missing access token"))?;
        if access_token.is_empty() {
            return Err(Error::config("access token must not be empty"));
        }

        let backoff_growth = self.backoff_growth.unwrap_or(DEFAULT_BACKOFF_GROWTH);
        if backoff_growth < 1.0 {
            return Err(Error::config(
                "backoff growth factor must be at least 1.0",
            ));
        }

        Ok(ConnectionConfig {
            url,
            access_token,
            on_event: self.on_event,
            on_status: self.on_status,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
            backoff_growth,
            backoff_max: self.backoff_max.unwrap_or(DEFAULT_BACKOFF_MAX),
            coalesce_window: self.coalesce_window,
            breaker: self.breaker,
            subscribe_events: self.subscribe_events.unwrap_or(true),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Connection lifecycle and the serialized driver loop.
//!
//! [`HubClient`] is the caller-facing handle: it spawns one driver task that
//! owns the socket, the correlation registry, the entity batcher, and the
//! circuit breaker. Every transport callback and every timer expiry (reconnect
//! backoff, request timeout, coalescing flush) is serialized onto that one
//! task via `tokio::select!`, so none of the core state needs a lock.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --connect--> Connecting --auth_ok--> Connected
//!                       |  \--auth_invalid--> AuthInvalid (terminal, no retry)
//!                       \--open/close/error--> Connecting (after backoff)
//! any state --disconnect--> Closed
//! ```
//!
//! The backoff attempt counter resets only after a successful authentication,
//! not merely after a socket opens. A reconnection replaces the transport
//! halves wholesale; because reading stops before the socket is closed, no
//! stale callback can ever fire against the next epoch's state.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{to_string, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::breaker::CircuitBreaker;
use crate::coalesce::EntityBatcher;
use crate::config::{ConnectionConfig, ConnectionStatus, EventHandler, StatusHandler};
use crate::connection::backoff::Backoff;
use crate::error::{Error, Result};
use crate::protocol::{AuthFrame, CommandRequest, HubEvent, ServerFrame};
use crate::registry::{CallbackRegistry, Completion};

// ============================================================================
// Constants
// ============================================================================

/// Deadline for the full handshake (socket open to auth verdict).
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Command used for the automatic post-auth event subscription.
const SUBSCRIBE_EVENTS_COMMAND: &str = "subscribe_events";

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Commands from the handle to the driver task.
enum DriverCommand {
    /// Send a command and complete the caller's future with its result.
    Send {
        command: String,
        params: Value,
        timeout: Option<Duration>,
        completion: Completion,
    },
    /// Stop reconnecting, reject everything pending, close the transport.
    Disconnect,
}

/// Why the handshake phase ended.
enum HandshakeOutcome {
    /// `auth_ok` received; the connection is usable.
    Accepted,
    /// `auth_invalid` received; terminal for this configuration.
    Rejected(String),
    /// The caller disconnected mid-handshake.
    Disconnected,
    /// Socket-level failure or handshake deadline; retry with backoff.
    TransportLost(String),
}

/// Why an authenticated session ended.
enum SessionEnd {
    /// The caller disconnected.
    Disconnected,
    /// Socket-level failure; retry with backoff.
    TransportLost(String),
}

// ============================================================================
// HubClient
// ============================================================================

/// Handle to one hub connection.
///
/// Explicitly constructed and explicitly owned: create with
/// [`HubClient::connect`], stop with [`HubClient::disconnect`]. Dropping the
/// handle shuts the driver down as well. Reconfiguration means disconnecting
/// and connecting a new instance.
pub struct HubClient {
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl HubClient {
    /// Spawns the driver task and starts connecting.
    ///
    /// Returns immediately; progress is observable through the status
    /// callback and [`HubClient::status`].
    #[must_use]
    pub fn connect(config: ConnectionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);

        let task = tokio::spawn(run_driver(config, command_rx, status_tx));

        Self {
            command_tx,
            status_rx,
            task: Some(task),
        }
    }

    /// Current connection status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch receiver for status transitions, for callers who want to await
    /// changes rather than install a callback.
    #[inline]
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Sends a command with the configured default timeout.
    ///
    /// Fails immediately with [`Error::NotConnected`] (no network attempt)
    /// unless the connection is authenticated, and with
    /// [`Error::CircuitOpen`] when the breaker is rejecting.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`], [`Error::CircuitOpen`],
    /// [`Error::RequestTimeout`], [`Error::Command`], or a transport error if
    /// the connection is lost while the request is in flight.
    pub async fn send(&self, command: impl Into<String>, params: Value) -> Result<Value> {
        self.request(command.into(), params, None).await
    }

    /// Sends a command with a per-request timeout override.
    ///
    /// # Errors
    ///
    /// Same as [`HubClient::send`].
    pub async fn send_with_timeout(
        &self,
        command: impl Into<String>,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.request(command.into(), params, Some(timeout)).await
    }

    async fn request(
        &self,
        command: String,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (completion, response) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::Send {
                command,
                params,
                timeout,
                completion,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        response.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Permanently stops reconnection and tears the connection down.
    ///
    /// Cancels pending timers, rejects all outstanding requests, closes the
    /// transport without triggering the reconnect path, and transitions to
    /// [`ConnectionStatus::Closed`].
    pub async fn disconnect(mut self) {
        let _ = self.command_tx.send(DriverCommand::Disconnect);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        // The driver also exits when the command channel closes, so a
        // dropped handle cannot leak the task; this just makes it prompt.
        let _ = self.command_tx.send(DriverCommand::Disconnect);
    }
}

// ============================================================================
// StatusReporter
// ============================================================================

/// Publishes state transitions to the watch channel and the optional status
/// callback, deduplicating consecutive identical states.
struct StatusReporter {
    tx: watch::Sender<ConnectionStatus>,
    on_status: Option<StatusHandler>,
    last: ConnectionStatus,
}

impl StatusReporter {
    fn new(tx: watch::Sender<ConnectionStatus>, on_status: Option<StatusHandler>) -> Self {
        Self {
            tx,
            on_status,
            last: ConnectionStatus::Idle,
        }
    }

    fn set(&mut self, status: ConnectionStatus) {
        if status == self.last {
            return;
        }
        debug!(status = %status, "connection status changed");
        self.last = status.clone();
        let _ = self.tx.send(status.clone());
        if let Some(handler) = &self.on_status {
            handler(status);
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Top-level driver loop: connect, authenticate, run the session, back off,
/// repeat, until the caller disconnects or the credential is rejected.
async fn run_driver(
    mut config: ConnectionConfig,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let on_status = config.on_status.take();
    let on_event = config.on_event.take();
    let mut reporter = StatusReporter::new(status_tx, on_status);

    let mut backoff = Backoff::new(config.backoff_base, config.backoff_growth, config.backoff_max);
    let mut breaker = config.breaker.clone().map(CircuitBreaker::new);
    let mut batcher = config.coalesce_window.map(EntityBatcher::new);

    'reconnect: loop {
        reporter.set(ConnectionStatus::Connecting);

        let stream = match connect_async(config.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, url = %config.url, "failed to open transport");
                if wait_backoff(&mut backoff, &mut command_rx).await {
                    continue 'reconnect;
                }
                break 'reconnect;
            }
        };

        let (mut sink, mut source) = stream.split();
        match run_handshake(&mut sink, &mut source, &mut command_rx, &config.access_token).await {
            HandshakeOutcome::Accepted => {}
            HandshakeOutcome::Rejected(reason) => {
                info!(reason = %reason, "credential rejected; automatic reconnection disabled");
                let _ = sink.close().await;
                reporter.set(ConnectionStatus::AuthInvalid(reason));
                wait_terminal(&mut command_rx).await;
                break 'reconnect;
            }
            HandshakeOutcome::Disconnected => {
                let _ = sink.close().await;
                break 'reconnect;
            }
            HandshakeOutcome::TransportLost(reason) => {
                debug!(reason = %reason, "handshake aborted");
                if wait_backoff(&mut backoff, &mut command_rx).await {
                    continue 'reconnect;
                }
                break 'reconnect;
            }
        }

        // Only a completed handshake resets the schedule.
        backoff.reset();
        reporter.set(ConnectionStatus::Connected);
        info!(url = %config.url, "authenticated");

        // Fresh correlation epoch: ids restart and can no longer collide
        // with anything from the previous connection.
        let mut registry = CallbackRegistry::new();
        let end = run_session(
            sink,
            source,
            &mut command_rx,
            &mut registry,
            &mut batcher,
            &mut breaker,
            &on_event,
            &config,
        )
        .await;

        if let Some(batcher) = batcher.as_mut() {
            batcher.clear();
        }

        match end {
            SessionEnd::Disconnected => {
                registry.clear("connection closed");
                break 'reconnect;
            }
            SessionEnd::TransportLost(reason) => {
                warn!(reason = %reason, "connection lost");
                registry.clear("connection lost");
                if wait_backoff(&mut backoff, &mut command_rx).await {
                    continue 'reconnect;
                }
                break 'reconnect;
            }
        }
    }

    reporter.set(ConnectionStatus::Closed);
    debug!("connection driver terminated");
}

/// Drives the auth exchange: wait for the server's challenge, reply with the
/// credential, and wait for the verdict. Opening the socket does not make the
/// connection usable; only an explicit `auth_ok` does.
async fn run_handshake(
    sink: &mut WsSink,
    source: &mut WsSource,
    command_rx: &mut mpsc::UnboundedReceiver<DriverCommand>,
    access_token: &str,
) -> HandshakeOutcome {
    let deadline = Instant::now() + AUTH_TIMEOUT;

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match ServerFrame::parse(text.as_str()) {
                            Ok(ServerFrame::AuthRequired) => {
                                trace!("authentication challenge received");
                                let auth = AuthFrame::new(access_token);
                                let json = match to_string(&auth) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        return HandshakeOutcome::TransportLost(e.to_string());
                                    }
                                };
                                if let Err(e) = sink.send(Message::Text(json.into())).await {
                                    return HandshakeOutcome::TransportLost(e.to_string());
                                }
                            }
                            Ok(ServerFrame::AuthOk) => return HandshakeOutcome::Accepted,
                            Ok(ServerFrame::AuthInvalid { message }) => {
                                return HandshakeOutcome::Rejected(message);
                            }
                            Ok(other) => {
                                debug!(?other, "ignoring non-handshake frame before auth");
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping malformed frame during handshake");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return HandshakeOutcome::TransportLost(
                            "closed during handshake".to_string(),
                        );
                    }
                    // Binary, Ping, Pong carry nothing for the handshake.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return HandshakeOutcome::TransportLost(e.to_string()),
                    None => {
                        return HandshakeOutcome::TransportLost(
                            "stream ended during handshake".to_string(),
                        );
                    }
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(DriverCommand::Send { completion, .. }) => {
                        let _ = completion.send(Err(Error::NotConnected));
                    }
                    Some(DriverCommand::Disconnect) | None => {
                        return HandshakeOutcome::Disconnected;
                    }
                }
            }

            _ = sleep_until(deadline) => {
                return HandshakeOutcome::TransportLost(
                    "authentication timed out".to_string(),
                );
            }
        }
    }
}

/// Authenticated session loop. Routes inbound frames in priority order
/// (handshake leftovers consumed, results matched by id, everything else to
/// the event path) and services caller commands, request timeouts, and
/// coalescing flushes from the same serialized context.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut sink: WsSink,
    mut source: WsSource,
    command_rx: &mut mpsc::UnboundedReceiver<DriverCommand>,
    registry: &mut CallbackRegistry,
    batcher: &mut Option<EntityBatcher>,
    breaker: &mut Option<CircuitBreaker>,
    on_event: &Option<EventHandler>,
    config: &ConnectionConfig,
) -> SessionEnd {
    let mut next_id: u32 = 1;
    let mut subscription_id: Option<u32> = None;

    // Per-session setup: resume the push-event stream before serving callers.
    if config.subscribe_events {
        let id = next_id;
        next_id += 1;
        match subscription_frame(id) {
            Ok(json) => {
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    return SessionEnd::TransportLost(e.to_string());
                }
                subscription_id = Some(id);
                debug!(id, "event subscription requested");
            }
            Err(e) => warn!(error = %e, "failed to build event subscription"),
        }
    }

    loop {
        let request_deadline = registry.next_deadline();
        let flush_deadline = batcher.as_ref().and_then(EntityBatcher::deadline);

        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        route_frame(
                            text.as_str(),
                            registry,
                            batcher,
                            breaker,
                            on_event,
                            subscription_id,
                        );
                    }
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::TransportLost("closed by remote".to_string());
                    }
                    // Binary, Ping, Pong are not protocol frames.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::TransportLost(e.to_string()),
                    None => return SessionEnd::TransportLost("stream ended".to_string()),
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(DriverCommand::Send { command, params, timeout, completion }) => {
                        if let Some(breaker) = breaker.as_mut() {
                            if !breaker.can_attempt() {
                                breaker.record_rejection();
                                let _ = completion.send(Err(Error::CircuitOpen));
                                continue;
                            }
                        }

                        let id = next_id;
                        next_id += 1;

                        let request = match CommandRequest::new(id, command, params) {
                            Ok(request) => request,
                            Err(e) => {
                                let _ = completion.send(Err(e));
                                continue;
                            }
                        };
                        let json = match to_string(&request) {
                            Ok(json) => json,
                            Err(e) => {
                                let _ = completion.send(Err(e.into()));
                                continue;
                            }
                        };

                        let timeout_ms =
                            timeout.unwrap_or(config.request_timeout).as_millis() as u64;

                        // Register before transmitting so a result racing the
                        // send still finds its entry.
                        registry.register(id, completion, timeout_ms);

                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            registry.reject(id, Error::transport(e.to_string()));
                            if let Some(breaker) = breaker.as_mut() {
                                breaker.record_failure();
                            }
                            return SessionEnd::TransportLost(e.to_string());
                        }
                        trace!(id, "request sent");
                    }
                    Some(DriverCommand::Disconnect) | None => {
                        // Reading has stopped by construction; closing here
                        // cannot re-enter the reconnect path.
                        let _ = sink.close().await;
                        return SessionEnd::Disconnected;
                    }
                }
            }

            _ = wait_until(request_deadline) => {
                let expired = registry.expire(Instant::now());
                if let Some(breaker) = breaker.as_mut() {
                    for _ in 0..expired {
                        breaker.record_failure();
                    }
                }
            }

            _ = wait_until(flush_deadline) => {
                if let Some(batcher) = batcher.as_mut() {
                    let batch = batcher.take_batch();
                    if !batch.is_empty() {
                        if let Some(handler) = on_event {
                            handler(batch);
                        }
                    }
                }
            }
        }
    }
}

/// Decodes one inbound text frame and routes it.
fn route_frame(
    text: &str,
    registry: &mut CallbackRegistry,
    batcher: &mut Option<EntityBatcher>,
    breaker: &mut Option<CircuitBreaker>,
    on_event: &Option<EventHandler>,
    subscription_id: Option<u32>,
) {
    match ServerFrame::parse(text) {
        Ok(ServerFrame::CommandResult {
            id,
            success,
            result,
            error,
        }) => {
            let delivered = if success {
                registry.resolve(id, result.unwrap_or(Value::Null))
            } else {
                let err = error
                    .map(Error::from)
                    .unwrap_or_else(|| Error::command("unknown", "command failed"));
                registry.reject(id, err)
            };

            if delivered {
                // A delivered result means the transport round-trip worked,
                // whatever the hub thought of the command itself.
                if let Some(breaker) = breaker.as_mut() {
                    breaker.record_success();
                }
            } else if subscription_id == Some(id) {
                if success {
                    debug!(id, "event subscription confirmed");
                } else {
                    warn!(id, "event subscription rejected by hub");
                }
            } else {
                debug!(id, "result for unknown request id");
            }
        }

        Ok(ServerFrame::Event { event, .. }) => deliver_event(event, batcher, on_event),

        // Handshake frames are consumed internally and never forwarded;
        // after authentication they carry no meaning.
        Ok(ServerFrame::AuthRequired | ServerFrame::AuthOk) => {
            trace!("ignoring handshake frame after authentication");
        }
        Ok(ServerFrame::AuthInvalid { message }) => {
            warn!(reason = %message, "ignoring auth_invalid outside handshake");
        }

        Ok(ServerFrame::Unknown) => debug!("dropping unrecognized frame"),

        Err(e) => warn!(error = %e, "dropping malformed frame"),
    }
}

/// Hands one event to the coalescer when it carries an entity key, otherwise
/// delivers it immediately as a batch of one.
fn deliver_event(
    event: HubEvent,
    batcher: &mut Option<EntityBatcher>,
    on_event: &Option<EventHandler>,
) {
    let key = event.entity_key().map(str::to_string);
    match (batcher.as_mut(), key) {
        (Some(batcher), Some(key)) => batcher.enqueue(key, event),
        _ => {
            if let Some(handler) = on_event {
                handler(vec![event]);
            }
        }
    }
}

/// Sleeps the backoff delay while still servicing the handle: sends fail
/// immediately with `NotConnected`, a disconnect cancels the reconnect timer.
///
/// Returns `true` when the delay elapsed and the next attempt should start.
async fn wait_backoff(
    backoff: &mut Backoff,
    command_rx: &mut mpsc::UnboundedReceiver<DriverCommand>,
) -> bool {
    let delay = backoff.next_delay();
    info!(
        delay_ms = delay.as_millis() as u64,
        attempt = backoff.attempt(),
        "scheduling reconnect"
    );
    let deadline = Instant::now() + delay;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            command = command_rx.recv() => {
                match command {
                    Some(DriverCommand::Send { completion, .. }) => {
                        let _ = completion.send(Err(Error::NotConnected));
                    }
                    Some(DriverCommand::Disconnect) | None => return false,
                }
            }
        }
    }
}

/// Terminal wait after a credential rejection: no reconnect timer exists,
/// sends fail immediately, only a disconnect (or a dropped handle) exits.
async fn wait_terminal(command_rx: &mut mpsc::UnboundedReceiver<DriverCommand>) {
    while let Some(command) = command_rx.recv().await {
        match command {
            DriverCommand::Send { completion, .. } => {
                let _ = completion.send(Err(Error::NotConnected));
            }
            DriverCommand::Disconnect => return,
        }
    }
}

/// Sleeps until `deadline`, or forever when no deadline is armed.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn subscription_frame(id: u32) -> Result<String> {
    let request = CommandRequest::new(id, SUBSCRIBE_EVENTS_COMMAND, Value::Null)?;
    Ok(to_string(&request)?)
}

// ============================================================================
// Tests
// ============================================================================

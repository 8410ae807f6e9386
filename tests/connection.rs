//! End-to-end tests against a scripted in-process hub.
//!
//! Each test binds a local TCP listener, serves one or more scripted
//! WebSocket conversations, and drives a real [`HubClient`] against it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use hubwire::{BreakerConfig, ConnectionConfig, ConnectionStatus, Error, HubClient};

// ============================================================================
// Mock hub
// ============================================================================

type ServerWs = WebSocketStream<TcpStream>;

static TRACING: Once = Once::new();

/// Opt-in test logging via `RUST_LOG`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn bind() -> (TcpListener, String) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    (listener, url)
}

/// Accepts the WebSocket upgrade and walks the client through a successful
/// auth exchange.
async fn serve_auth_ok(stream: TcpStream) -> ServerWs {
    let mut ws = accept_async(stream).await.expect("ws accept");
    send_text(&mut ws, r#"{"type": "auth_required"}"#).await;

    let auth = recv_json(&mut ws).await;
    assert_eq!(auth["type"], "auth");
    assert!(auth["access_token"].is_string());

    send_text(&mut ws, r#"{"type": "auth_ok"}"#).await;
    ws
}

async fn send_text(ws: &mut ServerWs, text: &str) {
    ws.send(Message::Text(text.into())).await.expect("server send");
}

/// Reads the next text frame and decodes it, skipping control frames.
async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("client sent valid json");
            }
            Some(Ok(_)) => {}
            other => panic!("client hung up unexpectedly: {other:?}"),
        }
    }
}

/// Drains frames until the client closes the connection.
async fn hold_open(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

// ============================================================================
// Client helpers
// ============================================================================

fn base_config(url: &str) -> hubwire::ConnectionConfigBuilder {
    ConnectionConfig::builder()
        .url(url)
        .access_token("test-token")
        .subscribe_events(false)
        .backoff(
            Duration::from_millis(50),
            1.5,
            Duration::from_millis(200),
        )
}

async fn wait_for_status(client: &HubClient, expected: &ConnectionStatus) {
    let mut rx = client.status_receiver();
    timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow() == *expected {
                return;
            }
            rx.changed().await.expect("driver exited early");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for status {expected}"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connects_and_reports_status_transitions() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = serve_auth_ok(stream).await;
        hold_open(ws).await;
    });

    let statuses: Arc<Mutex<Vec<ConnectionStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses_clone = Arc::clone(&statuses);
    let config = base_config(&url)
        .on_status(move |status| statuses_clone.lock().expect("lock").push(status))
        .build()
        .expect("config");

    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    // Exactly one transition per state, no duplicates.
    assert_eq!(
        *statuses.lock().expect("lock"),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn test_disconnect_transitions_to_closed() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = serve_auth_ok(stream).await;
        hold_open(ws).await;
    });

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    let rx = client.status_receiver();
    client.disconnect().await;
    assert_eq!(*rx.borrow(), ConnectionStatus::Closed);
    server.abort();
}

#[tokio::test]
async fn test_send_while_disconnected_fails_without_network() {
    let (listener, url) = bind().await;
    // Nothing listening: connection attempts are refused and the driver
    // sits in its backoff loop.
    drop(listener);

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = timeout(Duration::from_secs(5), client.send("get_states", json!(null)))
        .await
        .expect("send must fail fast")
        .expect_err("not connected");
    assert!(matches!(err, Error::NotConnected));

    client.disconnect().await;
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_auth_rejection_is_terminal() {
    let (listener, url) = bind().await;
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_clone = Arc::clone(&accepts);
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.expect("accept");
            accepts_clone.fetch_add(1, Ordering::SeqCst);
            let mut ws = accept_async(stream).await.expect("ws accept");
            send_text(&mut ws, r#"{"type": "auth_required"}"#).await;
            let _ = recv_json(&mut ws).await;
            send_text(
                &mut ws,
                r#"{"type": "auth_invalid", "message": "bad token"}"#,
            )
            .await;
            hold_open(ws).await;
        }
    });

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    wait_for_status(
        &client,
        &ConnectionStatus::AuthInvalid("bad token".to_string()),
    )
    .await;

    // Well past several backoff periods: no reconnect may happen.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    let err = client
        .send("get_states", json!(null))
        .await
        .expect_err("terminal state rejects sends");
    assert!(matches!(err, Error::NotConnected));

    client.disconnect().await;
    server.abort();
}

// ============================================================================
// Request correlation
// ============================================================================

#[tokio::test]
async fn test_request_resolves_with_result_payload() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;

        let request = recv_json(&mut ws).await;
        assert_eq!(request["id"], 1);
        assert_eq!(request["type"], "get_states");

        send_text(
            &mut ws,
            r#"{"id": 1, "type": "result", "success": true,
                "result": [{"entity_id": "light.kitchen", "state": "on"}]}"#,
        )
        .await;
        // Duplicate result for the same id, a malformed frame, and an
        // unknown frame type: all must be tolerated without breaking the
        // connection.
        send_text(
            &mut ws,
            r#"{"id": 1, "type": "result", "success": true, "result": "stale"}"#,
        )
        .await;
        send_text(&mut ws, "not json at all").await;
        send_text(&mut ws, r#"{"type": "pong", "id": 42}"#).await;

        let request = recv_json(&mut ws).await;
        assert_eq!(request["id"], 2);
        assert_eq!(request["type"], "call_service");
        assert_eq!(request["domain"], "light");
        send_text(
            &mut ws,
            r#"{"id": 2, "type": "result", "success": true, "result": null}"#,
        )
        .await;
        hold_open(ws).await;
    });

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    let states = client
        .send("get_states", json!(null))
        .await
        .expect("first request");
    assert_eq!(states[0]["entity_id"], "light.kitchen");

    // The connection survived the garbage in between.
    let result = client
        .send("call_service", json!({"domain": "light", "service": "turn_on"}))
        .await
        .expect("second request");
    assert_eq!(result, Value::Null);

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn test_command_error_surfaces_to_caller() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;
        let request = recv_json(&mut ws).await;
        let reply = json!({
            "id": request["id"],
            "type": "result",
            "success": false,
            "error": {"code": "not_found", "message": "no such entity"},
        });
        send_text(&mut ws, &reply.to_string()).await;
        hold_open(ws).await;
    });

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    let err = client
        .send("get_states", json!(null))
        .await
        .expect_err("hub rejected the command");
    match err {
        Error::Command { code, message } => {
            assert_eq!(code, "not_found");
            assert_eq!(message, "no such entity");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn test_request_times_out_when_unanswered() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;
        // Swallow the request and never answer.
        let _ = recv_json(&mut ws).await;
        hold_open(ws).await;
    });

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    let err = client
        .send_with_timeout("get_states", json!(null), Duration::from_millis(100))
        .await
        .expect_err("must time out");
    assert!(err.is_timeout());

    client.disconnect().await;
    server.abort();
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_connection_loss_rejects_pending_and_reconnects() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        // First conversation: accept a request, then drop the socket.
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;
        let _ = recv_json(&mut ws).await;
        drop(ws);

        // Second conversation: behave.
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;
        let request = recv_json(&mut ws).await;
        // Fresh epoch: correlation ids restart at one.
        assert_eq!(request["id"], 1);
        let reply = json!({
            "id": 1, "type": "result", "success": true, "result": "pong",
        });
        send_text(&mut ws, &reply.to_string()).await;
        hold_open(ws).await;
    });

    let config = base_config(&url).build().expect("config");
    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    let err = timeout(Duration::from_secs(5), client.send("get_states", json!(null)))
        .await
        .expect("rejection must be prompt, not a timeout")
        .expect_err("connection dropped mid-request");
    assert!(err.is_connection_error());

    // The driver reconnects on its own and is fully usable again.
    let mut rx = client.status_receiver();
    // The clone has not observed the current value; mark it seen so the
    // loop below waits for a fresh transition instead of reading the
    // stale pre-loss `Connected`.
    rx.mark_unchanged();
    timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.expect("driver alive");
            if *rx.borrow() == ConnectionStatus::Connected {
                return;
            }
        }
    })
    .await
    .expect("reconnected");

    let result = client
        .send("ping", json!(null))
        .await
        .expect("request on new epoch");
    assert_eq!(result, json!("pong"));

    client.disconnect().await;
    server.abort();
}

// ============================================================================
// Events and coalescing
// ============================================================================

#[tokio::test]
async fn test_events_coalesce_per_entity() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;

        // Automatic subscription comes first on a fresh connection.
        let subscribe = recv_json(&mut ws).await;
        assert_eq!(subscribe["type"], "subscribe_events");
        let reply = json!({
            "id": subscribe["id"], "type": "result", "success": true, "result": null,
        });
        send_text(&mut ws, &reply.to_string()).await;

        for (entity, state) in [
            ("light.kitchen", "on"),
            ("light.kitchen", "off"),
            ("switch.porch", "on"),
        ] {
            let event = json!({
                "id": subscribe["id"],
                "type": "event",
                "event": {
                    "event_type": "state_changed",
                    "data": {"entity_id": entity, "state": state},
                },
            });
            send_text(&mut ws, &event.to_string()).await;
        }
        hold_open(ws).await;
    });

    let batches: Arc<Mutex<Vec<Vec<hubwire::HubEvent>>>> = Arc::new(Mutex::new(Vec::new()));
    let batches_clone = Arc::clone(&batches);
    let config = base_config(&url)
        .subscribe_events(true)
        .coalesce_window(Duration::from_millis(50))
        .on_event(move |batch| batches_clone.lock().expect("lock").push(batch))
        .build()
        .expect("config");

    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    timeout(Duration::from_secs(5), async {
        loop {
            if !batches.lock().expect("lock").is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batch delivered");

    let batches = batches.lock().expect("lock");
    assert_eq!(batches.len(), 1, "one window, one delivery");
    let batch = &batches[0];
    assert_eq!(batch.len(), 2, "one entry per entity");

    let kitchen = batch
        .iter()
        .find(|e| e.entity_key() == Some("light.kitchen"))
        .expect("kitchen entry");
    assert_eq!(kitchen.data["state"], "off", "last write wins");

    client.disconnect().await;
    server.abort();
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test]
async fn test_breaker_opens_after_repeated_timeouts() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = serve_auth_ok(stream).await;
        // Accept requests forever, answer none of them.
        loop {
            let _ = recv_json(&mut ws).await;
        }
    });

    let config = base_config(&url)
        .circuit_breaker(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        })
        .build()
        .expect("config");

    let client = HubClient::connect(config);
    wait_for_status(&client, &ConnectionStatus::Connected).await;

    for _ in 0..2 {
        let err = client
            .send_with_timeout("get_states", json!(null), Duration::from_millis(50))
            .await
            .expect_err("unanswered request");
        assert!(err.is_timeout());
    }

    // Threshold reached: the next attempt is rejected without touching the
    // network.
    let err = client
        .send("get_states", json!(null))
        .await
        .expect_err("breaker open");
    assert!(matches!(err, Error::CircuitOpen));

    client.disconnect().await;
    server.abort();
}

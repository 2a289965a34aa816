//! End-to-end tests: the real router on a loopback port, driven by real HTTP and
//! WebSocket clients.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{FileConfig, MalformedPolicy};
use crate::handlers::login::LoginResponse;
use crate::test_helpers::test_app_state;
use crate::ws::protocol::{
    EVENT_CHANGE_ROOM, EVENT_NEW_MESSAGE, EVENT_SEND_MESSAGE, Event, NewMessagePayload,
};
use crate::{AppState, build_router};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve the full router on 127.0.0.1:0.
async fn start_relay(fc: FileConfig) -> (SocketAddr, AppState) {
    let state = test_app_state(&fc);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn login_as(addr: SocketAddr, username: &str, password: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/login"))
        .json(&json!({ "username": username, "password": password }))
        .send()
        .await
        .expect("login request")
}

async fn login(addr: SocketAddr) -> String {
    let resp = login_as(addr, "percy", "123").await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.json::<LoginResponse>().await.unwrap().ticket
}

async fn try_connect(addr: SocketAddr, ticket: &str) -> Result<Client, tungstenite::Error> {
    tokio_tungstenite::connect_async(format!("ws://{addr}/ws?ticket={ticket}"))
        .await
        .map(|(ws, _)| ws)
}

async fn connect(addr: SocketAddr) -> Client {
    let ticket = login(addr).await;
    try_connect(addr, &ticket).await.expect("upgrade")
}

fn rejected_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

async fn send(ws: &mut Client, kind: &str, payload: serde_json::Value) {
    let frame = json!({ "type": kind, "payload": payload }).to_string();
    ws.send(Message::Text(frame.into())).await.expect("send");
}

async fn join(ws: &mut Client, room: &str) {
    send(ws, EVENT_CHANGE_ROOM, json!({ "name": room })).await;
}

/// Next application event, skipping keepalive frames.
async fn next_event(ws: &mut Client) -> Event {
    loop {
        let frame = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event");
        match frame {
            Some(Ok(Message::Text(text))) => return Event::from_frame(text.as_bytes()).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Assert nothing but keepalive frames arrive within `window`.
async fn expect_silence(ws: &mut Client, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Wait for the server to end the connection.
async fn expect_closed(ws: &mut Client) {
    loop {
        let frame = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    }
}

/// Poll until the registry reports exactly these room populations.
async fn wait_for_rooms(state: &AppState, expected: &[(&str, usize)]) {
    let expected: BTreeMap<String, usize> = expected
        .iter()
        .map(|(room, n)| (room.to_string(), *n))
        .collect();
    timeout(TEST_TIMEOUT, async {
        loop {
            if state.registry.room_populations().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("rooms never reached {expected:?}"));
}

/// Poll until the registry holds exactly `n` connections.
async fn wait_for_connections(state: &AppState, n: usize) {
    timeout(TEST_TIMEOUT, async {
        while state.registry.len().await != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {n} connections"));
}

// ── login ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn login_issues_ticket() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let ticket = login(addr).await;

    assert_eq!(ticket.len(), 36, "uuid v4 string");
    assert_eq!(state.registry.tickets().len().await, 1);
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let (addr, state) = start_relay(FileConfig::default()).await;

    let resp = login_as(addr, "percy", "wrong").await;
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(resp.text().await.unwrap().is_empty());
    assert!(state.registry.tickets().is_empty().await);
}

// ── upgrade ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn ticket_upgrades_once() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let ticket = login(addr).await;

    let _ws = try_connect(addr, &ticket).await.expect("first upgrade");
    let err = try_connect(addr, &ticket).await.unwrap_err();
    assert_eq!(rejected_status(err), 401);

    wait_for_connections(&state, 1).await;
    assert_eq!(state.metrics.snapshot().tickets.rejected, 1);
}

#[tokio::test]
async fn missing_or_unknown_ticket_is_401() {
    let (addr, state) = start_relay(FileConfig::default()).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap_err();
    assert_eq!(rejected_status(err), 401);

    let err = try_connect(addr, "abc").await.unwrap_err();
    assert_eq!(rejected_status(err), 401);

    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn plain_http_request_does_not_spend_ticket() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let ticket = login(addr).await;

    let resp = reqwest::get(format!("http://{addr}/ws?ticket={ticket}"))
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
    assert_eq!(state.registry.tickets().len().await, 1);

    try_connect(addr, &ticket).await.expect("ticket still valid");
}

#[tokio::test]
async fn origin_outside_allow_list_is_403_and_keeps_ticket() {
    let mut fc = FileConfig::default();
    fc.server.allowed_origins = vec!["http://localhost:8080".into()];
    let (addr, _state) = start_relay(fc).await;
    let ticket = login(addr).await;

    let url = format!("ws://{addr}/ws?ticket={ticket}");

    let mut req = url.as_str().into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", HeaderValue::from_static("http://evil.example"));
    let err = tokio_tungstenite::connect_async(req).await.unwrap_err();
    assert_eq!(rejected_status(err), 403);

    let mut req = url.as_str().into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", HeaderValue::from_static("http://localhost:8080"));
    tokio_tungstenite::connect_async(req)
        .await
        .expect("allowed origin upgrades with the same ticket");
}

// ── rooms ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn lobby_members_receive_message_general_does_not() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;

    join(&mut a, "lobby").await;
    join(&mut b, "lobby").await;
    join(&mut c, "general").await;
    wait_for_rooms(&state, &[("general", 1), ("lobby", 2)]).await;

    let before = chrono::Utc::now();
    send(
        &mut a,
        EVENT_SEND_MESSAGE,
        json!({ "message": "hello", "from": "a" }),
    )
    .await;

    for ws in [&mut a, &mut b] {
        let event = next_event(ws).await;
        assert_eq!(event.kind, EVENT_NEW_MESSAGE);
        let payload: NewMessagePayload = event.decode_payload().unwrap();
        assert_eq!(payload.message, "hello");
        assert_eq!(payload.from, "a");
        assert!(payload.sent >= before);
    }
    expect_silence(&mut c, Duration::from_millis(300)).await;
    expect_silence(&mut a, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn unknown_kind_keeps_connection_usable() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let mut a = connect(addr).await;

    send(&mut a, "dance", json!({})).await;
    join(&mut a, "lobby").await;
    wait_for_rooms(&state, &[("lobby", 1)]).await;

    send(
        &mut a,
        EVENT_SEND_MESSAGE,
        json!({ "message": "still here", "from": "a" }),
    )
    .await;
    let event = next_event(&mut a).await;
    assert_eq!(event.payload["message"], "still here");
    assert_eq!(state.metrics.snapshot().errors.handler, 1);
}

// ── malformed frames ────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_frame_is_dropped_by_default() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let mut a = connect(addr).await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    join(&mut a, "lobby").await;
    wait_for_rooms(&state, &[("lobby", 1)]).await;

    assert_eq!(state.metrics.snapshot().errors.malformed_frames, 1);
    assert_eq!(state.registry.len().await, 1);
}

#[tokio::test]
async fn malformed_frame_disconnects_when_configured() {
    let mut fc = FileConfig::default();
    fc.websocket.on_malformed = MalformedPolicy::Disconnect;
    let (addr, state) = start_relay(fc).await;
    let mut a = connect(addr).await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    expect_closed(&mut a).await;

    wait_for_connections(&state, 0).await;
}

#[tokio::test]
async fn oversized_frame_ends_connection() {
    let (addr, _state) = start_relay(FileConfig::default()).await;
    let mut a = connect(addr).await;

    let big = "x".repeat(2048);
    let _ = a
        .send(Message::Text(
            json!({ "type": EVENT_SEND_MESSAGE, "payload": { "message": big, "from": "a" } })
                .to_string()
                .into(),
        ))
        .await;
    expect_closed(&mut a).await;
}

// ── keepalive & shutdown ────────────────────────────────────────────────

#[tokio::test]
async fn server_pings_on_interval() {
    let mut fc = FileConfig::default();
    fc.keepalive.pong_wait_ms = 400;
    fc.keepalive.ping_interval_ms = Some(150);
    let (addr, state) = start_relay(fc).await;
    let mut a = connect(addr).await;

    let frame = timeout(TEST_TIMEOUT, a.next()).await.expect("ping");
    assert!(matches!(frame, Some(Ok(Message::Ping(_)))));

    // The client answers pings while reading, so the connection outlives
    // several pong_wait periods.
    expect_silence(&mut a, Duration::from_millis(1_000)).await;
    assert_eq!(state.registry.len().await, 1);
}

#[tokio::test]
async fn close_all_sends_close_frames() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    wait_for_connections(&state, 2).await;

    assert_eq!(state.registry.close_all().await, 2);
    for ws in [&mut a, &mut b] {
        let frame = timeout(TEST_TIMEOUT, ws.next()).await.expect("close frame");
        assert!(matches!(frame, Some(Ok(Message::Close(_)))));
    }
}

// ── health & metrics ────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_rooms_and_connections() {
    let (addr, state) = start_relay(FileConfig::default()).await;
    let mut a = connect(addr).await;
    join(&mut a, "lobby").await;
    wait_for_rooms(&state, &[("lobby", 1)]).await;

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["rooms"]["lobby"], 1);

    let live: serde_json::Value = reqwest::get(format!("http://{addr}/health/live"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live["status"], "alive");

    let metrics: serde_json::Value = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["connections"]["total"], 1);
    assert_eq!(metrics["tickets"]["issued"], 1);
}

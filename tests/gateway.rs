//! Integration tests for the HTTP gateway against a local stub backend.
//!
//! A real axum server on a random port plays the assistant backend, so the
//! full reqwest stack — auth header, JSON body, status mapping, timeout —
//! is exercised without touching the network.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::Json,
    http::{HeaderMap, StatusCode},
    routing::any,
    Router,
};
use chatrelay::gateway::{Gateway, GatewayError, HttpGateway, DEFAULT_REPLY};
use serde_json::{json, Value};

/// Spin up the stub backend and return its base URL.
async fn start_stub() -> String {
    let router = Router::new()
        .route("/ok", any(ok))
        .route("/echo-auth", any(echo_auth))
        .route("/missing-reply", any(missing_reply))
        .route("/not-json", any(not_json))
        .route("/overloaded", any(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/throttled", any(|| async { StatusCode::TOO_MANY_REQUESTS }))
        .route("/broken", any(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/slow", any(slow));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn ok(Json(body): Json<Value>) -> Json<Value> {
    // Echo the session id back so the test can assert the wire body.
    let sid = body["sessionId"].as_str().unwrap_or("").to_string();
    Json(json!({ "reply": format!("echo for {sid}") }))
}

async fn echo_auth(headers: HeaderMap) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    Json(json!({ "reply": auth }))
}

async fn missing_reply() -> Json<Value> {
    Json(json!({ "status": "done" }))
}

async fn not_json() -> &'static str {
    "plain text, not the protocol"
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({ "reply": "eventually" }))
}

fn gateway(base: &str, path: &str, timeout_secs: u64) -> HttpGateway {
    HttpGateway::new(format!("{base}{path}"), "test-key".into(), timeout_secs).unwrap()
}

#[tokio::test]
async fn sends_message_and_session_id_and_returns_reply() {
    let base = start_stub().await;
    let gw = gateway(&base, "/ok", 5);
    let reply = gw.send("hello", "sess-42").await.unwrap();
    assert_eq!(reply.text, "echo for sess-42");
    assert!(!reply.degraded);
}

#[tokio::test]
async fn sends_bearer_authorization_header() {
    let base = start_stub().await;
    let gw = gateway(&base, "/echo-auth", 5);
    let reply = gw.send("hello", "s").await.unwrap();
    assert_eq!(reply.text, "Bearer test-key");
}

#[tokio::test]
async fn missing_reply_field_is_a_degraded_success() {
    let base = start_stub().await;
    let gw = gateway(&base, "/missing-reply", 5);
    let reply = gw.send("hello", "s").await.unwrap();
    assert!(reply.degraded);
    assert_eq!(reply.text, DEFAULT_REPLY);
}

#[tokio::test]
async fn unparsable_body_is_a_degraded_success() {
    let base = start_stub().await;
    let gw = gateway(&base, "/not-json", 5);
    let reply = gw.send("hello", "s").await.unwrap();
    assert!(reply.degraded);
    assert_eq!(reply.text, DEFAULT_REPLY);
}

#[tokio::test]
async fn http_503_maps_to_server_overloaded() {
    let base = start_stub().await;
    let gw = gateway(&base, "/overloaded", 5);
    assert_eq!(
        gw.send("hello", "s").await.unwrap_err(),
        GatewayError::ServerOverloaded
    );
}

#[tokio::test]
async fn http_429_maps_to_server_overloaded() {
    let base = start_stub().await;
    let gw = gateway(&base, "/throttled", 5);
    assert_eq!(
        gw.send("hello", "s").await.unwrap_err(),
        GatewayError::ServerOverloaded
    );
}

#[tokio::test]
async fn other_error_statuses_carry_their_code() {
    let base = start_stub().await;
    let gw = gateway(&base, "/broken", 5);
    assert_eq!(
        gw.send("hello", "s").await.unwrap_err(),
        GatewayError::ServerError(500)
    );
}

#[tokio::test]
async fn slow_backend_maps_to_timeout() {
    let base = start_stub().await;
    let gw = gateway(&base, "/slow", 1);
    assert_eq!(gw.send("hello", "s").await.unwrap_err(), GatewayError::Timeout);
}

#[tokio::test]
async fn unreachable_backend_maps_to_connection_unavailable() {
    // Bind then drop a listener so the port is very likely unoccupied.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let gw = HttpGateway::new(format!("http://{addr}/chat"), "k".into(), 2).unwrap();
    assert_eq!(
        gw.send("hello", "s").await.unwrap_err(),
        GatewayError::ConnectionUnavailable
    );
}

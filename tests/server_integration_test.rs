//! Integration tests for the server startup / shutdown lifecycle.
//!
//! Each test spins up a real pincer server on an ephemeral port via
//! [`run_server_with_config`], exercises it, and shuts it down cleanly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use pincer::config::ProxyConfig;
use pincer::server::startup::{run_server_with_config, ServerConfig, ServerHandle};
use pincer::server::ws::{WsServerState, CLOSE_ORIGIN_REJECTED};

/// Spin up a lightweight test server with all defaults.
async fn start_test_server() -> ServerHandle {
    let state = Arc::new(WsServerState::new(ProxyConfig::default()).unwrap());
    run_server_with_config(ServerConfig::for_testing(state))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_starts_and_binds() {
    let handle = start_test_server().await;
    assert_ne!(handle.port(), 0, "OS should assign a non-zero port");
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_responds() {
    let handle = start_test_server().await;

    for path in ["/", "/health"] {
        let url = format!("{}{path}", handle.base_url());
        let resp = reqwest::get(&url).await.expect("GET failed");
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "pincer");
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonexistent_route_returns_404() {
    let handle = start_test_server().await;
    let url = format!("{}/does-not-exist", handle.base_url());

    let resp = reqwest::get(&url).await.expect("GET failed");
    assert_eq!(resp.status(), 404);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ws_connects_without_origin() {
    // Non-browser clients send no Origin header and must be admitted.
    let handle = start_test_server().await;

    let (ws, response) = tokio_tungstenite::connect_async(handle.ws_url())
        .await
        .expect("WS connect failed");
    assert_eq!(response.status(), 101);

    drop(ws);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ws_rejects_disallowed_origin() {
    let handle = start_test_server().await;

    let mut request = handle.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "http://evil.example".parse().unwrap());

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("upgrade should succeed before the close frame");

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("expected a close frame")
        .expect("stream ended unexpectedly")
        .expect("ws error");

    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), CLOSE_ORIGIN_REJECTED);
            assert_eq!(close.reason, "Origin not allowed");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ws_allows_listed_origin() {
    let handle = start_test_server().await;

    let mut request = handle.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "http://localhost:3000".parse().unwrap());

    let (ws, response) = tokio_tungstenite::connect_async(request)
        .await
        .expect("WS connect failed");
    assert_eq!(response.status(), 101);

    drop(ws);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_servers_bind_distinct_ports() {
    let handle_a = start_test_server().await;
    let handle_b = start_test_server().await;
    assert_ne!(handle_a.port(), handle_b.port());
    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_serving() {
    let handle = start_test_server().await;
    let url = format!("{}/health", handle.base_url());

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);

    handle.shutdown().await;

    let result = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
        .get(&url)
        .send()
        .await;
    assert!(result.is_err(), "server should be gone after shutdown");
}

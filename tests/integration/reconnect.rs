// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for automatic broker reconnection.
//!
//! The broker drops all client connections via `close_all_connections`,
//! which the client observes as a server-initiated close. These tests
//! validate:
//! - The supervisor reconnects after a fixed delay
//! - Topic subscriptions are replayed on the new connection
//! - Explicit `disconnect()` is terminal: no further reconnection
//! - An unreachable broker keeps the supervisor retrying until told to stop

use std::sync::Arc;
use std::time::Duration;

use palisade::connection::{ConnectionManager, ConnectionState};
use palisade_broker::broker::{BrokerState, start_server_with_state};

async fn start_broker() -> (String, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start broker");
    (format!("ws://{addr}/ws"), state)
}

fn make_manager(url: &str) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::with_timing(
        url,
        Duration::from_secs(2),
        Duration::from_millis(100),
    ))
}

async fn wait_for_state(
    manager: &ConnectionManager,
    want: impl Fn(&ConnectionState) -> bool,
    what: &str,
) {
    let mut state_rx = manager.state();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if want(&state_rx.borrow()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "never reached {what}"
        );
        state_rx.changed().await.unwrap();
    }
}

#[tokio::test]
async fn client_reconnects_after_server_drop() {
    let (url, state) = start_broker().await;
    let manager = make_manager(&url);
    manager.connect();
    wait_for_state(&manager, |s| *s == ConnectionState::Connected, "Connected").await;

    state.close_all_connections().await;
    wait_for_state(
        &manager,
        |s| matches!(s, ConnectionState::Disconnected | ConnectionState::Error(_)),
        "loss state",
    )
    .await;

    // The fixed-delay reconnect brings it back.
    wait_for_state(&manager, |s| *s == ConnectionState::Connected, "reconnect").await;
    manager.disconnect();
}

#[tokio::test]
async fn subscriptions_are_replayed_after_reconnect() {
    let (url, state) = start_broker().await;
    let manager = make_manager(&url);
    let mut rx = manager.subscribe("/topic/messages/alice");
    manager.connect();
    wait_for_state(&manager, |s| *s == ConnectionState::Connected, "Connected").await;

    state.close_all_connections().await;
    wait_for_state(
        &manager,
        |s| matches!(s, ConnectionState::Disconnected | ConnectionState::Error(_)),
        "loss state",
    )
    .await;
    wait_for_state(&manager, |s| *s == ConnectionState::Connected, "reconnect").await;

    // Give the replayed subscribe frame a moment to land at the broker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    state.publish("/topic/messages/alice", "after reconnect").await;

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no frame after reconnect")
        .unwrap();
    assert_eq!(body, "after reconnect");
    manager.disconnect();
}

#[tokio::test]
async fn explicit_disconnect_is_terminal() {
    let (url, _state) = start_broker().await;
    let manager = make_manager(&url);
    manager.connect();
    wait_for_state(&manager, |s| *s == ConnectionState::Connected, "Connected").await;

    manager.disconnect();
    wait_for_state(
        &manager,
        |s| *s == ConnectionState::Disconnected,
        "Disconnected",
    )
    .await;

    // Well past several reconnect delays: still down.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn unreachable_broker_keeps_retrying_until_disconnect() {
    // A listener that drops every connection before the WebSocket handshake.
    // Each accept is one dial attempt by the supervisor.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            drop(stream);
        }
    });

    let manager = Arc::new(ConnectionManager::with_timing(
        &format!("ws://{addr}/ws"),
        Duration::from_millis(300),
        Duration::from_millis(50),
    ));
    manager.connect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while attempts.load(std::sync::atomic::Ordering::SeqCst) < 2
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        attempts.load(std::sync::atomic::Ordering::SeqCst) >= 2,
        "supervisor stopped retrying"
    );

    manager.disconnect();
    wait_for_state(
        &manager,
        |s| *s == ConnectionState::Disconnected,
        "Disconnected",
    )
    .await;
}

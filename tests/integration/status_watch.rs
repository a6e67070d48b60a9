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

//! Integration tests for the account-status broadcast watcher.
//!
//! Status frames are published on the global status topic of an in-process
//! broker. These tests validate:
//! - A BLOCKED frame for the watched identity updates session state and
//!   fires the blocked callback
//! - Duplicate BLOCKED frames fire the callback once; re-blocking after an
//!   ACTIVE observation fires again
//! - Frames for other identities are ignored
//! - The REST polling fallback applies the same transition routine

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use palisade::api::InMemoryApi;
use palisade::connection::{ConnectionManager, ConnectionState};
use palisade::status::{SessionState, StatusBroadcastListener};
use palisade_broker::broker::{BrokerState, start_server_with_state};
use palisade_proto::broker::USER_STATUS_TOPIC;
use palisade_proto::status::AccountStatus;

async fn start_broker() -> (String, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start broker");
    (format!("ws://{addr}/ws"), state)
}

struct Watcher {
    listener: Arc<StatusBroadcastListener<InMemoryApi>>,
    session: SessionState,
    fired: Arc<AtomicU32>,
    api: Arc<InMemoryApi>,
    connection: Arc<ConnectionManager>,
}

fn make_watcher(url: &str, identity: &str) -> Watcher {
    let connection = Arc::new(ConnectionManager::with_timing(
        url,
        Duration::from_secs(2),
        Duration::from_millis(100),
    ));
    let api = Arc::new(InMemoryApi::new());
    let session = SessionState::new();
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    let listener = Arc::new(StatusBroadcastListener::new(
        Arc::clone(&connection),
        Arc::clone(&api),
        identity,
        session.clone(),
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    ));
    listener.watch();
    connection.connect();
    Watcher {
        listener,
        session,
        fired,
        api,
        connection,
    }
}

async fn wait_connected(connection: &ConnectionManager) {
    let mut state_rx = connection.state();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if *state_rx.borrow() == ConnectionState::Connected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "never reached Connected"
        );
        state_rx.changed().await.unwrap();
    }
}

async fn wait_status(session: &SessionState, want: AccountStatus) {
    let mut rx = session.watch();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if *rx.borrow() == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "status never became {want}"
        );
        rx.changed().await.unwrap();
    }
}

#[tokio::test]
async fn blocked_frame_updates_state_and_fires_callback() {
    let (url, state) = start_broker().await;
    let watcher = make_watcher(&url, "a@example.com");
    wait_connected(&watcher.connection).await;

    state
        .publish(
            USER_STATUS_TOPIC,
            r#"{"email":"a@example.com","status":"BLOCKED"}"#,
        )
        .await;

    wait_status(&watcher.session, AccountStatus::Blocked).await;
    assert_eq!(watcher.fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_blocked_frames_fire_once_reblock_fires_again() {
    let (url, state) = start_broker().await;
    let watcher = make_watcher(&url, "a@example.com");
    wait_connected(&watcher.connection).await;

    let blocked = r#"{"email":"a@example.com","status":"BLOCKED"}"#;
    let active = r#"{"email":"a@example.com","status":"ACTIVE"}"#;

    state.publish(USER_STATUS_TOPIC, blocked).await;
    state.publish(USER_STATUS_TOPIC, blocked).await;
    wait_status(&watcher.session, AccountStatus::Blocked).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(watcher.fired.load(Ordering::SeqCst), 1);

    state.publish(USER_STATUS_TOPIC, active).await;
    wait_status(&watcher.session, AccountStatus::Active).await;

    state.publish(USER_STATUS_TOPIC, blocked).await;
    wait_status(&watcher.session, AccountStatus::Blocked).await;
    assert_eq!(watcher.fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn frames_for_other_identities_are_ignored() {
    let (url, state) = start_broker().await;
    let watcher = make_watcher(&url, "a@example.com");
    wait_connected(&watcher.connection).await;

    state
        .publish(
            USER_STATUS_TOPIC,
            r#"{"email":"someone-else@example.com","status":"BLOCKED"}"#,
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(watcher.session.current(), AccountStatus::Active);
    assert_eq!(watcher.fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rest_poll_fallback_applies_transitions() {
    // No broker reachable; the REST path stands in for the stream.
    let watcher = make_watcher("ws://127.0.0.1:1/ws", "a@example.com");
    watcher
        .api
        .set_status("a@example.com", AccountStatus::Blocked);

    let status = watcher.listener.poll_status().await.unwrap();

    assert_eq!(status, AccountStatus::Blocked);
    assert_eq!(watcher.session.current(), AccountStatus::Blocked);
    assert_eq!(watcher.fired.load(Ordering::SeqCst), 1);
    watcher.connection.disconnect();
}

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

//! Integration tests for transcript synchronization over a live broker.
//!
//! Two clients connect to an in-process broker and exchange messages.
//! These tests validate:
//! - End-to-end encrypted send/receive between two synchronizers
//! - The broker echo of a sent message never duplicates the sender's entry
//! - Plaintext conversations work when no OTP secret is configured
//! - A malformed frame on the topic does not kill the subscription

use std::sync::Arc;
use std::time::Duration;

use palisade::api::InMemoryApi;
use palisade::connection::{ConnectionManager, ConnectionState};
use palisade::sync::MessageSynchronizer;
use palisade_broker::broker::{BrokerState, start_server_with_state};
use palisade_proto::broker::messages_topic;

const SECRET: &str = "OTPABC123";

async fn start_broker() -> (String, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start broker");
    (format!("ws://{addr}/ws"), state)
}

fn make_client(
    url: &str,
    self_id: &str,
    peer_id: &str,
    secret: Option<&str>,
) -> (Arc<ConnectionManager>, Arc<MessageSynchronizer<InMemoryApi>>) {
    let connection = Arc::new(ConnectionManager::with_timing(
        url,
        Duration::from_secs(2),
        Duration::from_millis(100),
    ));
    let sync = Arc::new(MessageSynchronizer::new(
        Arc::clone(&connection),
        Arc::new(InMemoryApi::new()),
        self_id,
        peer_id,
        secret.map(String::from),
    ));
    sync.subscribe_live();
    connection.connect();
    (connection, sync)
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

async fn wait_transcript_len(sync: &MessageSynchronizer<InMemoryApi>, len: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if sync.transcript().await.len() >= len {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transcript never reached {len} entries"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn two_clients_exchange_encrypted_messages() {
    let (url, _state) = start_broker().await;
    let (alice_conn, alice) = make_client(&url, "alice", "bob", Some(SECRET));
    let (bob_conn, bob) = make_client(&url, "bob", "alice", Some(SECRET));
    wait_connected(&alice_conn).await;
    wait_connected(&bob_conn).await;

    let sent = alice.send("hello bob").await.unwrap();
    // The wire body is ciphertext.
    assert_ne!(sent.content, "hello bob");

    wait_transcript_len(&bob, 1).await;
    let transcript = bob.transcript().await;
    assert_eq!(transcript[0].decrypted_content, "hello bob");
    assert_eq!(transcript[0].message.sender_id, "alice");
}

#[tokio::test]
async fn broker_echo_does_not_duplicate_senders_entry() {
    let (url, _state) = start_broker().await;
    let (alice_conn, alice) = make_client(&url, "alice", "bob", Some(SECRET));
    let (bob_conn, bob) = make_client(&url, "bob", "alice", Some(SECRET));
    wait_connected(&alice_conn).await;
    wait_connected(&bob_conn).await;

    alice.send("hi").await.unwrap();

    // Wait for the receiver, which proves the echo has also made the round
    // trip back to alice, then check her transcript stayed at one entry.
    wait_transcript_len(&bob, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.transcript().await.len(), 1);
}

#[tokio::test]
async fn plaintext_conversation_without_secret() {
    let (url, _state) = start_broker().await;
    let (alice_conn, alice) = make_client(&url, "alice", "bob", None);
    let (bob_conn, bob) = make_client(&url, "bob", "alice", None);
    wait_connected(&alice_conn).await;
    wait_connected(&bob_conn).await;

    let sent = alice.send("in the clear").await.unwrap();
    assert_eq!(sent.content, "in the clear");

    wait_transcript_len(&bob, 1).await;
    assert_eq!(bob.transcript().await[0].decrypted_content, "in the clear");
}

#[tokio::test]
async fn malformed_frame_does_not_kill_subscription() {
    let (url, state) = start_broker().await;
    let (alice_conn, alice) = make_client(&url, "alice", "bob", None);
    let (bob_conn, bob) = make_client(&url, "bob", "alice", None);
    wait_connected(&alice_conn).await;
    wait_connected(&bob_conn).await;

    // Garbage straight onto bob's topic.
    state.publish(&messages_topic("bob"), "this is not json").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The subscription survives and the next real message arrives.
    alice.send("still here").await.unwrap();
    wait_transcript_len(&bob, 1).await;
    assert_eq!(bob.transcript().await[0].decrypted_content, "still here");
}

#[tokio::test]
async fn sends_are_ordered_for_the_receiver() {
    let (url, _state) = start_broker().await;
    let (alice_conn, alice) = make_client(&url, "alice", "bob", None);
    let (bob_conn, bob) = make_client(&url, "bob", "alice", None);
    wait_connected(&alice_conn).await;
    wait_connected(&bob_conn).await;

    for i in 0..5 {
        alice.send(&format!("msg {i}")).await.unwrap();
        // Distinct millisecond timestamps keep the expected order strict.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_transcript_len(&bob, 5).await;
    let contents: Vec<String> = bob
        .transcript()
        .await
        .iter()
        .map(|e| e.decrypted_content.clone())
        .collect();
    assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
}

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

//! Integration tests for history fetching and its merge with other
//! transcript sources.
//!
//! These tests validate:
//! - Entries without ids get generated ids during a fetch
//! - A fetch atomically replaces the transcript; a failed fetch leaves it
//!   untouched
//! - A slow fetch overtaken by a newer one is discarded
//! - Live inserts after a fetch dedup against the fetched set

use std::sync::Arc;
use std::time::Duration;

use palisade::api::InMemoryApi;
use palisade::connection::ConnectionManager;
use palisade::sync::{MessageSynchronizer, SyncError, SyncEvent};
use palisade_proto::message::{Message, MessageStatus, Timestamp};

fn make_sync() -> (Arc<MessageSynchronizer<InMemoryApi>>, Arc<InMemoryApi>) {
    // The connection never opens; these tests exercise the fetch path only.
    let connection = Arc::new(ConnectionManager::new("ws://127.0.0.1:1/ws"));
    let api = Arc::new(InMemoryApi::new());
    let sync = Arc::new(MessageSynchronizer::new(
        connection,
        Arc::clone(&api),
        "A",
        "B",
        None,
    ));
    (sync, api)
}

fn history_message(id: Option<&str>, content: &str, millis: u64) -> Message {
    Message {
        id: id.map(String::from),
        sender_id: "B".to_string(),
        receiver_id: "A".to_string(),
        content: content.to_string(),
        status: MessageStatus::Sent,
        timestamp: Timestamp::from_millis(millis),
    }
}

#[tokio::test]
async fn fetched_entry_without_id_gets_a_generated_one() {
    let (sync, api) = make_sync();
    api.set_history(vec![history_message(None, "hey", 100)]);

    let len = sync.fetch_history().await.unwrap();

    assert_eq!(len, 1);
    let transcript = sync.transcript().await;
    let id = transcript[0].message.id.as_deref().unwrap();
    assert!(!id.is_empty());
}

#[tokio::test]
async fn fetch_orders_and_dedups_the_returned_set() {
    let (sync, api) = make_sync();
    api.set_history(vec![
        history_message(Some("m2"), "second", 200),
        history_message(Some("m1"), "first", 100),
        history_message(Some("m2"), "second again", 200),
    ]);

    let len = sync.fetch_history().await.unwrap();

    assert_eq!(len, 2);
    let contents: Vec<String> = sync
        .transcript()
        .await
        .iter()
        .map(|e| e.message.content.clone())
        .collect();
    assert_eq!(contents, vec!["first", "second"]);
}

#[tokio::test]
async fn failed_fetch_leaves_previous_transcript_intact() {
    let (sync, api) = make_sync();
    api.set_history(vec![history_message(Some("m1"), "first", 100)]);
    sync.fetch_history().await.unwrap();

    api.fail_history(true);
    let result = sync.fetch_history().await;

    assert!(result.is_err());
    let transcript = sync.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].message.id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn slow_fetch_is_superseded_by_a_newer_one() {
    let (sync, api) = make_sync();
    api.set_history(vec![history_message(Some("stale"), "stale", 100)]);
    api.delay_history(Duration::from_millis(200));

    let slow = {
        let sync = Arc::clone(&sync);
        tokio::spawn(async move { sync.fetch_history().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    api.delay_history(Duration::from_millis(0));
    api.set_history(vec![history_message(Some("fresh"), "fresh", 200)]);
    sync.fetch_history().await.unwrap();

    assert!(matches!(slow.await.unwrap(), Err(SyncError::Superseded)));
    let transcript = sync.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].message.id.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn refetch_emits_transcript_replaced_event() {
    let (sync, api) = make_sync();
    let mut events = sync.events().unwrap();
    api.set_history(vec![
        history_message(Some("m1"), "one", 100),
        history_message(Some("m2"), "two", 200),
    ]);

    sync.fetch_history().await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        SyncEvent::TranscriptReplaced { len: 2 }
    );
}

#[tokio::test]
async fn optimistic_send_dedups_against_fetched_history() {
    let (sync, api) = make_sync();

    // A send that the server has already persisted in history.
    let sent = sync.send("hi").await.unwrap();
    let mut persisted = sent.clone();
    persisted.sender_id = "A".to_string();
    api.set_history(vec![persisted]);

    sync.fetch_history().await.unwrap();

    let transcript = sync.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].message.id, sent.id);
}

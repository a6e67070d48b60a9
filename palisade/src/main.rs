//! Palisade headless chat client.
//!
//! Reads lines from stdin and publishes them to the conversation peer;
//! prints transcript and connection events to stdout. Logs go to stderr so
//! the event stream stays parseable.
//!
//! # Usage
//!
//! ```bash
//! palisade --broker-url ws://127.0.0.1:9600/ws \
//!     --rest-url http://127.0.0.1:8080 \
//!     --user-id alice --peer-id bob --email alice@example.com
//!
//! # With message encryption
//! PALISADE_OTP_SECRET=OTPABC123 palisade ...
//! ```
//!
//! Commands: `/refresh` re-fetches history, `/quit` exits.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use palisade::api::HttpApi;
use palisade::config::{CliArgs, ClientConfig};
use palisade::session::{SessionCommand, SessionEvent, SessionHandle, spawn_session};
use palisade::sync::SyncEvent;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Logs to stderr; stdout carries the event stream.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(session_config) = config.to_session_config() else {
        eprintln!("Missing configuration: broker-url, user-id, peer-id, and email are required");
        std::process::exit(1);
    };
    let Some(rest_base_url) = config.rest_base_url.clone() else {
        eprintln!("Missing configuration: rest-url is required");
        std::process::exit(1);
    };

    let api = match HttpApi::with_timeout(&rest_base_url, config.request_timeout) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            eprintln!("Error building HTTP client: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        broker = %session_config.broker_url,
        user = %session_config.self_id,
        peer = %session_config.peer_id,
        "starting palisade session"
    );
    let handle = spawn_session(session_config, api);

    run(handle).await;
}

/// Main loop: stdin lines become commands, session events become output.
async fn run(mut handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                if !print_event(&event) {
                    let _ = handle.commands.send(SessionCommand::Shutdown).await;
                    break;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    let _ = handle.commands.send(SessionCommand::Shutdown).await;
                    break;
                };
                let cmd = match line.trim() {
                    "" => continue,
                    "/quit" => {
                        let _ = handle.commands.send(SessionCommand::Shutdown).await;
                        break;
                    }
                    "/refresh" => SessionCommand::RefreshHistory,
                    text => SessionCommand::SendMessage {
                        text: text.to_string(),
                    },
                };
                if handle.commands.send(cmd).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Prints one event. Returns `false` when the session must terminate.
fn print_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Connection(state) => println!("[connection] {state}"),
        SessionEvent::Sync(SyncEvent::TranscriptReplaced { len }) => {
            println!("[history] {len} messages loaded");
        }
        SessionEvent::Sync(SyncEvent::EntryInserted { entry })
        | SessionEvent::Sync(SyncEvent::EntryUpdated { entry }) => {
            println!(
                "[{}] {}",
                entry.message.sender_id, entry.decrypted_content
            );
        }
        SessionEvent::Sync(SyncEvent::DecryptFailed { message_id }) => {
            println!("[undecryptable] message {message_id}");
        }
        SessionEvent::AccountStatus(status) => println!("[account] status {status}"),
        SessionEvent::Blocked => {
            println!("[account] this account has been blocked; session terminated");
            return false;
        }
        SessionEvent::Error(reason) => println!("[error] {reason}"),
    }
    true
}

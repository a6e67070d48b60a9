//! Session coordinator wiring the client core together.
//!
//! Bridges a consumer (UI, headless binary) with the async connection,
//! synchronizer, and status layers. The consumer sends [`SessionCommand`]s
//! and drains [`SessionEvent`]s over channels.
//!
//! # Architecture
//!
//! ```text
//! consumer  ←── SessionEvent ───  tokio background tasks
//!            ─── SessionCommand →
//! ```
//!
//! [`spawn_session`] builds the [`ConnectionManager`], the
//! [`MessageSynchronizer`], and the [`StatusBroadcastListener`] around one
//! shared [`SessionState`], starts the connection supervisor, issues the
//! initial history fetch, and spawns forwarder tasks that map internal
//! events onto the consumer channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::api::ChatApi;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::status::{SessionState, StatusBroadcastListener};
use crate::sync::{MessageSynchronizer, SyncError, SyncEvent};

use palisade_proto::status::AccountStatus;

/// Default capacity for the command/event channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Commands sent from the consumer to the session tasks.
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a text message to the conversation peer.
    SendMessage {
        /// The message text to send.
        text: String,
    },
    /// Re-fetch the conversation history, replacing the transcript.
    RefreshHistory,
    /// Ask the server to decrypt a stored message.
    DecryptRemote {
        /// Id of the message to decrypt.
        message_id: String,
    },
    /// Gracefully shut down the session.
    Shutdown,
}

/// Events sent from the session tasks to the consumer.
#[derive(Debug)]
pub enum SessionEvent {
    /// The broker connection changed state.
    Connection(ConnectionState),
    /// The transcript changed.
    Sync(SyncEvent),
    /// The account status changed.
    AccountStatus(AccountStatus),
    /// The account was blocked; the session must terminate with an
    /// explicit notice.
    Blocked,
    /// A non-fatal error the consumer may surface.
    Error(String),
}

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the broker (e.g., `ws://127.0.0.1:9600/ws`).
    pub broker_url: String,
    /// Local user identifier.
    pub self_id: String,
    /// Conversation peer identifier.
    pub peer_id: String,
    /// Identity watched on the status broadcast.
    pub email: String,
    /// Shared OTP secret; `None` disables local crypto.
    pub otp_secret: Option<String>,
    /// Timeout for opening the broker connection.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Capacity for the command/event channels.
    pub channel_capacity: usize,
}

impl SessionConfig {
    /// Creates a config with default timing and capacities.
    #[must_use]
    pub fn new(broker_url: String, self_id: String, peer_id: String, email: String) -> Self {
        Self {
            broker_url,
            self_id,
            peer_id,
            email,
            otp_secret: None,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handles returned by [`spawn_session`].
pub struct SessionHandle {
    /// Command channel into the session.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Event channel out of the session.
    pub events: mpsc::Receiver<SessionEvent>,
    /// Shared account-status state for direct reads.
    pub state: SessionState,
}

/// Builds and starts a full session, returning its channel handles.
///
/// Spawns:
/// 1. The connection supervisor (dial, reconnect, frame dispatch).
/// 2. The live-subscription drain and the status drain.
/// 3. A command handler, a connection-state forwarder, a sync-event
///    forwarder, a status forwarder, and the initial history fetch.
pub fn spawn_session<A: ChatApi + 'static>(config: SessionConfig, api: Arc<A>) -> SessionHandle {
    let connection = Arc::new(ConnectionManager::with_timing(
        &config.broker_url,
        config.connect_timeout,
        config.reconnect_delay,
    ));
    let session_state = SessionState::new();

    let sync = Arc::new(MessageSynchronizer::new(
        Arc::clone(&connection),
        Arc::clone(&api),
        &config.self_id,
        &config.peer_id,
        config.otp_secret.clone(),
    ));

    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel::<SessionEvent>(config.channel_capacity);

    // Blocked callback: fire the terminal event toward the consumer.
    let blocked_tx = evt_tx.clone();
    let listener = Arc::new(StatusBroadcastListener::new(
        Arc::clone(&connection),
        api,
        &config.email,
        session_state.clone(),
        Arc::new(move || {
            if blocked_tx.try_send(SessionEvent::Blocked).is_err() {
                tracing::warn!("blocked event dropped, consumer saturated");
            }
        }),
    ));

    // Subscriptions are registered before the supervisor starts, so the
    // first established connection already replays them.
    sync.subscribe_live();
    listener.watch();
    connection.connect();

    // Connection state forwarder.
    let mut state_rx = connection.state();
    let state_evt_tx = evt_tx.clone();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow().clone();
            if state_evt_tx
                .send(SessionEvent::Connection(state))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Sync event forwarder.
    if let Some(mut sync_rx) = sync.events() {
        let sync_evt_tx = evt_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = sync_rx.recv().await {
                if sync_evt_tx.send(SessionEvent::Sync(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Account status forwarder.
    let mut status_rx = session_state.watch();
    let status_evt_tx = evt_tx.clone();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow();
            if status_evt_tx
                .send(SessionEvent::AccountStatus(status))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Initial history fetch.
    {
        let sync = Arc::clone(&sync);
        let fetch_evt_tx = evt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.fetch_history().await {
                tracing::warn!(err = %e, "initial history fetch failed");
                let _ = fetch_evt_tx
                    .send(SessionEvent::Error(format!("history fetch failed: {e}")))
                    .await;
            }
        });
    }

    // Command handler.
    tokio::spawn(async move {
        command_handler(sync, connection, cmd_rx, evt_tx).await;
    });

    SessionHandle {
        commands: cmd_tx,
        events: evt_rx,
        state: session_state,
    }
}

/// Background task dispatching consumer commands.
async fn command_handler<A: ChatApi + 'static>(
    sync: Arc<MessageSynchronizer<A>>,
    connection: Arc<ConnectionManager>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    evt_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SessionCommand::SendMessage { text } => {
                if let Err(e) = sync.send(&text).await {
                    let _ = evt_tx
                        .send(SessionEvent::Error(format!("send failed: {e}")))
                        .await;
                }
            }
            SessionCommand::RefreshHistory => match sync.fetch_history().await {
                Ok(_) | Err(SyncError::Superseded) => {}
                Err(e) => {
                    let _ = evt_tx
                        .send(SessionEvent::Error(format!("history fetch failed: {e}")))
                        .await;
                }
            },
            SessionCommand::DecryptRemote { message_id } => {
                if let Err(e) = sync.decrypt_remote(&message_id).await {
                    let _ = evt_tx
                        .send(SessionEvent::Error(format!("decrypt failed: {e}")))
                        .await;
                }
            }
            SessionCommand::Shutdown => {
                tracing::info!("session command handler shutting down");
                connection.disconnect();
                break;
            }
        }
    }
}

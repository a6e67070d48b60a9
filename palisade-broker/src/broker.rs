//! Broker core: shared state, WebSocket handler, topic registry, and frame
//! routing.
//!
//! The broker accepts WebSocket connections and speaks the JSON frame
//! protocol from `palisade_proto::broker`. Clients subscribe to topics;
//! published bodies are fanned out to every subscriber. A publish to the
//! application destination (`/app/send`) is parsed as a chat [`Message`]
//! and routed to both participants' per-user topics — the sender-side copy
//! is the server echo that clients deduplicate against.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use palisade_proto::broker::{self, BrokerFrame, SEND_DESTINATION, messages_topic};
use palisade_proto::message::Message;

/// Default maximum allowed frame body size in bytes (64 KB).
const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

/// Shared broker state holding the client and topic registries.
pub struct BrokerState {
    /// Maps client id to the sender half of its WebSocket writer channel.
    clients: RwLock<HashMap<u64, mpsc::UnboundedSender<WsMessage>>>,
    /// Maps topic to the subscribed clients' writer channels.
    topics: RwLock<HashMap<String, HashMap<u64, mpsc::UnboundedSender<WsMessage>>>>,
    /// Monotonic client id source.
    next_client_id: AtomicU64,
    /// Maximum allowed frame body size in bytes.
    max_body_size: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Creates a new broker state with empty registries and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    /// Creates a new broker state with a custom body size limit.
    #[must_use]
    pub fn with_max_body_size(max_body_size: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            max_body_size,
        }
    }

    /// Registers a topic subscription for a client. Idempotent: a repeated
    /// subscribe replaces the stored sender.
    pub async fn subscribe(
        &self,
        topic: &str,
        client_id: u64,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id, sender);
    }

    /// Publishes a body to every subscriber of a topic.
    ///
    /// Dead subscriber channels are pruned as they are discovered.
    pub async fn publish(&self, topic: &str, body: &str) {
        let frame = BrokerFrame::Message {
            topic: topic.to_string(),
            body: body.to_string(),
        };
        let Ok(text) = broker::encode(&frame) else {
            tracing::error!(topic = %topic, "failed to encode message frame");
            return;
        };

        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            tracing::debug!(topic = %topic, "publish to topic with no subscribers");
            return;
        };

        subscribers.retain(|client_id, sender| {
            let delivered = sender.send(WsMessage::Text(text.clone().into())).is_ok();
            if !delivered {
                tracing::debug!(client_id, topic = %topic, "pruning dead subscriber");
            }
            delivered
        });
    }

    /// Send a WebSocket Close frame to all connected clients.
    ///
    /// Each client's writer task forwards the close frame, which the client
    /// side observes as a disconnect. Useful for graceful shutdown and for
    /// exercising client reconnect behavior in tests.
    pub async fn close_all_connections(&self) {
        let clients = self.clients.read().await;
        for (client_id, sender) in clients.iter() {
            tracing::info!(client_id, "sending close frame to client");
            let _ = sender.send(WsMessage::Close(None));
        }
    }

    /// Removes a client from the registry and all topic subscriptions.
    async fn remove_client(&self, client_id: u64) {
        self.clients.write().await.remove(&client_id);
        let mut topics = self.topics.write().await;
        for subscribers in topics.values_mut() {
            subscribers.remove(&client_id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Assign a client id and register the writer channel.
/// 2. Spawn a writer task draining the channel into the socket.
/// 3. Enter the reader loop, dispatching subscribe/send frames.
/// 4. On disconnect, remove the client from all registries.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    state.clients.write().await.insert(client_id, tx.clone());
    tracing::info!(client_id, "client connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::debug!(client_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text_frame(client_id, text.as_str(), &tx, &reader_state).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(client_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore binary, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.remove_client(client_id).await;
    tracing::info!(client_id, "client disconnected and removed");
}

/// Handles a text frame from a connected client.
///
/// Malformed frames are logged and skipped — a bad frame never tears down
/// the connection.
async fn handle_text_frame(
    client_id: u64,
    text: &str,
    reply: &mpsc::UnboundedSender<WsMessage>,
    state: &Arc<BrokerState>,
) {
    let frame = match broker::decode(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(client_id, error = %e, "failed to decode frame, skipping");
            return;
        }
    };

    match frame {
        BrokerFrame::Subscribe { topic } => {
            tracing::debug!(client_id, topic = %topic, "subscribe");
            state.subscribe(&topic, client_id, reply.clone()).await;
        }
        BrokerFrame::Send { destination, body } => {
            if body.len() > state.max_body_size {
                tracing::warn!(
                    client_id,
                    size = body.len(),
                    max = state.max_body_size,
                    "body exceeds size limit"
                );
                send_error(
                    reply,
                    &format!(
                        "body too large: {} bytes (max {})",
                        body.len(),
                        state.max_body_size
                    ),
                );
                return;
            }
            route_send(client_id, &destination, &body, reply, state).await;
        }
        BrokerFrame::Message { .. } | BrokerFrame::Error { .. } => {
            tracing::warn!(client_id, "unexpected server-side frame from client");
        }
    }
}

/// Routes a `send` frame to its destination.
///
/// The application destination parses the body as a chat [`Message`],
/// stamps a missing id, and fans out to both participants' topics. Direct
/// topic destinations publish verbatim.
async fn route_send(
    client_id: u64,
    destination: &str,
    body: &str,
    reply: &mpsc::UnboundedSender<WsMessage>,
    state: &Arc<BrokerState>,
) {
    if destination == SEND_DESTINATION {
        let message: Message = match serde_json::from_str(body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(client_id, error = %e, "unparseable chat message body");
                send_error(reply, &format!("unparseable chat message: {e}"));
                return;
            }
        };
        let message = message.with_ensured_id();
        let Ok(routed_body) = serde_json::to_string(&message) else {
            tracing::error!(client_id, "failed to re-encode chat message");
            return;
        };

        tracing::debug!(
            client_id,
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            "routing chat message"
        );
        state
            .publish(&messages_topic(&message.receiver_id), &routed_body)
            .await;
        // Echo to the sender's own topic; the client dedups by id.
        if message.sender_id != message.receiver_id {
            state
                .publish(&messages_topic(&message.sender_id), &routed_body)
                .await;
        }
    } else if destination.starts_with("/topic/") {
        tracing::debug!(client_id, topic = %destination, "direct topic publish");
        state.publish(destination, body).await;
    } else {
        tracing::warn!(client_id, destination = %destination, "unknown destination");
        send_error(reply, &format!("unknown destination: {destination}"));
    }
}

/// Best-effort error frame back to the offending client.
fn send_error(reply: &mpsc::UnboundedSender<WsMessage>, reason: &str) {
    let frame = BrokerFrame::Error {
        reason: reason.to_string(),
    };
    if let Ok(text) = broker::encode(&frame) {
        let _ = reply.send(WsMessage::Text(text.into()));
    }
}

/// Starts the broker on the given address with default state.
///
/// Returns the bound address (useful with port 0) and the server task
/// handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BrokerState::new())).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BrokerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

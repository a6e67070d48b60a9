//! Broker connection lifecycle for Palisade.
//!
//! [`ConnectionManager`] owns a single WebSocket connection to the broker
//! and a fixed-delay reconnect policy. Consumers register topic interest
//! with [`ConnectionManager::subscribe`] and receive frame bodies over a
//! channel; publishes go through [`ConnectionManager::send`] fire-and-forget.
//!
//! The connection runs in a background supervisor task spawned by
//! [`ConnectionManager::connect`]. On every loss the supervisor publishes
//! the new [`ConnectionState`], waits the reconnect delay, and dials again.
//! Reconnection continues until [`ConnectionManager::disconnect`], which is
//! terminal for the manager instance. Subscriptions survive reconnects: the
//! supervisor replays every registered topic on each new connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use palisade_proto::broker::{self, BrokerFrame};

/// Default timeout for opening the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default fixed delay between a connection loss and the next attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default capacity for subscription and outbound channels.
const CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection lifecycle state, published over a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport open. Initial state, and the state after a clean close.
    #[default]
    Disconnected,
    /// A dial attempt is in flight.
    Connecting,
    /// The WebSocket is open and frames flow.
    Connected,
    /// The transport failed; the reason is human-readable.
    Error(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Guard ensuring at most one reconnect wait is pending at a time.
///
/// Overlapping loss signals race to acquire; losers skip scheduling. The
/// winner releases after its delay elapses (or is cancelled).
#[derive(Debug, Default)]
pub struct ReconnectGate {
    pending: AtomicBool,
}

impl ReconnectGate {
    /// Attempts to claim the pending slot. Returns `false` if a reconnect
    /// is already scheduled.
    pub fn try_acquire(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the pending slot after the scheduled attempt ran or was
    /// cancelled.
    pub fn release(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// Why an established connection ended.
enum Lost {
    /// Server closed the socket or the stream ended.
    Closed,
    /// The socket errored out.
    Error(String),
    /// Explicit disconnect was requested.
    Shutdown,
}

/// Manages one broker connection: dialing, subscription replay, frame
/// dispatch, outbound publishing, and reconnect scheduling.
pub struct ConnectionManager {
    /// Broker WebSocket URL (ws:// or wss://).
    url: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    channel_capacity: usize,
    /// Publishes connection state transitions to watchers.
    state_tx: watch::Sender<ConnectionState>,
    /// Registered topic interest: topic to subscriber channel.
    subscriptions: parking_lot::Mutex<HashMap<String, mpsc::Sender<String>>>,
    /// Outbound frame queue drained by the supervisor while connected.
    outbound_tx: mpsc::Sender<BrokerFrame>,
    /// Receiver half, taken by the supervisor on first `connect`.
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<BrokerFrame>>>,
    /// Terminal shutdown signal set by `disconnect`.
    shutdown_tx: watch::Sender<bool>,
    /// Coalesces overlapping loss events into one scheduled attempt.
    gate: ReconnectGate,
    /// Set once the supervisor task has been spawned.
    supervisor_started: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager for the given broker URL with default timing.
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self::with_timing(url, CONNECT_TIMEOUT, RECONNECT_DELAY)
    }

    /// Creates a manager with explicit connect timeout and reconnect delay.
    ///
    /// Short delays are useful in tests; production callers take the
    /// defaults via [`ConnectionManager::new`].
    #[must_use]
    pub fn with_timing(url: &str, connect_timeout: Duration, reconnect_delay: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            url: url.to_string(),
            connect_timeout,
            reconnect_delay,
            channel_capacity: CHANNEL_CAPACITY,
            state_tx,
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            shutdown_tx,
            gate: ReconnectGate::default(),
            supervisor_started: AtomicBool::new(false),
        }
    }

    /// Returns a watcher over connection state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Registers interest in a topic and returns the channel its frame
    /// bodies arrive on.
    ///
    /// The subscription is sent to the broker immediately if connected, and
    /// replayed automatically after every reconnect. Dropping the returned
    /// receiver ends the subscription on the next delivery attempt.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscriptions.lock().insert(topic.to_string(), tx);

        let frame = BrokerFrame::Subscribe {
            topic: topic.to_string(),
        };
        if let Err(e) = self.outbound_tx.try_send(frame) {
            // Not connected yet or queue full; replay on connect covers it.
            tracing::debug!(topic = %topic, err = %e, "subscribe frame not queued");
        }
        rx
    }

    /// Publishes a body to a broker destination, fire-and-forget.
    ///
    /// Failures are logged, never surfaced. A successful queue does not
    /// confirm delivery.
    pub fn send(&self, destination: &str, body: &str) {
        let frame = BrokerFrame::Send {
            destination: destination.to_string(),
            body: body.to_string(),
        };
        if let Err(e) = self.outbound_tx.try_send(frame) {
            tracing::warn!(destination = %destination, err = %e, "outbound frame dropped");
        }
    }

    /// Spawns the background supervisor that dials, runs, and redials the
    /// connection until [`ConnectionManager::disconnect`].
    ///
    /// Idempotent: a second call is a logged no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.supervisor_started.swap(true, Ordering::AcqRel) {
            tracing::warn!(url = %self.url, "connection supervisor already running");
            return;
        }
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            tracing::warn!("outbound receiver already taken");
            return;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.supervisor_loop(outbound_rx).await;
        });
    }

    /// Explicitly closes the connection and cancels any pending reconnect.
    ///
    /// Terminal: no further automatic reconnection happens on this manager.
    pub fn disconnect(&self) {
        tracing::info!(url = %self.url, "explicit disconnect requested");
        let _ = self.shutdown_tx.send(true);
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(state = %state, "connection state change");
        let _ = self.state_tx.send(state);
    }

    /// Dial/run/redial loop. Exits only on shutdown.
    async fn supervisor_loop(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<BrokerFrame>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let dial = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
            let mut dial_abort = self.shutdown_tx.subscribe();
            let lost = tokio::select! {
                result = dial => match result {
                    Ok(Ok((ws_stream, _response))) => {
                        tracing::info!(url = %self.url, "broker connection established");
                        self.set_state(ConnectionState::Connected);
                        self.run_connection(ws_stream, &mut outbound_rx, &mut shutdown_rx)
                            .await
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(url = %self.url, err = %e, "broker connect failed");
                        Lost::Error(format!("connect failed: {e}"))
                    }
                    Err(_) => {
                        tracing::warn!(url = %self.url, "broker connect timed out");
                        Lost::Error("connect timed out".to_string())
                    }
                },
                _ = dial_abort.changed() => Lost::Shutdown,
            };

            match lost {
                Lost::Shutdown => break,
                Lost::Closed => self.set_state(ConnectionState::Disconnected),
                Lost::Error(reason) => self.set_state(ConnectionState::Error(reason)),
            }

            // Fixed-delay reconnect, coalesced through the gate so stacked
            // loss signals schedule a single attempt.
            if self.gate.try_acquire() {
                let cancelled = tokio::select! {
                    () = tokio::time::sleep(self.reconnect_delay) => false,
                    _ = shutdown_rx.changed() => true,
                };
                self.gate.release();
                if cancelled {
                    break;
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(url = %self.url, "connection supervisor exiting");
    }

    /// Runs one established connection until it is lost.
    ///
    /// Replays all registered subscriptions, then services the socket:
    /// inbound frames are dispatched to subscribers, queued outbound frames
    /// are written, and shutdown closes the socket cleanly.
    async fn run_connection(
        &self,
        ws_stream: WsStream,
        outbound_rx: &mut mpsc::Receiver<BrokerFrame>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Lost {
        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        // Subscription replay: re-register every known topic.
        let topics: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        for topic in topics {
            let frame = BrokerFrame::Subscribe {
                topic: topic.clone(),
            };
            let Ok(text) = broker::encode(&frame) else {
                continue;
            };
            if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                tracing::warn!(topic = %topic, err = %e, "subscription replay failed");
                return Lost::Error(format!("subscription replay failed: {e}"));
            }
            tracing::debug!(topic = %topic, "subscription replayed");
        }

        loop {
            tokio::select! {
                inbound = ws_reader.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => self.handle_inbound(text.as_str()),
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::info!("broker closed the connection");
                        return Lost::Closed;
                    }
                    Some(Ok(_)) => {
                        // Ignore binary, ping, pong frames.
                    }
                    Some(Err(e)) => {
                        tracing::warn!(err = %e, "WebSocket read error");
                        return Lost::Error(format!("read error: {e}"));
                    }
                    None => {
                        tracing::info!("broker stream ended");
                        return Lost::Closed;
                    }
                },
                outbound = outbound_rx.recv() => {
                    let Some(frame) = outbound else {
                        return Lost::Closed;
                    };
                    let text = match broker::encode(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!(err = %e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                        tracing::warn!(err = %e, "WebSocket write failed");
                        return Lost::Error(format!("write error: {e}"));
                    }
                },
                _ = shutdown_rx.changed() => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    return Lost::Shutdown;
                },
            }
        }
    }

    /// Decodes one inbound text frame and routes message bodies to the
    /// matching subscriber. Malformed frames are logged and skipped.
    fn handle_inbound(&self, text: &str) {
        let frame = match broker::decode(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(err = %e, "malformed broker frame, skipping");
                return;
            }
        };
        match frame {
            BrokerFrame::Message { topic, body } => self.dispatch(&topic, body),
            BrokerFrame::Error { reason } => {
                tracing::warn!(reason = %reason, "broker reported error");
            }
            BrokerFrame::Subscribe { .. } | BrokerFrame::Send { .. } => {
                tracing::debug!("unexpected client-side frame from broker");
            }
        }
    }

    /// Delivers a message body to the subscriber for `topic`, if any.
    ///
    /// A full subscriber channel drops the frame; a closed one removes the
    /// subscription.
    fn dispatch(&self, topic: &str, body: String) {
        let mut subscriptions = self.subscriptions.lock();
        let Some(sender) = subscriptions.get(topic) else {
            tracing::debug!(topic = %topic, "frame for topic with no subscriber");
            return;
        };
        match sender.try_send(body) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(topic = %topic, "subscriber channel full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(topic = %topic, "subscriber gone, removing subscription");
                subscriptions.remove(topic);
            }
        }
    }
}

//! Account-status watching: session state store and broadcast listener.
//!
//! [`SessionState`] is an explicitly constructed handle over the current
//! [`AccountStatus`], passed to whatever needs it instead of living in a
//! global. Writes go through the listener only; readers subscribe to the
//! watch channel.
//!
//! [`StatusBroadcastListener`] drains the status broadcast topic, applies
//! frames matching the watched identity, and invokes the blocked callback
//! exactly once per transition into BLOCKED. When the stream is down,
//! [`StatusBroadcastListener::poll_status`] runs the same routine off a
//! single REST check.

use std::sync::Arc;

use tokio::sync::watch;

use palisade_proto::broker::USER_STATUS_TOPIC;
use palisade_proto::status::{AccountStatus, StatusFrame};

use crate::api::{ApiError, ChatApi};
use crate::connection::ConnectionManager;

/// Shared handle over the session's account status.
///
/// Single-writer contract: only [`StatusBroadcastListener`] (stream or REST
/// path) mutates it. Initialized to ACTIVE at construction.
#[derive(Clone)]
pub struct SessionState {
    tx: Arc<watch::Sender<AccountStatus>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Creates a session state initialized to ACTIVE.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AccountStatus::Active);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current account status.
    #[must_use]
    pub fn current(&self) -> AccountStatus {
        *self.tx.borrow()
    }

    /// Returns a watcher notified on every status change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<AccountStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn update(&self, status: AccountStatus) {
        let _ = self.tx.send(status);
    }
}

/// Watches the account-status broadcast for one identity.
pub struct StatusBroadcastListener<A: ChatApi> {
    connection: Arc<ConnectionManager>,
    api: Arc<A>,
    /// Identity the listener reacts to; matched case-insensitively.
    identity: String,
    session: SessionState,
    on_blocked: Arc<dyn Fn() + Send + Sync>,
    /// Serializes status transitions between the stream and REST paths.
    transition: parking_lot::Mutex<()>,
}

impl<A: ChatApi + 'static> StatusBroadcastListener<A> {
    /// Creates a listener for `identity`, updating `session` and invoking
    /// `on_blocked` on each transition into BLOCKED.
    pub fn new(
        connection: Arc<ConnectionManager>,
        api: Arc<A>,
        identity: &str,
        session: SessionState,
        on_blocked: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            connection,
            api,
            identity: identity.to_string(),
            session,
            on_blocked,
            transition: parking_lot::Mutex::new(()),
        }
    }

    /// Subscribes to the status broadcast topic and spawns the drain task.
    ///
    /// Malformed frames and frames for other identities are logged and
    /// dropped. Transport losses are covered by the connection manager's
    /// reconnect policy; no retry logic lives here.
    pub fn watch(self: &Arc<Self>) {
        let mut rx = self.connection.subscribe(USER_STATUS_TOPIC);
        let listener = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                listener.apply_frame(&body);
            }
            tracing::debug!("status drain task exiting");
        });
    }

    /// REST fallback: one status check, fed through the same transition
    /// routine as the stream path. Callers may drive this on a timer while
    /// the stream is unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the status call fails; session state is left
    /// unchanged.
    pub async fn poll_status(&self) -> Result<AccountStatus, ApiError> {
        let status = self.api.user_status(&self.identity).await?;
        self.apply_status(status);
        Ok(status)
    }

    /// Parses one broadcast frame and applies it if it targets the watched
    /// identity.
    fn apply_frame(&self, body: &str) {
        let frame: StatusFrame = match serde_json::from_str(body) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(err = %e, "malformed status frame, dropping");
                return;
            }
        };
        if !frame.email.eq_ignore_ascii_case(&self.identity) {
            tracing::debug!(email = %frame.email, "status frame for another identity");
            return;
        }
        match frame.account_status() {
            Ok(status) => self.apply_status(status),
            Err(e) => {
                tracing::warn!(err = %e, raw = %frame.status, "unknown status value, dropping");
            }
        }
    }

    /// Status transition routine shared by the stream and REST paths.
    ///
    /// BLOCKED is sticky: only an explicit ACTIVE observation leaves it.
    /// The blocked callback fires exactly once per transition into BLOCKED;
    /// duplicate BLOCKED frames are absorbed.
    fn apply_status(&self, status: AccountStatus) {
        let _guard = self.transition.lock();
        let previous = self.session.current();

        if previous == AccountStatus::Blocked && status == AccountStatus::Pending {
            tracing::debug!("ignoring PENDING while blocked");
            return;
        }
        if previous == status {
            return;
        }

        tracing::info!(from = %previous, to = %status, "account status transition");
        self.session.update(status);
        if status == AccountStatus::Blocked {
            (self.on_blocked)();
        }
    }
}

//! Transcript synchronization: merges the live subscription, history
//! fetches, and optimistic local sends into one deduplicated transcript.
//!
//! The transcript holds at most one entry per message id and is kept in
//! ascending timestamp order regardless of arrival order. Sends are
//! optimistic: the entry appears locally before any server acknowledgment,
//! and the broker's echo of the same id is absorbed by the dedup routine.
//!
//! History fetches are atomic: the transcript is fully replaced on success
//! and untouched on failure. Concurrent fetches are ticketed so that a
//! slow, older fetch completing after a newer one is discarded instead of
//! clobbering fresher data.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

use palisade_proto::broker::{SEND_DESTINATION, messages_topic};
use palisade_proto::message::{DisplayEntry, Message, ValidationError};

use crate::api::{ApiError, ChatApi};
use crate::connection::ConnectionManager;
use crate::crypto::{self, CryptoError};

/// Capacity of the consumer-facing event channel.
const EVENT_CAPACITY: usize = 64;

/// Errors surfaced by synchronizer operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A REST collaborator call failed.
    #[error("api call failed: {0}")]
    Api(#[from] ApiError),

    /// Outbound content failed local validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Encryption of outbound content failed.
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    /// A message could not be serialized for the wire.
    #[error("codec error: {0}")]
    Codec(String),

    /// A newer history fetch completed first; this result was discarded.
    #[error("fetch superseded by a newer one")]
    Superseded,

    /// The referenced message id is not in the transcript.
    #[error("unknown message id: {0}")]
    UnknownMessage(String),
}

/// Transcript changes, delivered to the consumer over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A history fetch replaced the whole transcript.
    TranscriptReplaced {
        /// Number of entries after the replace.
        len: usize,
    },
    /// A new entry entered the transcript (live frame or local send).
    EntryInserted {
        /// The inserted entry.
        entry: DisplayEntry,
    },
    /// An existing entry's displayed body changed (remote decrypt).
    EntryUpdated {
        /// The updated entry.
        entry: DisplayEntry,
    },
    /// An inbound body failed local AEAD verification; the raw body is
    /// shown instead of garbage plaintext.
    DecryptFailed {
        /// Id of the undecryptable message.
        message_id: String,
    },
}

#[derive(Default)]
struct Transcript {
    /// Entries in ascending timestamp order.
    entries: Vec<DisplayEntry>,
    /// Ids present in `entries`.
    ids: HashSet<String>,
    /// Ticket of the most recently applied history fetch.
    applied_ticket: u64,
}

impl Transcript {
    /// Inserts an entry at its timestamp position unless its id is already
    /// present. Equal timestamps keep insertion order.
    fn dedup_insert(&mut self, entry: DisplayEntry) -> bool {
        let Some(id) = entry.message.id.clone() else {
            // Callers ensure ids before insert; drop the stray just in case.
            tracing::warn!("entry without id reached transcript, dropping");
            return false;
        };
        if !self.ids.insert(id) {
            return false;
        }
        let at = self
            .entries
            .partition_point(|e| e.message.timestamp <= entry.message.timestamp);
        self.entries.insert(at, entry);
        true
    }
}

/// Merges live frames, history fetches, and local sends into one ordered,
/// deduplicated transcript for a single conversation.
pub struct MessageSynchronizer<A: ChatApi> {
    connection: Arc<ConnectionManager>,
    api: Arc<A>,
    self_id: String,
    peer_id: String,
    /// Shared OTP secret; `None` disables local crypto entirely.
    otp_secret: Option<String>,
    transcript: Mutex<Transcript>,
    /// Monotonic ticket source for stale-fetch suppression.
    fetch_ticket: AtomicU64,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: parking_lot::Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

impl<A: ChatApi + 'static> MessageSynchronizer<A> {
    /// Creates a synchronizer for the conversation `self_id` <-> `peer_id`.
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        api: Arc<A>,
        self_id: &str,
        peer_id: &str,
        otp_secret: Option<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            connection,
            api,
            self_id: self_id.to_string(),
            peer_id: peer_id.to_string(),
            otp_secret,
            transcript: Mutex::new(Transcript::default()),
            fetch_ticket: AtomicU64::new(0),
            event_tx,
            event_rx: parking_lot::Mutex::new(Some(event_rx)),
        }
    }

    /// Takes the transcript event channel. Yields `None` after the first
    /// call.
    pub fn events(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.lock().take()
    }

    /// Returns a snapshot of the current transcript.
    pub async fn transcript(&self) -> Vec<DisplayEntry> {
        self.transcript.lock().await.entries.clone()
    }

    /// Fetches the full conversation history and atomically replaces the
    /// transcript with it.
    ///
    /// Entries missing an id get a generated one, duplicates within the
    /// fetched set collapse to one entry, and the result is ordered by
    /// timestamp. On failure the previous transcript is left untouched.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Api`] if the history call fails.
    /// - [`SyncError::Superseded`] if a newer fetch already applied; the
    ///   transcript holds the newer result.
    pub async fn fetch_history(&self) -> Result<usize, SyncError> {
        let ticket = self.fetch_ticket.fetch_add(1, Ordering::AcqRel) + 1;

        let messages = self
            .api
            .fetch_history(&self.self_id, &self.peer_id)
            .await?;

        let mut fresh = Transcript::default();
        for message in messages {
            let entry = self.display_entry(message.with_ensured_id());
            fresh.dedup_insert(entry);
        }
        let len = fresh.entries.len();

        let mut transcript = self.transcript.lock().await;
        if ticket <= transcript.applied_ticket {
            tracing::debug!(ticket, applied = transcript.applied_ticket, "stale fetch discarded");
            return Err(SyncError::Superseded);
        }
        fresh.applied_ticket = ticket;
        *transcript = fresh;
        drop(transcript);

        tracing::info!(len, "transcript replaced from history");
        self.emit(SyncEvent::TranscriptReplaced { len });
        Ok(len)
    }

    /// Subscribes to this user's message topic and spawns the drain task.
    ///
    /// Each inbound frame is parsed as a [`Message`]; malformed frames are
    /// logged and dropped without disturbing the subscription. Frames for
    /// other conversations are logged and skipped.
    pub fn subscribe_live(self: &Arc<Self>) {
        let mut rx = self.connection.subscribe(&messages_topic(&self.self_id));
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                let message: Message = match serde_json::from_str(&body) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(err = %e, "malformed message frame, dropping");
                        continue;
                    }
                };
                if !sync.is_for_this_conversation(&message) {
                    tracing::debug!(
                        sender = %message.sender_id,
                        receiver = %message.receiver_id,
                        "frame for another conversation, skipping"
                    );
                    continue;
                }
                sync.insert_message(message).await;
            }
            tracing::debug!("live subscription drain task exiting");
        });
    }

    /// Validates, encrypts (when a secret is configured), publishes, and
    /// optimistically inserts a freshly authored message.
    ///
    /// The transcript entry appears immediately; the broker echo of the
    /// same id is later absorbed by dedup instead of duplicating it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] for empty or oversized content.
    /// - [`SyncError::Crypto`] if encryption fails.
    /// - [`SyncError::Codec`] if the wire message cannot be serialized.
    pub async fn send(&self, content: &str) -> Result<Message, SyncError> {
        let mut message = Message::new(&self.self_id, &self.peer_id, content);
        message.validate()?;

        if let Some(secret) = &self.otp_secret {
            message.content = crypto::encrypt(content, secret)?;
        }
        let body = serde_json::to_string(&message).map_err(|e| SyncError::Codec(e.to_string()))?;
        self.connection.send(SEND_DESTINATION, &body);

        // Optimistic insert; the plaintext is known locally.
        let entry = DisplayEntry {
            message: message.clone(),
            decrypted_content: content.to_string(),
            decrypting: false,
        };
        let inserted = self.transcript.lock().await.dedup_insert(entry.clone());
        if inserted {
            self.emit(SyncEvent::EntryInserted { entry });
        }
        Ok(message)
    }

    /// Asks the server to decrypt a stored message and updates its
    /// transcript entry with the returned plaintext.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownMessage`] if the id is not in the transcript.
    /// - [`SyncError::Api`] if the decrypt call fails; the entry keeps its
    ///   raw body.
    pub async fn decrypt_remote(&self, message_id: &str) -> Result<(), SyncError> {
        {
            let mut transcript = self.transcript.lock().await;
            let entry = transcript
                .entries
                .iter_mut()
                .find(|e| e.message.id.as_deref() == Some(message_id))
                .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
            entry.decrypting = true;
        }

        let result = self.api.decrypt_remote(message_id, &self.self_id).await;

        let mut transcript = self.transcript.lock().await;
        let Some(entry) = transcript
            .entries
            .iter_mut()
            .find(|e| e.message.id.as_deref() == Some(message_id))
        else {
            // Transcript was replaced while the call was in flight.
            return Err(SyncError::UnknownMessage(message_id.to_string()));
        };
        entry.decrypting = false;
        match result {
            Ok(plaintext) => {
                entry.decrypted_content = plaintext;
                let entry = entry.clone();
                drop(transcript);
                self.emit(SyncEvent::EntryUpdated { entry });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(message_id = %message_id, err = %e, "remote decrypt failed");
                Err(e.into())
            }
        }
    }

    /// True if the message belongs to this synchronizer's conversation.
    fn is_for_this_conversation(&self, message: &Message) -> bool {
        (message.sender_id == self.self_id && message.receiver_id == self.peer_id)
            || (message.sender_id == self.peer_id && message.receiver_id == self.self_id)
    }

    /// Dedup-and-insert routine shared by the live stream path.
    async fn insert_message(&self, message: Message) {
        let entry = self.display_entry(message.with_ensured_id());
        let inserted = self.transcript.lock().await.dedup_insert(entry.clone());
        if inserted {
            self.emit(SyncEvent::EntryInserted { entry });
        } else {
            tracing::debug!(id = ?entry.message.id, "duplicate message discarded");
        }
    }

    /// Applies the decryption policy to an inbound message body.
    ///
    /// With a configured secret, a body that verifies becomes plaintext; a
    /// body that fails authentication keeps its raw form and raises
    /// [`SyncEvent::DecryptFailed`] so the consumer can mark it
    /// undecryptable. A body that is not ciphertext-shaped at all is shown
    /// raw, quietly: the server may deliver plaintext by policy.
    fn display_entry(&self, message: Message) -> DisplayEntry {
        let Some(secret) = &self.otp_secret else {
            return DisplayEntry::plain(message);
        };
        match crypto::decrypt(&message.content, secret) {
            Ok(plaintext) => DisplayEntry {
                message,
                decrypted_content: plaintext,
                decrypting: false,
            },
            Err(CryptoError::Authentication) => {
                if let Some(id) = &message.id {
                    self.emit(SyncEvent::DecryptFailed {
                        message_id: id.clone(),
                    });
                }
                tracing::warn!(id = ?message.id, "message failed authentication, showing raw");
                DisplayEntry::plain(message)
            }
            Err(_) => DisplayEntry::plain(message),
        }
    }

    /// Best-effort event emission; a saturated consumer loses events rather
    /// than blocking the synchronizer.
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::warn!(err = %e, "sync event dropped");
        }
    }
}

//! Wire format message types for the `Palisade` chat protocol.
//!
//! All types in this module represent the on-the-wire JSON format for
//! messages exchanged between clients and the broker. Field names are
//! camelCase and the timestamp travels as a decimal string, both for
//! compatibility with the existing server fleet.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Millisecond-precision UTC timestamp.
///
/// Carried as a decimal string on the wire (`"1700000000000"`); integer
/// payloads from older history endpoints are accepted on decode. Ordering
/// compares the numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MillisVisitor;

        impl serde::de::Visitor<'_> for MillisVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a decimal-string or integer millisecond timestamp")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Timestamp, E> {
                v.trim()
                    .parse::<u64>()
                    .map(Timestamp)
                    .map_err(|_| E::custom(format!("invalid timestamp string: {v:?}")))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Timestamp, E> {
                Ok(Timestamp(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Timestamp, E> {
                u64::try_from(v)
                    .map(Timestamp)
                    .map_err(|_| E::custom("negative timestamp"))
            }
        }

        deserializer.deserialize_any(MillisVisitor)
    }
}

/// Delivery lifecycle of a message.
///
/// Effectively immutable after creation: no status-transition path exists
/// in this core, so a transcript entry keeps the status it arrived with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Message published, no delivery confirmation.
    #[default]
    Sent,
    /// Delivery confirmed by the server.
    Delivered,
    /// Read by the recipient.
    Read,
}

/// A transcript entry as it travels on the wire.
///
/// `id` may be absent in server payloads; [`Message::with_ensured_id`]
/// assigns a random UUID before the message enters a transcript, so every
/// stored entry has a definite identity for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique id within a conversation; generated client-side
    /// when the server omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Sender's user identifier.
    pub sender_id: String,
    /// Receiver's user identifier.
    pub receiver_id: String,
    /// Message body; plaintext or ciphertext depending on server policy.
    pub content: String,
    /// Delivery status; defaults to SENT when omitted.
    #[serde(default)]
    pub status: MessageStatus,
    /// Creation time, decimal-string milliseconds on the wire.
    pub timestamp: Timestamp,
}

impl Message {
    /// Builds a freshly authored message: random UUID, status SENT,
    /// current timestamp.
    #[must_use]
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            status: MessageStatus::Sent,
            timestamp: Timestamp::now(),
        }
    }

    /// Returns this message with a generated id if the server omitted one.
    #[must_use]
    pub fn with_ensured_id(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        self
    }

    /// Validates this message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyContent`] if the body is empty, or
    /// [`ValidationError::TooLarge`] if it exceeds [`MAX_CONTENT_SIZE`].
    pub const fn validate(&self) -> Result<(), ValidationError> {
        if self.content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let size = self.content.len();
        if size > MAX_CONTENT_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }
        Ok(())
    }
}

/// Presentation wrapper pairing a wire message with its decrypted body.
///
/// Not persisted; built by the synchronizer for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayEntry {
    /// The raw wire message.
    pub message: Message,
    /// Body to display: decrypted plaintext, or the raw body when no
    /// local decryption applies.
    pub decrypted_content: String,
    /// Whether a remote decrypt call is still in flight for this entry.
    pub decrypting: bool,
}

impl DisplayEntry {
    /// Wraps a message whose body needs no local decryption.
    #[must_use]
    pub fn plain(message: Message) -> Self {
        let decrypted_content = message.content.clone();
        Self {
            message,
            decrypted_content,
            decrypting: false,
        }
    }
}

/// Error returned when input fails local validation, before any network
/// call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    EmptyContent,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// An OTP code contained non-digit characters.
    #[error("OTP code must be numeric")]
    NonNumericOtp,
}

/// Validates a user-entered OTP code: non-empty, ASCII digits only.
///
/// # Errors
///
/// Returns [`ValidationError::NonNumericOtp`] for empty or non-numeric input.
pub fn validate_otp_code(code: &str) -> Result<(), ValidationError> {
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::NonNumericOtp);
    }
    Ok(())
}

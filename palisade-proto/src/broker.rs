//! Broker wire protocol: JSON frames exchanged over WebSocket text messages.
//!
//! The protocol is deliberately small: clients subscribe to topics and send
//! to destinations; the broker fans published bodies back out as `message`
//! frames. Bodies are opaque strings — the broker only ever inspects the
//! body of an `/app/send` publish, to route it to the participants' topics.

use serde::{Deserialize, Serialize};

/// Destination for outbound chat messages.
pub const SEND_DESTINATION: &str = "/app/send";

/// Global account-status broadcast topic.
pub const USER_STATUS_TOPIC: &str = "/topic/user-status";

/// Per-user inbound message topic.
#[must_use]
pub fn messages_topic(user_id: &str) -> String {
    format!("/topic/messages/{user_id}")
}

/// Frames exchanged between clients and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum BrokerFrame {
    /// Client subscribes to a topic; all bodies published there are
    /// delivered as [`BrokerFrame::Message`] frames. Idempotent.
    Subscribe {
        /// Topic to subscribe to.
        topic: String,
    },
    /// Client publishes a body to a destination (an application
    /// destination like `/app/send`, or a topic directly).
    Send {
        /// Destination to publish to.
        destination: String,
        /// Opaque payload body.
        body: String,
    },
    /// Broker delivers a published body to a subscriber.
    Message {
        /// Topic the body was published on.
        topic: String,
        /// Opaque payload body.
        body: String,
    },
    /// Broker reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a [`BrokerFrame`] as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode(frame: &BrokerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`BrokerFrame`] from a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the text is not a valid frame.
pub fn decode(text: &str) -> Result<BrokerFrame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

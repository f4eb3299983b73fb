//! Decrypted message data model
//!
//! The payload inside the envelope is a small JSON document describing one
//! inbound message. It is parsed once per delivery and immutable after.

use serde::{Deserialize, Serialize};

/// Kind of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A text message typed by the user
    Text,
    /// A platform event (menu click, subscribe, ...); acknowledged, never dispatched
    Event,
}

/// One decrypted inbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptedMessage {
    /// Sender identifier as reported by the platform
    pub from_user: String,
    /// Platform-assigned message identifier, unique per delivery attempt group
    pub msg_id: String,
    /// Platform timestamp (seconds)
    pub create_time: u64,
    /// Message kind
    pub msg_type: MessageKind,
    /// Text content; empty for events
    #[serde(default)]
    pub content: String,
}

impl DecryptedMessage {
    /// Parse a decrypted payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error for a malformed payload.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// The payload of an outbound reply, encrypted before leaving the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMessage {
    /// Recipient (the original sender)
    pub to_user: String,
    /// Reply text
    pub content: String,
    /// Reply timestamp (seconds)
    pub create_time: u64,
}

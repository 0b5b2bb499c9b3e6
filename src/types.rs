use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type RoomId = String;
pub type MessageId = String;

/// A shared conversation context, addressed by its short code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Who wrote a message, from the reading client's point of view.
///
/// Stored as a free-form string; values this client doesn't know about
/// survive as `Other` instead of failing to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SenderKind {
    #[default]
    User,
    Partner,
    Ai,
    Other(String),
}

impl SenderKind {
    pub fn as_str(&self) -> &str {
        match self {
            SenderKind::User => "user",
            SenderKind::Partner => "partner",
            SenderKind::Ai => "ai",
            SenderKind::Other(s) => s,
        }
    }
}

impl From<String> for SenderKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "user" => SenderKind::User,
            "partner" => SenderKind::Partner,
            "ai" => SenderKind::Ai,
            _ => SenderKind::Other(value),
        }
    }
}

impl From<SenderKind> for String {
    fn from(kind: SenderKind) -> Self {
        match kind {
            SenderKind::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_type: SenderKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A message as written by a client, before the store assigns id and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_type: SenderKind,
    pub text: String,
}

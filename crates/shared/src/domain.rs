use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USER_RECORD_TYPE: &str = "Users";
pub const CONVERSATION_RECORD_TYPE: &str = "Conversation";
pub const MESSAGE_RECORD_TYPE: &str = "Message";

pub const USER_NAME_KEY: &str = "name";
/// Derived by reverse query, never written by clients.
pub const USER_CONVERSATIONS_KEY: &str = "conversations";

pub const CONVERSATION_NAME_KEY: &str = "name";
pub const CONVERSATION_OWNER_KEY: &str = "owner";
pub const CONVERSATION_MEMBERS_KEY: &str = "members";
/// Derived by reverse query, never written by clients.
pub const CONVERSATION_MESSAGES_KEY: &str = "messages";

pub const MESSAGE_SENDER_KEY: &str = "sender";
pub const MESSAGE_CONVERSATION_KEY: &str = "conversation";
pub const MESSAGE_BODY_KEY: &str = "body";
pub const MESSAGE_SENT_AT_KEY: &str = "sent_at";

/// Opaque identifier assigned to every record by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh identifier for a record constructed locally before its first save.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    User,
    Conversation,
    Message,
}

impl RecordKind {
    pub fn from_record_type(record_type: &str) -> Option<Self> {
        match record_type {
            USER_RECORD_TYPE => Some(Self::User),
            CONVERSATION_RECORD_TYPE => Some(Self::Conversation),
            MESSAGE_RECORD_TYPE => Some(Self::Message),
            _ => None,
        }
    }

    pub fn record_type(self) -> &'static str {
        match self {
            Self::User => USER_RECORD_TYPE,
            Self::Conversation => CONVERSATION_RECORD_TYPE,
            Self::Message => MESSAGE_RECORD_TYPE,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.record_type())
    }
}

//! Thread snapshot: a conversation as fetched from the provider

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageSnapshot;

/// Unique identifier for a thread (provider thread ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A thread with all of its messages, in provider order
///
/// Snapshots are replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub snippet: String,
    pub messages: Vec<MessageSnapshot>,
    /// Union of the message labels, first-seen order
    pub label_ids: Vec<String>,
}

impl ThreadSnapshot {
    pub fn first_message(&self) -> Option<&MessageSnapshot> {
        self.messages.first()
    }

    /// Receive time of the newest message
    pub fn last_received_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().map(|m| m.received_at).max()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }

    pub fn has_attachments(&self) -> bool {
        self.messages.iter().any(|m| !m.attachments.is_empty())
    }
}

//! Message snapshot built from a single thread-detail fetch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ThreadId;

/// Unique identifier for a message (provider message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The header subset kept for each message
///
/// Values are the raw header strings; address lists are not split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: Option<String>,
    /// Raw `Date` header
    pub date: Option<String>,
}

/// Attachment descriptor (content is fetched separately)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: Option<String>,
    pub attachment_id: Option<String>,
}

/// One message of a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub headers: MessageHeaders,
    pub snippet: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentRef>,
    pub label_ids: Vec<String>,
    /// `Date` header when parseable, otherwise the provider's internal date
    pub received_at: DateTime<Utc>,
}

impl MessageSnapshot {
    /// Subject, or empty when the header is missing
    pub fn subject(&self) -> &str {
        self.headers.subject.as_deref().unwrap_or("")
    }

    /// Sender header, or empty when missing
    pub fn sender(&self) -> &str {
        self.headers.from.as_deref().unwrap_or("")
    }

    /// Plain-text body with html as fallback
    pub fn body(&self) -> Option<&str> {
        self.text_body.as_deref().or(self.html_body.as_deref())
    }
}

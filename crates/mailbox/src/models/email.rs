//! Persisted email row: one per (user, thread)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ThreadId, ThreadSnapshot, UserId};

/// Subject stored when the first message has none
pub const NO_SUBJECT: &str = "(No Subject)";

/// Characters of conversation text kept for embedding
const CONVERSATION_LIMIT: usize = 5000;

/// A synchronized thread as it is stored
///
/// Header fields come from the first message of the thread. The row is
/// replaced on every sync of the thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub user_id: UserId,
    pub thread_id: ThreadId,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: String,
    pub snippet: String,
    /// Plain-text body of the first message, html if there is none
    pub body: Option<String>,
    pub label_ids: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachments: bool,
    /// Receive time of the newest message in the thread
    pub received_at: DateTime<Utc>,
    /// Semantic vector; absent when embedding failed or never ran
    pub embedding: Option<Vec<f32>>,
}

impl EmailRecord {
    /// Build the row for a thread
    ///
    /// Returns `None` for a thread without messages.
    pub fn from_thread(user_id: UserId, thread: &ThreadSnapshot) -> Option<Self> {
        let first = thread.first_message()?;
        let received_at = thread.last_received_at().unwrap_or(first.received_at);

        Some(Self {
            user_id,
            thread_id: thread.id.clone(),
            from: first.headers.from.clone(),
            to: first.headers.to.clone(),
            subject: first
                .headers
                .subject
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
            snippet: thread.snippet.clone(),
            body: first.body().map(str::to_string),
            label_ids: thread.label_ids.clone(),
            is_read: !thread.has_label("UNREAD"),
            is_starred: thread.has_label("STARRED"),
            has_attachments: thread.has_attachments(),
            received_at,
            embedding: None,
        })
    }

    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = embedding.filter(|v| !v.is_empty());
        self
    }

    /// Text sent to the embedder for this thread
    ///
    /// The subject is repeated to weight it against the body, and the
    /// conversation is every message's plain-text body tagged with its sender.
    pub fn embedding_text(thread: &ThreadSnapshot) -> String {
        let subject = thread
            .first_message()
            .and_then(|m| m.headers.subject.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_SUBJECT);

        let mut conversation = String::new();
        for message in &thread.messages {
            let sender = message.headers.from.as_deref().unwrap_or("Unknown");
            let body = message.text_body.as_deref().map(strip_tags).unwrap_or_default();
            let body = body.trim();
            if !body.is_empty() {
                conversation.push_str("\n[From: ");
                conversation.push_str(sender);
                conversation.push_str("]: ");
                conversation.push_str(body);
            }
        }

        let conversation: String = conversation.chars().take(CONVERSATION_LIMIT).collect();
        format!("Subject: {subject}. {subject}. {subject}.\nContent: {conversation}")
    }
}

/// Remove anything that looks like a markup tag
fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('<') {
        match rest[start..].find('>') {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachmentRef, MessageHeaders, MessageId, MessageSnapshot};
    use chrono::{Duration, TimeZone};

    fn message(id: &str, from: &str, subject: Option<&str>, body: &str, at: DateTime<Utc>) -> MessageSnapshot {
        MessageSnapshot {
            id: MessageId::new(id),
            thread_id: ThreadId::new("t1"),
            headers: MessageHeaders {
                from: Some(from.to_string()),
                to: Some("me@example.com".to_string()),
                subject: subject.map(str::to_string),
                ..Default::default()
            },
            snippet: String::new(),
            text_body: Some(body.to_string()),
            html_body: None,
            attachments: Vec::new(),
            label_ids: Vec::new(),
            received_at: at,
        }
    }

    fn thread(messages: Vec<MessageSnapshot>, labels: &[&str]) -> ThreadSnapshot {
        ThreadSnapshot {
            id: ThreadId::new("t1"),
            snippet: "snippet".to_string(),
            messages,
            label_ids: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_from_thread_flags_and_dates() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut reply = message("m2", "bob@example.com", Some("Re: Plan"), "ok", t0 + Duration::hours(2));
        reply.attachments.push(AttachmentRef {
            filename: "plan.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
            attachment_id: Some("att1".to_string()),
        });
        let t = thread(
            vec![message("m1", "alice@example.com", Some("Plan"), "draft", t0), reply],
            &["INBOX", "UNREAD", "STARRED"],
        );

        let record = EmailRecord::from_thread(UserId::new("u"), &t).unwrap();
        assert_eq!(record.subject, "Plan");
        assert_eq!(record.from.as_deref(), Some("alice@example.com"));
        assert_eq!(record.body.as_deref(), Some("draft"));
        assert!(!record.is_read);
        assert!(record.is_starred);
        assert!(record.has_attachments);
        assert_eq!(record.received_at, t0 + Duration::hours(2));
        assert!(record.embedding.is_none());
    }

    #[test]
    fn test_from_thread_defaults() {
        let t0 = Utc::now();
        let t = thread(vec![message("m1", "a@example.com", None, "x", t0)], &["INBOX"]);
        let record = EmailRecord::from_thread(UserId::new("u"), &t).unwrap();
        assert_eq!(record.subject, NO_SUBJECT);
        assert!(record.is_read);
        assert!(!record.is_starred);

        assert!(EmailRecord::from_thread(UserId::new("u"), &thread(vec![], &[])).is_none());
    }

    #[test]
    fn test_embedding_text() {
        let t0 = Utc::now();
        let t = thread(
            vec![
                message("m1", "alice@example.com", Some("Budget"), "<p>Numbers</p> attached", t0),
                message("m2", "bob@example.com", None, "   ", t0),
            ],
            &[],
        );
        assert_eq!(
            EmailRecord::embedding_text(&t),
            "Subject: Budget. Budget. Budget.\nContent: \n[From: alice@example.com]: Numbers attached"
        );
    }

    #[test]
    fn test_embedding_text_truncates_conversation() {
        let long = "x".repeat(CONVERSATION_LIMIT * 2);
        let t = thread(vec![message("m1", "a", Some("S"), &long, Utc::now())], &[]);
        let text = EmailRecord::embedding_text(&t);
        let content = text.split_once("Content: ").unwrap().1;
        assert_eq!(content.chars().count(), CONVERSATION_LIMIT);
    }

    #[test]
    fn test_empty_embedding_is_dropped() {
        let t = thread(vec![message("m1", "a", Some("S"), "b", Utc::now())], &[]);
        let record = EmailRecord::from_thread(UserId::new("u"), &t)
            .unwrap()
            .with_embedding(Some(Vec::new()));
        assert!(record.embedding.is_none());
    }
}

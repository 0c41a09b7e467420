//! Gmail API response normalization
//!
//! Converts Gmail API responses to mailbox domain models.

use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};

use super::api::{GmailMessage, GmailThread, MessagePart, MessagePayload};
use crate::models::{
    AttachmentRef, MessageHeaders, MessageId, MessageSnapshot, ThreadId, ThreadSnapshot,
};

/// Normalize a full-format Gmail thread
pub fn normalize_thread(gmail_thread: GmailThread) -> ThreadSnapshot {
    let id = ThreadId::new(&gmail_thread.id);

    let messages: Vec<MessageSnapshot> = gmail_thread
        .messages
        .unwrap_or_default()
        .into_iter()
        .map(normalize_message)
        .collect();

    // Thread labels are the union of its messages' labels
    let mut label_ids: Vec<String> = Vec::new();
    for label in messages.iter().flat_map(|m| m.label_ids.iter()) {
        if !label_ids.contains(label) {
            label_ids.push(label.clone());
        }
    }

    let snippet = gmail_thread
        .snippet
        .filter(|s| !s.is_empty())
        .or_else(|| messages.last().map(|m| m.snippet.clone()))
        .map(|s| decode_html_entities(&s))
        .unwrap_or_default();

    ThreadSnapshot {
        id,
        snippet,
        messages,
        label_ids,
    }
}

/// Normalize one message of a thread
fn normalize_message(gmail_msg: GmailMessage) -> MessageSnapshot {
    let id = MessageId::new(&gmail_msg.id);
    let thread_id = ThreadId::new(&gmail_msg.thread_id);

    let internal_date = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    let (headers, text_body, html_body, attachments) = match &gmail_msg.payload {
        Some(payload) => {
            let mut attachments = Vec::new();
            collect_attachments(payload, &mut attachments);
            (
                extract_headers(payload),
                extract_plain_text_body(payload),
                extract_html_body(payload),
                attachments,
            )
        }
        None => (MessageHeaders::default(), None, None, Vec::new()),
    };

    // Gmail's receive time, not the sender-supplied Date header, drives `after:`
    let received_at = internal_date
        .or_else(|| headers.date.as_deref().and_then(parse_date_header))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    MessageSnapshot {
        id,
        thread_id,
        headers,
        snippet: decode_html_entities(&gmail_msg.snippet),
        text_body,
        html_body,
        attachments,
        label_ids: gmail_msg.label_ids.unwrap_or_default(),
        received_at,
    }
}

fn extract_headers(payload: &MessagePayload) -> MessageHeaders {
    MessageHeaders {
        message_id: extract_header(payload, "Message-ID"),
        from: extract_header(payload, "From"),
        to: extract_header(payload, "To"),
        cc: extract_header(payload, "Cc"),
        bcc: extract_header(payload, "Bcc"),
        subject: extract_header(payload, "Subject"),
        date: extract_header(payload, "Date"),
    }
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Parse an RFC 2822 `Date` header, tolerating a trailing "(UTC)" style comment
fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let value = match value.rfind(" (") {
        Some(idx) if value.ends_with(')') => &value[..idx],
        _ => value,
    };
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract plain text body from message payload
fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    // Check if this is a simple message with body data
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/plain"))
    {
        return decode_base64_body(data);
    }

    payload.parts.as_deref().and_then(|parts| find_body_in_parts(parts, "text/plain"))
}

/// Extract HTML body from message payload
fn extract_html_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/html"))
    {
        return decode_base64_body(data);
    }

    payload.parts.as_deref().and_then(|parts| find_body_in_parts(parts, "text/html"))
}

/// Recursively search message parts for the first body of a mime type
///
/// Parts carrying a filename are attachments, not bodies.
fn find_body_in_parts(parts: &[MessagePart], mime_type: &str) -> Option<String> {
    for part in parts {
        let is_attachment = part.filename.as_deref().is_some_and(|f| !f.is_empty());
        if !is_attachment
            && part
                .mime_type
                .as_ref()
                .is_some_and(|m| m.starts_with(mime_type))
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        // Recursively check nested parts
        if let Some(nested) = &part.parts
            && let Some(text) = find_body_in_parts(nested, mime_type)
        {
            return Some(text);
        }
    }

    None
}

/// Collect descriptors for every part that carries a filename
fn collect_attachments(payload: &MessagePayload, out: &mut Vec<AttachmentRef>) {
    if let Some(filename) = payload.filename.as_deref().filter(|f| !f.is_empty()) {
        out.push(AttachmentRef {
            filename: filename.to_string(),
            mime_type: payload.mime_type.clone(),
            attachment_id: payload.body.as_ref().and_then(|b| b.attachment_id.clone()),
        });
    }
    if let Some(parts) = &payload.parts {
        collect_part_attachments(parts, out);
    }
}

fn collect_part_attachments(parts: &[MessagePart], out: &mut Vec<AttachmentRef>) {
    for part in parts {
        if let Some(filename) = part.filename.as_deref().filter(|f| !f.is_empty()) {
            out.push(AttachmentRef {
                filename: filename.to_string(),
                mime_type: part.mime_type.clone(),
                attachment_id: part.body.as_ref().and_then(|b| b.attachment_id.clone()),
            });
        }
        if let Some(nested) = &part.parts {
            collect_part_attachments(nested, out);
        }
    }
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    decode_base64_bytes(data).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decode URL-safe base64 with or without padding
pub(crate) fn decode_base64_bytes(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders.iter().find_map(|decoder| decoder.decode(data).ok())
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

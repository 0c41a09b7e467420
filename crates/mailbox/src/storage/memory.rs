//! In-memory storage implementation
//!
//! Used for tests and for runs that don't need to survive a restart.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{CredentialStore, MailStore};
use crate::models::{EmailRecord, SyncCursor, ThreadId, UserCredential, UserId};

/// In-memory implementation of both storage traits
///
/// Uses HashMaps protected by RwLocks for thread-safe access.
#[derive(Default)]
pub struct InMemoryMailStore {
    credentials: RwLock<HashMap<UserId, UserCredential>>,
    /// user -> thread id -> row
    emails: RwLock<HashMap<UserId, HashMap<String, EmailRecord>>>,
    cursors: RwLock<HashMap<UserId, SyncCursor>>,
}

impl InMemoryMailStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_emails(&self, user: &UserId) -> Vec<EmailRecord> {
        let emails = self.emails.read().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<EmailRecord> = emails
            .get(user)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| (Reverse(r.received_at), r.thread_id.0.clone()));
        rows
    }
}

impl CredentialStore for InMemoryMailStore {
    fn get_credential(&self, user: &UserId) -> Result<Option<UserCredential>> {
        let credentials = self.credentials.read().unwrap_or_else(PoisonError::into_inner);
        Ok(credentials.get(user).cloned())
    }

    fn save_credential(&self, credential: UserCredential) -> Result<()> {
        let mut credentials = self.credentials.write().unwrap_or_else(PoisonError::into_inner);
        credentials.insert(credential.user_id.clone(), credential);
        Ok(())
    }
}

impl MailStore for InMemoryMailStore {
    fn upsert_email(&self, mut record: EmailRecord) -> Result<()> {
        let mut emails = self.emails.write().unwrap_or_else(PoisonError::into_inner);
        let rows = emails.entry(record.user_id.clone()).or_default();
        if record.embedding.is_none()
            && let Some(previous) = rows.get_mut(record.thread_id.as_str())
        {
            record.embedding = previous.embedding.take();
        }
        rows.insert(record.thread_id.0.clone(), record);
        Ok(())
    }

    fn get_email(&self, user: &UserId, thread_id: &ThreadId) -> Result<Option<EmailRecord>> {
        let emails = self.emails.read().unwrap_or_else(PoisonError::into_inner);
        Ok(emails
            .get(user)
            .and_then(|rows| rows.get(thread_id.as_str()))
            .cloned())
    }

    fn list_emails(&self, user: &UserId, limit: usize, offset: usize) -> Result<Vec<EmailRecord>> {
        Ok(self
            .sorted_emails(user)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn delete_email(&self, user: &UserId, thread_id: &ThreadId) -> Result<bool> {
        let mut emails = self.emails.write().unwrap_or_else(PoisonError::into_inner);
        Ok(emails
            .get_mut(user)
            .and_then(|rows| rows.remove(thread_id.as_str()))
            .is_some())
    }

    fn count_emails(&self, user: &UserId) -> Result<usize> {
        let emails = self.emails.read().unwrap_or_else(PoisonError::into_inner);
        Ok(emails.get(user).map_or(0, HashMap::len))
    }

    fn latest_received_at(&self, user: &UserId) -> Result<Option<DateTime<Utc>>> {
        let emails = self.emails.read().unwrap_or_else(PoisonError::into_inner);
        Ok(emails
            .get(user)
            .and_then(|rows| rows.values().map(|r| r.received_at).max()))
    }

    fn get_sync_cursor(&self, user: &UserId) -> Result<Option<SyncCursor>> {
        let cursors = self.cursors.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cursors.get(user).cloned())
    }

    fn save_sync_cursor(&self, cursor: SyncCursor) -> Result<()> {
        let mut cursors = self.cursors.write().unwrap_or_else(PoisonError::into_inner);
        cursors.insert(cursor.user_id.clone(), cursor);
        Ok(())
    }

    fn list_embedded(&self, user: &UserId) -> Result<Vec<EmailRecord>> {
        Ok(self
            .sorted_emails(user)
            .into_iter()
            .filter(|r| r.embedding.is_some())
            .collect())
    }
}

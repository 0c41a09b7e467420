//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{EmailRecord, SyncCursor, ThreadId, UserCredential, UserId};

/// Persisted OAuth credentials, one row per user
pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, user: &UserId) -> Result<Option<UserCredential>>;

    /// Insert or replace the user's credential
    fn save_credential(&self, credential: UserCredential) -> Result<()>;
}

/// Trait for synchronized mail storage
///
/// Rows are keyed by (user, thread id) and replaced on upsert, except that a
/// stored embedding survives an upsert carrying none.
pub trait MailStore: Send + Sync {
    /// Insert or replace an email row; a `None` embedding keeps the stored one
    fn upsert_email(&self, record: EmailRecord) -> Result<()>;

    fn get_email(&self, user: &UserId, thread_id: &ThreadId) -> Result<Option<EmailRecord>>;

    /// List a user's emails, newest first
    fn list_emails(&self, user: &UserId, limit: usize, offset: usize) -> Result<Vec<EmailRecord>>;

    /// Returns whether a row was removed
    fn delete_email(&self, user: &UserId, thread_id: &ThreadId) -> Result<bool>;

    fn count_emails(&self, user: &UserId) -> Result<usize>;

    /// Receive time of the user's newest stored email
    fn latest_received_at(&self, user: &UserId) -> Result<Option<DateTime<Utc>>>;

    fn get_sync_cursor(&self, user: &UserId) -> Result<Option<SyncCursor>>;

    fn save_sync_cursor(&self, cursor: SyncCursor) -> Result<()>;

    /// All of a user's emails that carry an embedding
    fn list_embedded(&self, user: &UserId) -> Result<Vec<EmailRecord>>;
}

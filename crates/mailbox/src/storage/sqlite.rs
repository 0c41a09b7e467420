//! SQLite-based mail storage with zstd-compressed bodies

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::{CredentialStore, MailStore};
use crate::models::{EmailRecord, SyncCursor, ThreadId, UserCredential, UserId};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One OAuth credential per user
            CREATE TABLE credentials (
                user_id TEXT PRIMARY KEY,
                access_token TEXT,
                refresh_token TEXT,
                expires_at INTEGER  -- unix millis
            );

            -- Synchronized threads, keyed by (user, thread)
            CREATE TABLE emails (
                user_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                from_addr TEXT,
                to_addr TEXT,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                body BLOB,  -- zstd compressed
                label_ids TEXT NOT NULL DEFAULT '[]',
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                received_at INTEGER NOT NULL,  -- unix millis
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, thread_id)
            );

            CREATE INDEX idx_emails_user_received
                ON emails(user_id, received_at DESC);

            -- Incremental sync position per user
            CREATE TABLE sync_cursors (
                user_id TEXT PRIMARY KEY,
                last_received_at INTEGER NOT NULL,
                last_sync_at INTEGER NOT NULL
            );
            "#,
        ),
        // Migration 2: Semantic vectors
        M::up(
            r#"
            -- Little-endian f32 array; NULL when embedding failed
            ALTER TABLE emails ADD COLUMN embedding BLOB;
            "#,
        ),
    ])
}

const EMAIL_COLUMNS: &str = "user_id, thread_id, from_addr, to_addr, subject, snippet, body,
     label_ids, is_read, is_starred, has_attachments, received_at, embedding";

/// SQLite-based storage for credentials, emails and sync cursors
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (or create) the database at `db_path` and bring the schema up to date
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers run while a sync pass writes
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_emails(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<EmailRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, EmailRow::from_row)?;

        let mut emails = Vec::new();
        for row in rows {
            emails.push(row?.into_record()?);
        }
        Ok(emails)
    }
}

/// Raw column values of an `emails` row
struct EmailRow {
    user_id: String,
    thread_id: String,
    from: Option<String>,
    to: Option<String>,
    subject: String,
    snippet: String,
    body: Option<Vec<u8>>,
    label_ids: String,
    is_read: bool,
    is_starred: bool,
    has_attachments: bool,
    received_at: i64,
    embedding: Option<Vec<u8>>,
}

impl EmailRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            thread_id: row.get(1)?,
            from: row.get(2)?,
            to: row.get(3)?,
            subject: row.get(4)?,
            snippet: row.get(5)?,
            body: row.get(6)?,
            label_ids: row.get(7)?,
            is_read: row.get(8)?,
            is_starred: row.get(9)?,
            has_attachments: row.get(10)?,
            received_at: row.get(11)?,
            embedding: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<EmailRecord> {
        let body = self
            .body
            .map(|compressed| {
                zstd::decode_all(compressed.as_slice())
                    .context("Failed to decompress body")
                    .and_then(|bytes| String::from_utf8(bytes).context("Body is not valid UTF-8"))
            })
            .transpose()?;

        Ok(EmailRecord {
            user_id: UserId::new(self.user_id),
            thread_id: ThreadId::new(self.thread_id),
            from: self.from,
            to: self.to,
            subject: self.subject,
            snippet: self.snippet,
            body,
            label_ids: serde_json::from_str(&self.label_ids).unwrap_or_default(),
            is_read: self.is_read,
            is_starred: self.is_starred,
            has_attachments: self.has_attachments,
            received_at: from_millis(self.received_at),
            embedding: self.embedding.as_deref().map(decode_vector),
        })
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl CredentialStore for SqliteMailStore {
    fn get_credential(&self, user: &UserId) -> Result<Option<UserCredential>> {
        let conn = self.conn();

        let row: Option<(Option<String>, Option<String>, Option<i64>)> = conn
            .query_row(
                "SELECT access_token, refresh_token, expires_at
                 FROM credentials WHERE user_id = ?",
                [user.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.map(|(access_token, refresh_token, expires_at)| UserCredential {
            user_id: user.clone(),
            access_token,
            refresh_token,
            expires_at: expires_at.map(from_millis),
        }))
    }

    fn save_credential(&self, credential: UserCredential) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO credentials (user_id, access_token, refresh_token, expires_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at",
            params![
                credential.user_id.as_str(),
                credential.access_token,
                credential.refresh_token,
                credential.expires_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }
}

impl MailStore for SqliteMailStore {
    fn upsert_email(&self, record: EmailRecord) -> Result<()> {
        // zstd level 3 = good balance of speed vs compression
        let body = record
            .body
            .as_ref()
            .map(|text| zstd::encode_all(text.as_bytes(), 3))
            .transpose()
            .context("Failed to compress body")?;
        let label_ids = serde_json::to_string(&record.label_ids)?;
        let embedding = record.embedding.as_deref().map(encode_vector);

        let conn = self.conn();
        conn.execute(
            "INSERT INTO emails
             (user_id, thread_id, from_addr, to_addr, subject, snippet, body, label_ids,
              is_read, is_starred, has_attachments, received_at, updated_at, embedding)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, thread_id) DO UPDATE SET
                from_addr = excluded.from_addr,
                to_addr = excluded.to_addr,
                subject = excluded.subject,
                snippet = excluded.snippet,
                body = excluded.body,
                label_ids = excluded.label_ids,
                is_read = excluded.is_read,
                is_starred = excluded.is_starred,
                has_attachments = excluded.has_attachments,
                received_at = excluded.received_at,
                updated_at = excluded.updated_at,
                embedding = COALESCE(excluded.embedding, emails.embedding)",
            params![
                record.user_id.as_str(),
                record.thread_id.as_str(),
                record.from,
                record.to,
                record.subject,
                record.snippet,
                body,
                label_ids,
                record.is_read,
                record.is_starred,
                record.has_attachments,
                record.received_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
                embedding,
            ],
        )?;
        Ok(())
    }

    fn get_email(&self, user: &UserId, thread_id: &ThreadId) -> Result<Option<EmailRecord>> {
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE user_id = ? AND thread_id = ?");
        Ok(self
            .query_emails(&sql, params![user.as_str(), thread_id.as_str()])?
            .into_iter()
            .next())
    }

    fn list_emails(&self, user: &UserId, limit: usize, offset: usize) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE user_id = ?
             ORDER BY received_at DESC, thread_id ASC
             LIMIT ? OFFSET ?"
        );
        self.query_emails(&sql, params![user.as_str(), limit as i64, offset as i64])
    }

    fn delete_email(&self, user: &UserId, thread_id: &ThreadId) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM emails WHERE user_id = ? AND thread_id = ?",
            [user.as_str(), thread_id.as_str()],
        )?;
        Ok(deleted > 0)
    }

    fn count_emails(&self, user: &UserId) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE user_id = ?",
            [user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn latest_received_at(&self, user: &UserId) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(received_at) FROM emails WHERE user_id = ?",
            [user.as_str()],
            |row| row.get(0),
        )?;
        Ok(latest.map(from_millis))
    }

    fn get_sync_cursor(&self, user: &UserId) -> Result<Option<SyncCursor>> {
        let conn = self.conn();
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT last_received_at, last_sync_at FROM sync_cursors WHERE user_id = ?",
                [user.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(last_received_at, last_sync_at)| SyncCursor {
            user_id: user.clone(),
            last_received_at: from_millis(last_received_at),
            last_sync_at: from_millis(last_sync_at),
        }))
    }

    fn save_sync_cursor(&self, cursor: SyncCursor) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_cursors (user_id, last_received_at, last_sync_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                last_received_at = excluded.last_received_at,
                last_sync_at = excluded.last_sync_at",
            params![
                cursor.user_id.as_str(),
                cursor.last_received_at.timestamp_millis(),
                cursor.last_sync_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn list_embedded(&self, user: &UserId) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE user_id = ? AND embedding IS NOT NULL
             ORDER BY received_at DESC, thread_id ASC"
        );
        self.query_emails(&sql, [user.as_str()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteMailStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        // Use .test.sqlite extension to clearly distinguish from production databases
        let db_path = dir.path().join("mail.test.sqlite");
        let store = SqliteMailStore::new(&db_path).unwrap();
        (store, dir)
    }

    fn make_record(user: &str, thread: &str, received_at: DateTime<Utc>) -> EmailRecord {
        EmailRecord {
            user_id: UserId::new(user),
            thread_id: ThreadId::new(thread),
            from: Some("Alice <alice@example.com>".to_string()),
            to: Some("bob@example.com".to_string()),
            subject: "Quarterly report".to_string(),
            snippet: "Numbers attached".to_string(),
            body: Some("Hi Bob,\n\nThe numbers are attached.".to_string()),
            label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
            is_read: false,
            is_starred: true,
            has_attachments: true,
            received_at,
            embedding: None,
        }
    }

    /// Millisecond precision is what the table keeps
    fn now_millis() -> DateTime<Utc> {
        from_millis(Utc::now().timestamp_millis())
    }

    #[test]
    fn test_email_roundtrip_with_compressed_body() {
        let (store, _dir) = create_test_store();
        let record = make_record("u", "t1", now_millis()).with_embedding(Some(vec![0.5, -1.25, 3.0]));
        store.upsert_email(record.clone()).unwrap();

        let loaded = store
            .get_email(&UserId::new("u"), &ThreadId::new("t1"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_upsert_replaces_row_but_keeps_embedding() {
        let (store, _dir) = create_test_store();
        let user = UserId::new("u");
        store
            .upsert_email(make_record("u", "t1", now_millis()).with_embedding(Some(vec![1.0])))
            .unwrap();

        let mut updated = make_record("u", "t1", now_millis());
        updated.subject = "Updated".to_string();
        updated.body = None;
        updated.label_ids = vec!["INBOX".to_string()];
        updated.is_read = true;
        store.upsert_email(updated).unwrap();

        assert_eq!(store.count_emails(&user).unwrap(), 1);
        let loaded = store.get_email(&user, &ThreadId::new("t1")).unwrap().unwrap();
        assert_eq!(loaded.subject, "Updated");
        assert!(loaded.body.is_none());
        assert!(loaded.is_read);
        assert_eq!(loaded.embedding, Some(vec![1.0]));
        assert_eq!(store.list_embedded(&user).unwrap().len(), 1);

        store
            .upsert_email(make_record("u", "t1", now_millis()).with_embedding(Some(vec![2.0])))
            .unwrap();
        let loaded = store.get_email(&user, &ThreadId::new("t1")).unwrap().unwrap();
        assert_eq!(loaded.embedding, Some(vec![2.0]));
    }

    #[test]
    fn test_list_and_latest() {
        let (store, _dir) = create_test_store();
        let user = UserId::new("u");
        let now = now_millis();
        store.upsert_email(make_record("u", "a", now - Duration::hours(2))).unwrap();
        store.upsert_email(make_record("u", "b", now)).unwrap();
        store.upsert_email(make_record("u", "c", now - Duration::hours(1))).unwrap();
        store.upsert_email(make_record("someone-else", "z", now + Duration::hours(1))).unwrap();

        let ids: Vec<String> = store
            .list_emails(&user, 10, 0)
            .unwrap()
            .into_iter()
            .map(|r| r.thread_id.0)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(store.list_emails(&user, 1, 2).unwrap()[0].thread_id.as_str(), "a");
        assert_eq!(store.latest_received_at(&user).unwrap(), Some(now));
        assert_eq!(store.latest_received_at(&UserId::new("nobody")).unwrap(), None);
    }

    #[test]
    fn test_delete_email() {
        let (store, _dir) = create_test_store();
        let user = UserId::new("u");
        store.upsert_email(make_record("u", "t1", now_millis())).unwrap();

        assert!(store.delete_email(&user, &ThreadId::new("t1")).unwrap());
        assert!(!store.delete_email(&user, &ThreadId::new("t1")).unwrap());
        assert_eq!(store.count_emails(&user).unwrap(), 0);
    }

    #[test]
    fn test_credentials() {
        let (store, _dir) = create_test_store();
        let user = UserId::new("u");
        assert!(store.get_credential(&user).unwrap().is_none());

        let credential = UserCredential {
            user_id: user.clone(),
            access_token: Some("access".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(now_millis() + Duration::hours(1)),
        };
        store.save_credential(credential.clone()).unwrap();
        assert_eq!(store.get_credential(&user).unwrap(), Some(credential));

        store.save_credential(UserCredential::revoked(user.clone())).unwrap();
        assert_eq!(
            store.get_credential(&user).unwrap(),
            Some(UserCredential::revoked(user))
        );
    }

    #[test]
    fn test_sync_cursor() {
        let (store, _dir) = create_test_store();
        let user = UserId::new("u");
        assert!(store.get_sync_cursor(&user).unwrap().is_none());

        let cursor = SyncCursor {
            user_id: user.clone(),
            last_received_at: now_millis() - Duration::minutes(5),
            last_sync_at: now_millis(),
        };
        store.save_sync_cursor(cursor.clone()).unwrap();
        assert_eq!(store.get_sync_cursor(&user).unwrap(), Some(cursor));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("mail.test.sqlite");
        {
            let store = SqliteMailStore::new(&db_path).unwrap();
            store.upsert_email(make_record("u", "t1", now_millis())).unwrap();
        }
        let store = SqliteMailStore::new(&db_path).unwrap();
        assert_eq!(store.count_emails(&UserId::new("u")).unwrap(), 1);
    }
}

//! Per-user sync cursor for incremental sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Position of the last successful sync for a user
///
/// The absence of a cursor means the next run is a full sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub user_id: UserId,
    /// Receive time of the newest item persisted so far
    pub last_received_at: DateTime<Utc>,
    /// When the cursor was last written
    pub last_sync_at: DateTime<Utc>,
}

impl SyncCursor {
    /// A timestamp in the future is clamped to now
    pub fn new(user_id: UserId, last_received_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            last_received_at: last_received_at.min(now),
            last_sync_at: now,
        }
    }

    /// Move the cursor forward, never past now; an older timestamp leaves it
    /// where it is
    pub fn advanced(mut self, received_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        self.last_received_at = self.last_received_at.max(received_at.min(now));
        self.last_sync_at = now;
        self
    }

    /// Provider search query selecting items received after the cursor
    pub fn after_query(&self) -> String {
        format!("after:{}", self.last_received_at.timestamp())
    }
}

//! Per-user snapshot cache backing fast search
//!
//! Each user maps to the thread list produced by their latest sync. Entries
//! are replaced whole, never merged, so threads deleted upstream disappear
//! on the next sync. Entries expire after an idle window, and the cache
//! holds at most `capacity` users, evicting the least recently used one.

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::config::CacheSettings;
use crate::models::{ThreadSnapshot, UserId};

struct CacheEntry {
    threads: Arc<Vec<ThreadSnapshot>>,
    last_access: Mutex<Instant>,
}

impl CacheEntry {
    fn new(threads: Vec<ThreadSnapshot>) -> Self {
        Self {
            threads: Arc::new(threads),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn last_access(&self) -> Instant {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn is_expired(&self, idle_ttl: Duration) -> bool {
        self.last_access().elapsed() >= idle_ttl
    }
}

/// Bounded, idle-expiring map from user to thread snapshots
pub struct LocalCache {
    entries: RwLock<HashMap<UserId, CacheEntry>>,
    capacity: usize,
    idle_ttl: Duration,
}

impl LocalCache {
    pub fn new(capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            idle_ttl,
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.capacity, settings.idle_ttl())
    }

    /// The user's snapshot, if present and not expired
    ///
    /// Reading counts as access and restarts the idle window.
    pub fn get(&self, user: &UserId) -> Option<Arc<Vec<ThreadSnapshot>>> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.get(user)?;
            if !entry.is_expired(self.idle_ttl) {
                entry.touch();
                return Some(Arc::clone(&entry.threads));
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(user).is_some_and(|e| e.is_expired(self.idle_ttl)) {
            entries.remove(user);
            debug!("Cache entry for user {} expired", user);
        }
        None
    }

    /// Replace the user's snapshot wholesale
    pub fn replace(&self, user: &UserId, threads: Vec<ThreadSnapshot>) {
        let count = threads.len();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if !entries.contains_key(user) {
            entries.retain(|_, e| !e.is_expired(self.idle_ttl));
            while entries.len() >= self.capacity {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access())
                    .map(|(u, _)| u.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
                debug!("Evicted cache entry for user {}", oldest);
            }
        }

        entries.insert(user.clone(), CacheEntry::new(threads));
        debug!("Replaced cache entry for user {} with {} threads", user, count);
    }

    pub fn invalidate(&self, user: &UserId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(user);
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(self.idle_ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

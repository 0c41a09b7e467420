//! Per-user run exclusion and cooperative cancellation

use log::debug;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::UserId;

/// Users with a sync currently running
#[derive(Debug, Clone, Default)]
pub struct SyncLeases {
    active: Arc<Mutex<HashSet<UserId>>>,
}

impl SyncLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `user`, or `None` if a run already holds it
    pub fn try_acquire(&self, user: &UserId) -> Option<SyncLease> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(user.clone()) {
            return None;
        }
        Some(SyncLease {
            active: Arc::clone(&self.active),
            user: user.clone(),
        })
    }

    pub fn is_held(&self, user: &UserId) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.contains(user)
    }
}

/// Held for the duration of one run; released on drop
#[derive(Debug)]
pub struct SyncLease {
    active: Arc<Mutex<HashSet<UserId>>>,
    user: UserId,
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(&self.user);
        debug!("Released sync lease for {}", self.user);
    }
}

/// Shared flag checked between pages and before each detail fetch
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_per_user() {
        let leases = SyncLeases::new();
        let alice = UserId::new("alice");

        let lease = leases.try_acquire(&alice).unwrap();
        assert!(leases.try_acquire(&alice).is_none());
        assert!(leases.try_acquire(&UserId::new("bob")).is_some());

        drop(lease);
        assert!(!leases.is_held(&alice));
        assert!(leases.try_acquire(&alice).is_some());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}

//! Storage traits and implementations
//!
//! This module defines the storage abstraction layer for credentials and
//! synchronized mail. Both traits are synchronous; async callers go through
//! [`run_blocking`] so database work stays off the I/O threads.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMailStore;
pub use sqlite::SqliteMailStore;
pub use traits::{CredentialStore, MailStore};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Run a storage call on the blocking pool
pub(crate) async fn run_blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .context("Storage worker panicked")?
}

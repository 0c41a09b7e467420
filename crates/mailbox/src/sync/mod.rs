//! Sync engine for fetching and storing mail
//!
//! Runs are idempotent: every thread is upserted by (user, thread id), so a
//! failed or cancelled run can simply be started again.

mod engine;
mod lease;

pub use engine::{SyncEngine, SyncMode, SyncOutcome, SyncReport};
pub use lease::{CancelToken, SyncLease, SyncLeases};

//! Paged thread sync into the mail store and the search cache

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::lease::{CancelToken, SyncLeases};
use crate::cache::LocalCache;
use crate::config::SyncSettings;
use crate::error::ApiError;
use crate::genai::Embedder;
use crate::gmail::{PageFetcher, PageRequest, ThreadFetcher, ThreadRef};
use crate::models::{EmailRecord, SyncCursor, ThreadId, ThreadSnapshot, UserId};
use crate::storage::{MailStore, run_blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No cursor: one large batch, no query
    Full,
    /// Items received after the cursor, following continuation tokens
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Done,
    Failed,
    Cancelled,
    /// Another run for the same user held the lease
    Skipped,
}

/// Statistics from a sync run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub user: UserId,
    pub mode: Option<SyncMode>,
    pub outcome: SyncOutcome,
    pub pages: usize,
    pub threads_listed: usize,
    pub threads_persisted: usize,
    /// Detail fetches that failed, and threads with no messages
    pub threads_skipped: usize,
    /// Threads saved without a vector
    pub embeddings_failed: usize,
    /// Size of the replaced cache entry; `None` if the cache pass did not replace it
    pub cached_threads: Option<usize>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(user: UserId) -> Self {
        Self {
            user,
            mode: None,
            outcome: SyncOutcome::Done,
            pages: 0,
            threads_listed: 0,
            threads_persisted: 0,
            threads_skipped: 0,
            embeddings_failed: 0,
            cached_threads: None,
            error: None,
            duration_ms: 0,
        }
    }

    fn failed(&mut self, message: String) -> SyncOutcome {
        self.error = Some(message);
        SyncOutcome::Failed
    }
}

/// Pulls a user's threads page by page and keeps the store and cache current
pub struct SyncEngine {
    pages: Arc<dyn PageFetcher>,
    threads: Arc<dyn ThreadFetcher>,
    store: Arc<dyn MailStore>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<LocalCache>,
    settings: SyncSettings,
    leases: SyncLeases,
}

impl SyncEngine {
    pub fn new(
        pages: Arc<dyn PageFetcher>,
        threads: Arc<dyn ThreadFetcher>,
        store: Arc<dyn MailStore>,
        cache: Arc<LocalCache>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            pages,
            threads,
            store,
            embedder: None,
            cache,
            settings,
            leases: SyncLeases::new(),
        }
    }

    /// Compute an embedding for every persisted thread
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn leases(&self) -> &SyncLeases {
        &self.leases
    }

    /// Run one sync for `user`
    ///
    /// Never returns an error: failures end up in the report's outcome and
    /// the log. Items persisted before a failure or cancellation stay valid.
    pub async fn run(&self, user: &UserId, cancel: &CancelToken) -> SyncReport {
        let start = Instant::now();
        let mut report = SyncReport::new(user.clone());

        let Some(_lease) = self.leases.try_acquire(user) else {
            info!("Sync already running for {}, skipping", user);
            report.outcome = SyncOutcome::Skipped;
            return report;
        };

        let mut progress = Progress::default();
        report.outcome = self.store_pass(user, cancel, &mut report, &mut progress).await;
        if report.outcome == SyncOutcome::Done {
            report.cached_threads = self.cache_pass(user, cancel, progress.fetched).await;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Sync for {} finished {:?} ({:?}): {} pages, {} listed, {} persisted, {} skipped, {} without embedding in {}ms",
            user,
            report.outcome,
            report.mode,
            report.pages,
            report.threads_listed,
            report.threads_persisted,
            report.threads_skipped,
            report.embeddings_failed,
            report.duration_ms
        );
        report
    }

    /// Walk the listing into the store, then commit the cursor once
    async fn store_pass(
        &self,
        user: &UserId,
        cancel: &CancelToken,
        report: &mut SyncReport,
        progress: &mut Progress,
    ) -> SyncOutcome {
        let cursor = match self.load_cursor(user).await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!("Failed to read sync cursor for {}: {:#}", user, e);
                return report.failed(format!("{:#}", e));
            }
        };

        let outcome = self
            .walk_pages(user, cursor.as_ref(), cancel, report, progress)
            .await;

        let clean = outcome == SyncOutcome::Done && progress.fetch_failures == 0;
        match self.commit_cursor(user, cursor, clean, progress.newest).await {
            Ok(()) => outcome,
            Err(e) => {
                error!("Failed to save sync cursor for {}: {:#}", user, e);
                match outcome {
                    SyncOutcome::Done => report.failed(format!("{:#}", e)),
                    other => other,
                }
            }
        }
    }

    async fn walk_pages(
        &self,
        user: &UserId,
        cursor: Option<&SyncCursor>,
        cancel: &CancelToken,
        report: &mut SyncReport,
        progress: &mut Progress,
    ) -> SyncOutcome {
        // The query stays fixed for the whole run
        let (mode, batch_size, query) = match cursor {
            Some(c) => (
                SyncMode::Incremental,
                self.settings.incremental_batch_size,
                Some(c.after_query()),
            ),
            None => (SyncMode::Full, self.settings.full_batch_size, None),
        };
        report.mode = Some(mode);
        info!("Starting {:?} sync for {}", mode, user);

        let mut page_token = None;
        loop {
            if cancel.is_cancelled() {
                info!("Sync for {} cancelled before page {}", user, report.pages + 1);
                return SyncOutcome::Cancelled;
            }

            let mut request = PageRequest::new(batch_size).page_token(page_token.take());
            if let Some(q) = &query {
                request = request.query(q.clone());
            }

            let page = match self.pages.list_page(user, &request).await {
                Ok(page) => page,
                Err(e) => {
                    error!("Listing page {} failed for {}: {}", report.pages + 1, user, e);
                    return report.failed(e.to_string());
                }
            };
            report.pages += 1;
            report.threads_listed += page.threads.len();
            debug!(
                "Page {} for {} lists {} threads",
                report.pages,
                user,
                page.threads.len()
            );

            let snapshots = self
                .fetch_details(user, &page.threads, cancel, report, progress)
                .await;
            if let Err(e) = self.persist(user, &snapshots, report, progress).await {
                error!("Failed to persist page {} for {}: {:#}", report.pages, user, e);
                return report.failed(format!("{:#}", e));
            }
            progress
                .fetched
                .extend(snapshots.into_iter().map(|s| (s.id.clone(), s)));

            if cancel.is_cancelled() {
                info!("Sync for {} cancelled after page {}", user, report.pages);
                return SyncOutcome::Cancelled;
            }

            match (mode, page.next_page_token) {
                (SyncMode::Incremental, Some(token)) => page_token = Some(token),
                _ => return SyncOutcome::Done,
            }
        }
    }

    /// Stored cursor, or one derived from the newest stored email
    async fn load_cursor(&self, user: &UserId) -> anyhow::Result<Option<SyncCursor>> {
        let user = user.clone();
        run_blocking(&self.store, move |store| {
            if let Some(cursor) = store.get_sync_cursor(&user)? {
                return Ok(Some(cursor));
            }
            Ok(store
                .latest_received_at(&user)?
                .map(|latest| SyncCursor::new(user.clone(), latest)))
        })
        .await
    }

    /// Save the cursor the next run starts from
    ///
    /// Only a clean run moves it forward. Any other run pins the starting
    /// cursor, so the next run lists whatever this one never fetched.
    async fn commit_cursor(
        &self,
        user: &UserId,
        start: Option<SyncCursor>,
        clean: bool,
        newest: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        // Nothing persisted, so the next run derives the same cursor
        let Some(newest) = newest else {
            return Ok(());
        };
        let cursor = match (clean, start) {
            (true, Some(c)) => c.advanced(newest),
            (true, None) => SyncCursor::new(user.clone(), newest),
            (false, Some(c)) => {
                info!(
                    "Sync for {} incomplete, keeping cursor at {}",
                    user, c.last_received_at
                );
                c
            }
            (false, None) => {
                warn!(
                    "Full sync for {} incomplete; the next run continues from the newest stored email",
                    user
                );
                return Ok(());
            }
        };
        run_blocking(&self.store, move |store| store.save_sync_cursor(cursor)).await
    }

    /// Fetch every listed thread, bounded by the configured fan-out
    ///
    /// Completion order is arbitrary; failed items are logged and skipped.
    async fn fetch_details(
        &self,
        user: &UserId,
        refs: &[ThreadRef],
        cancel: &CancelToken,
        report: &mut SyncReport,
        progress: &mut Progress,
    ) -> Vec<ThreadSnapshot> {
        let thread_ids: Vec<ThreadId> = refs.iter().map(|thread_ref| thread_ref.id.clone()).collect();
        let results: Vec<(ThreadId, Option<Result<ThreadSnapshot, ApiError>>)> = stream::iter(thread_ids)
            .map(|thread_id| {
                async move {
                    if cancel.is_cancelled() {
                        return (thread_id, None);
                    }
                    let result = self.fetch_with_retry(user, &thread_id).await;
                    (thread_id, Some(result))
                }
            })
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut snapshots = Vec::with_capacity(results.len());
        for (thread_id, result) in results {
            match result {
                Some(Ok(snapshot)) => snapshots.push(snapshot),
                Some(Err(e)) => {
                    warn!("Skipping thread {} for {}: {}", thread_id.as_str(), user, e);
                    report.threads_skipped += 1;
                    progress.fetch_failures += 1;
                }
                None => debug!("Not fetching thread {} after cancel", thread_id.as_str()),
            }
        }
        snapshots
    }

    /// Fetch one thread, retrying transient failures with backoff
    async fn fetch_with_retry(
        &self,
        user: &UserId,
        thread_id: &ThreadId,
    ) -> Result<ThreadSnapshot, ApiError> {
        let attempts = self.settings.detail_attempts.max(1);
        let mut delay = self.settings.retry_base_delay();
        let mut attempt = 1;

        loop {
            match self.threads.fetch_thread(user, thread_id).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let wait = delay + Duration::from_millis(rand_jitter(delay));
                    debug!(
                        "Fetching thread {} failed (attempt {}/{}): {}; retrying in {:?}",
                        thread_id.as_str(),
                        attempt,
                        attempts,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upsert the page's threads and remember the newest receive time
    async fn persist(
        &self,
        user: &UserId,
        snapshots: &[ThreadSnapshot],
        report: &mut SyncReport,
        progress: &mut Progress,
    ) -> anyhow::Result<()> {
        let mut records = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let Some(record) = EmailRecord::from_thread(user.clone(), snapshot) else {
                warn!("Skipping thread {} for {}: no messages", snapshot.id.as_str(), user);
                report.threads_skipped += 1;
                continue;
            };
            let embedding = self.embed(user, snapshot, report).await;
            records.push(record.with_embedding(embedding));
        }
        if records.is_empty() {
            return Ok(());
        }

        let latest = records.iter().map(|r| r.received_at).max();
        let count = records.len();
        run_blocking(&self.store, move |store| {
            for record in records {
                store.upsert_email(record)?;
            }
            Ok(())
        })
        .await?;

        report.threads_persisted += count;
        progress.newest = progress.newest.max(latest);
        Ok(())
    }

    async fn embed(
        &self,
        user: &UserId,
        snapshot: &ThreadSnapshot,
        report: &mut SyncReport,
    ) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&EmailRecord::embedding_text(snapshot)).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(
                    "Storing thread {} for {} without embedding: {}",
                    snapshot.id.as_str(),
                    user,
                    e
                );
                report.embeddings_failed += 1;
                None
            }
        }
    }

    /// Replace the user's cache entry with the most recent threads
    ///
    /// Threads this run already fetched are reused instead of fetched again.
    /// Returns the new entry size, or `None` when the entry was left alone.
    async fn cache_pass(
        &self,
        user: &UserId,
        cancel: &CancelToken,
        mut fetched: HashMap<ThreadId, ThreadSnapshot>,
    ) -> Option<usize> {
        let request = PageRequest::new(self.settings.cache_window);
        let page = match self.pages.list_page(user, &request).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Cache listing failed for {}, keeping previous entry: {}", user, e);
                return None;
            }
        };

        let listed = page.threads.len();
        let thread_ids: Vec<ThreadId> =
            page.threads.iter().map(|thread_ref| thread_ref.id.clone()).collect();
        let threads: Vec<Option<ThreadSnapshot>> = stream::iter(thread_ids)
            .map(|thread_id| {
                let reused = fetched.remove(&thread_id);
                async move {
                    if reused.is_some() {
                        return reused;
                    }
                    if cancel.is_cancelled() {
                        return None;
                    }
                    match self.fetch_with_retry(user, &thread_id).await {
                        Ok(snapshot) => Some(snapshot),
                        Err(e) => {
                            warn!(
                                "Leaving thread {} out of the cache for {}: {}",
                                thread_id.as_str(),
                                user,
                                e
                            );
                            None
                        }
                    }
                }
            })
            .buffered(self.concurrency())
            .collect()
            .await;

        if cancel.is_cancelled() {
            return None;
        }

        let threads: Vec<ThreadSnapshot> = threads.into_iter().flatten().collect();
        if listed > 0 && threads.is_empty() {
            warn!(
                "All {} cache fetches failed for {}, keeping previous entry",
                listed, user
            );
            return None;
        }

        let count = threads.len();
        self.cache.replace(user, threads);
        info!("Cached {} threads for {}", count, user);
        Some(count)
    }

    fn concurrency(&self) -> usize {
        self.settings.detail_concurrency.max(1)
    }
}

/// What the store pass has done so far
#[derive(Default)]
struct Progress {
    /// Receive time of the newest persisted thread
    newest: Option<DateTime<Utc>>,
    fetch_failures: usize,
    fetched: HashMap<ThreadId, ThreadSnapshot>,
}

/// Random jitter below `bound` (in milliseconds)
fn rand_jitter(bound: Duration) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let bound = (bound.as_millis() as u64).max(1);
    let hasher = RandomState::new().build_hasher();
    hasher.finish() % bound
}

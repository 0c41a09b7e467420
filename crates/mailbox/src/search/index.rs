//! Fuzzy ranking of cached thread snapshots

use serde::Serialize;
use std::sync::Arc;

use super::fuzzy::weighted_ratio;
use crate::cache::LocalCache;
use crate::models::{MessageSnapshot, ThreadSnapshot, UserId};

/// A thread that matched a query, with its 0-100 score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub thread: ThreadSnapshot,
    pub score: u8,
}

/// Scores cached snapshots against free-text queries
pub struct FuzzyIndex {
    cache: Arc<LocalCache>,
    threshold: u8,
}

impl FuzzyIndex {
    pub fn new(cache: Arc<LocalCache>, threshold: u8) -> Self {
        Self { cache, threshold }
    }

    /// Rank the user's cached threads against `query`
    ///
    /// An empty query or a missing cache entry yields no results; there is
    /// no browse-all fallback.
    pub fn search_in_cache(&self, query: &str, user: &UserId) -> Vec<SearchHit> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        match self.cache.get(user) {
            Some(threads) => self.rank(query, &threads),
            None => Vec::new(),
        }
    }

    /// Keep threads scoring strictly above the threshold, best first
    ///
    /// Ties keep their input order.
    pub fn rank(&self, query: &str, threads: &[ThreadSnapshot]) -> Vec<SearchHit> {
        let query = query.to_lowercase();
        if query.trim().is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = threads
            .iter()
            .filter_map(|thread| {
                let score = score_thread(&query, thread);
                (score > self.threshold).then(|| SearchHit {
                    thread: thread.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.cmp(&a.score));
        hits
    }
}

/// Best message score within a thread
pub(crate) fn score_thread(query: &str, thread: &ThreadSnapshot) -> u8 {
    thread
        .messages
        .iter()
        .map(|message| score_message(query, message))
        .max()
        .unwrap_or(0)
}

fn score_message(query: &str, message: &MessageSnapshot) -> u8 {
    [message.subject(), message.sender(), message.snippet.as_str()]
        .into_iter()
        .map(|field| weighted_ratio(query, field))
        .max()
        .unwrap_or(0)
}

//! Nearest-neighbour search over stored thread embeddings

use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::genai::Embedder;
use crate::models::{EmailRecord, UserId};
use crate::storage::{MailStore, run_blocking};

/// A stored email and its distance from the query vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticHit {
    pub email: EmailRecord,
    pub distance: f32,
}

pub struct SemanticSearch {
    store: Arc<dyn MailStore>,
    embedder: Arc<dyn Embedder>,
    max_distance: f32,
    limit: usize,
}

impl SemanticSearch {
    pub fn new(
        store: Arc<dyn MailStore>,
        embedder: Arc<dyn Embedder>,
        max_distance: f32,
        limit: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            max_distance,
            limit,
        }
    }

    /// Embed `query` and return the closest stored emails of `user`
    ///
    /// Failures are logged and produce an empty result.
    pub async fn search(&self, user: &UserId, query: &str) -> Vec<SemanticHit> {
        if query.trim().is_empty() {
            return Vec::new();
        }

        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Failed to embed search query for {}: {}", user, e);
                return Vec::new();
            }
        };

        let user_id = user.clone();
        let max_distance = self.max_distance;
        let limit = self.limit;
        let ranked = run_blocking(&self.store, move |store| {
            let emails = store.list_embedded(&user_id)?;
            Ok(rank_by_distance(&query_vector, emails, max_distance, limit))
        })
        .await;

        match ranked {
            Ok(hits) => {
                debug!("Semantic search for {} returned {} hits", user, hits.len());
                hits
            }
            Err(e) => {
                warn!("Semantic search failed for {}: {:#}", user, e);
                Vec::new()
            }
        }
    }
}

fn rank_by_distance(
    query: &[f32],
    emails: Vec<EmailRecord>,
    max_distance: f32,
    limit: usize,
) -> Vec<SemanticHit> {
    let mut hits: Vec<SemanticHit> = emails
        .into_iter()
        .filter_map(|email| {
            let distance = euclidean_distance(query, email.embedding.as_deref()?)?;
            (distance < max_distance).then_some(SemanticHit { email, distance })
        })
        .collect();

    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    hits.truncate(limit);
    hits
}

/// Euclidean distance, or `None` when the dimensions differ
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

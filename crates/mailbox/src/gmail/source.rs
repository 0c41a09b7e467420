//! Listing and detail seams used by the sync engine
//!
//! [`super::GmailClient`] implements both traits; tests substitute scripted
//! sources.

use async_trait::async_trait;

use crate::error::ApiError;
use crate::models::{ThreadId, ThreadSnapshot, UserId};

/// Parameters of one listing call
///
/// The page token is opaque and owned by the caller; fetchers keep no state
/// between calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    pub max_results: u32,
    pub page_token: Option<String>,
    pub query: Option<String>,
    pub label_id: Option<String>,
    pub include_spam_trash: bool,
}

impl PageRequest {
    pub fn new(max_results: u32) -> Self {
        Self {
            max_results,
            ..Self::default()
        }
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into()).filter(|q: &String| !q.is_empty());
        self
    }

    pub fn page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }

    pub fn label(mut self, label_id: impl Into<String>) -> Self {
        self.label_id = Some(label_id.into());
        self
    }
}

/// Thread listed on a page
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRef {
    pub id: ThreadId,
    pub snippet: Option<String>,
}

/// One page of a thread listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadPage {
    pub threads: Vec<ThreadRef>,
    pub next_page_token: Option<String>,
}

/// Paginated listing of a user's threads
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn list_page(&self, user: &UserId, request: &PageRequest) -> Result<ThreadPage, ApiError>;
}

/// Full detail of a single thread
#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    async fn fetch_thread(&self, user: &UserId, thread_id: &ThreadId) -> Result<ThreadSnapshot, ApiError>;
}

//! Mailbox crate - Gmail sync, search and token lifecycle
//!
//! This crate provides:
//! - OAuth2 token handling with single-flight refresh per user
//! - An authenticated Gmail client that self-heals one 401 per request
//! - A paged sync engine feeding a SQLite store and a per-user cache
//! - Fuzzy search over cached threads and semantic search over embeddings
//! - Thread summaries through the generative language API
//!
//! [`MailboxService`] wires everything together; the pieces are public so
//! callers can assemble their own.

pub mod cache;
pub mod config;
pub mod error;
pub mod genai;
pub mod gmail;
pub mod http;
pub mod models;
pub mod search;
pub mod service;
pub mod storage;
pub mod sync;

pub use cache::LocalCache;
pub use config::{GmailCredentials, MailboxSettings};
pub use error::{ApiError, AuthError, GenAiError, TransportError};
pub use genai::{Embedder, GeminiClient, Summarizer, Summary};
pub use gmail::{
    AuthenticatedClient, GmailClient, GoogleOAuth, PageFetcher, PageRequest, ThreadFetcher,
    ThreadPage, TokenEndpoint, TokenRefresher,
};
pub use http::{HttpRequest, HttpResponse, HttpTransport, UreqTransport};
pub use models::{
    EmailRecord, MessageId, MessageSnapshot, SyncCursor, ThreadId, ThreadSnapshot,
    UserCredential, UserId,
};
pub use search::{FuzzyIndex, SearchHit, SemanticHit, SemanticSearch};
pub use service::MailboxService;
pub use storage::{CredentialStore, InMemoryMailStore, MailStore, SqliteMailStore};
pub use sync::{CancelToken, SyncEngine, SyncMode, SyncOutcome, SyncReport};

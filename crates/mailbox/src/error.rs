//! Error taxonomy shared by the auth, API and sync layers
//!
//! Storage and configuration code uses `anyhow` like the rest of the crate;
//! these typed errors exist where callers need to branch on the cause.

use thiserror::Error;

/// The user has to re-authenticate before any further mailbox access works.
///
/// `Clone` so that one in-flight refresh outcome can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no stored access token for user {0}")]
    NotAuthenticated(String),

    #[error("access token expired and no refresh token is stored for user {0}")]
    NoRefreshToken(String),

    #[error("token endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("request still unauthorized after a token refresh ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("credential store failed: {0}")]
    Store(String),
}

/// Failure of the raw HTTP exchange (connect, TLS, timeout, read)
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure of a call against the mail provider API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("rate limited by upstream ({status})")]
    RateLimited {
        status: u16,
        retry_after: Option<u64>,
    },

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Authorization could not be recovered; the user must sign in again
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }

    /// Worth retrying after a short delay
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } | ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

/// Failure of an embedding or summary call
#[derive(Debug, Error)]
pub enum GenAiError {
    #[error("no API key configured for the generative API")]
    MissingApiKey,

    #[error("nothing to send: input text is empty")]
    EmptyInput,

    #[error("generative API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

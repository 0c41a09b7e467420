//! MailboxService facade
//!
//! Wires the token lifecycle, Gmail client, store, cache, sync engine and
//! search behind one object. Every operation takes the user explicitly.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::LocalCache;
use crate::config::{GmailCredentials, MailboxSettings};
use crate::error::{ApiError, AuthError};
use crate::genai::{FAILED_SUMMARY, GeminiClient, NO_CONTENT_SUMMARY, Summarizer, Summary};
use crate::gmail::{AuthenticatedClient, GmailClient, GoogleOAuth, TokenRefresher};
use crate::http::{HttpTransport, UreqTransport};
use crate::models::{EmailRecord, MessageId, ThreadId, ThreadSnapshot, UserCredential, UserId};
use crate::search::{FuzzyIndex, SearchHit, SemanticHit, SemanticSearch};
use crate::storage::{CredentialStore, MailStore, SqliteMailStore, run_blocking};
use crate::sync::{CancelToken, SyncEngine, SyncReport};

/// Database file inside the config directory
pub const DATABASE_FILE: &str = "mailbox.sqlite";

/// Main service object for mailbox operations
pub struct MailboxService {
    oauth: Arc<GoogleOAuth>,
    tokens: Arc<TokenRefresher>,
    gmail: Arc<GmailClient>,
    store: Arc<dyn MailStore>,
    cache: Arc<LocalCache>,
    engine: Arc<SyncEngine>,
    fuzzy: FuzzyIndex,
    semantic: SemanticSearch,
    summarizer: Arc<dyn Summarizer>,
}

impl MailboxService {
    /// Open the service on the SQLite store in the config directory
    pub fn open(credentials: GmailCredentials, settings: MailboxSettings) -> Result<Self> {
        let dir = config::init()?;
        let store = SqliteMailStore::new(dir.join(DATABASE_FILE))
            .with_context(|| format!("Failed to open {}", DATABASE_FILE))?;
        let transport = Arc::new(UreqTransport::new(settings.http.timeout()));
        Ok(Self::build(credentials, settings, transport, Arc::new(store)))
    }

    /// Assemble the service from a transport and a store
    ///
    /// Embeddings are computed during sync only when a GenAI API key is set.
    pub fn build<S>(
        credentials: GmailCredentials,
        settings: MailboxSettings,
        transport: Arc<dyn HttpTransport>,
        store: Arc<S>,
    ) -> Self
    where
        S: MailStore + CredentialStore + 'static,
    {
        let credential_store: Arc<dyn CredentialStore> = store.clone();
        let mail_store: Arc<dyn MailStore> = store;

        let oauth = Arc::new(GoogleOAuth::new(credentials, transport.clone()));
        let tokens = Arc::new(TokenRefresher::new(
            credential_store,
            oauth.clone(),
            settings.auth.refresh_skew(),
        ));
        let gmail = Arc::new(GmailClient::new(AuthenticatedClient::new(
            transport.clone(),
            tokens.clone(),
        )));
        let cache = Arc::new(LocalCache::from_settings(&settings.cache));
        let has_api_key = settings.genai.api_key.is_some();
        let gemini = Arc::new(GeminiClient::new(transport, settings.genai.clone()));

        let mut engine = SyncEngine::new(
            gmail.clone(),
            gmail.clone(),
            mail_store.clone(),
            cache.clone(),
            settings.sync.clone(),
        );
        if has_api_key {
            engine = engine.with_embedder(gemini.clone());
        } else {
            info!("No GenAI API key configured; syncing without embeddings");
        }

        Self {
            oauth,
            tokens,
            gmail,
            fuzzy: FuzzyIndex::new(cache.clone(), settings.search.fuzzy_threshold),
            semantic: SemanticSearch::new(
                mail_store.clone(),
                gemini.clone(),
                settings.search.semantic_max_distance,
                settings.search.semantic_limit,
            ),
            summarizer: gemini,
            store: mail_store,
            cache,
            engine: Arc::new(engine),
        }
    }

    pub fn gmail(&self) -> &GmailClient {
        &self.gmail
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    pub fn authorize_url(&self, state: Option<&str>) -> String {
        self.oauth.build_authorize_url(state)
    }

    /// Exchange a consent code and store the user's tokens
    pub async fn login(&self, user: &UserId, code: &str) -> Result<UserCredential, AuthError> {
        self.tokens.login(user, code).await
    }

    pub async fn get_valid_token(&self, user: &UserId) -> Result<String, AuthError> {
        self.tokens.get_valid_token(user).await
    }

    pub async fn has_valid_tokens(&self, user: &UserId) -> bool {
        self.tokens.has_valid_tokens(user).await
    }

    /// Revoke the user's tokens and drop their cached threads
    pub async fn revoke(&self, user: &UserId) -> Result<(), AuthError> {
        self.tokens.revoke(user).await?;
        self.cache.invalidate(user);
        Ok(())
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Start a sync in the background
    ///
    /// Best effort: the outcome is only logged.
    pub fn sync(&self, user: &UserId) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let user = user.clone();
        tokio::spawn(async move {
            let report = engine.run(&user, &CancelToken::new()).await;
            if let Some(e) = &report.error {
                error!("Background sync for {} failed: {}", user, e);
            }
        })
    }

    /// Run a sync to completion and return its report
    pub async fn sync_now(&self, user: &UserId, cancel: &CancelToken) -> SyncReport {
        self.engine.run(user, cancel).await
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Fuzzy search over the threads cached by the user's last sync
    pub fn search_in_cache(&self, query: &str, user: &UserId) -> Vec<SearchHit> {
        self.fuzzy.search_in_cache(query, user)
    }

    /// Sync, then search the entry that sync just cached
    ///
    /// For one-shot callers whose process starts with an empty cache. Hits
    /// are empty when the sync left no cache entry; the report says why.
    pub async fn sync_and_search(
        &self,
        user: &UserId,
        query: &str,
        cancel: &CancelToken,
    ) -> (SyncReport, Vec<SearchHit>) {
        let report = self.engine.run(user, cancel).await;
        let hits = self.fuzzy.search_in_cache(query, user);
        (report, hits)
    }

    pub async fn semantic_search(&self, user: &UserId, query: &str) -> Vec<SemanticHit> {
        self.semantic.search(user, query).await
    }

    /// Stored emails, newest first
    pub async fn stored_emails(
        &self,
        user: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EmailRecord>> {
        let user = user.clone();
        run_blocking(&self.store, move |store| store.list_emails(&user, limit, offset)).await
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Fetch a thread live; the cache is never consulted
    pub async fn get_thread_detail(
        &self,
        user: &UserId,
        thread_id: &ThreadId,
    ) -> Result<ThreadSnapshot, ApiError> {
        self.gmail.get_thread(user, thread_id).await
    }

    pub async fn get_attachment(
        &self,
        user: &UserId,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ApiError> {
        self.gmail.get_attachment(user, message_id, attachment_id).await
    }

    /// Summarize the first message of a live-fetched thread
    ///
    /// Summarizer failures are logged and reported in the summary text.
    pub async fn summarize_thread(
        &self,
        user: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Summary, ApiError> {
        let thread = self.gmail.get_thread(user, thread_id).await?;
        let text = thread
            .first_message()
            .and_then(|m| m.body())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(Summary::message(NO_CONTENT_SUMMARY));
        }

        match self.summarizer.summarize(text).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!("Failed to summarize thread {}: {}", thread_id.as_str(), e);
                Ok(Summary::message(FAILED_SUMMARY))
            }
        }
    }

    pub async fn modify_thread_labels(
        &self,
        user: &UserId,
        thread_id: &ThreadId,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError> {
        self.gmail.modify_thread_labels(user, thread_id, add, remove).await
    }

    /// Delete a thread upstream and drop its stored row
    pub async fn delete_thread(&self, user: &UserId, thread_id: &ThreadId) -> Result<(), ApiError> {
        self.gmail.delete_thread(user, thread_id).await?;

        let owner = user.clone();
        let id = thread_id.clone();
        if let Err(e) = run_blocking(&self.store, move |store| store.delete_email(&owner, &id)).await {
            warn!("Deleted thread {} upstream but not locally: {:#}", thread_id.as_str(), e);
        }
        Ok(())
    }

    /// Send an already assembled RFC 822 message
    pub async fn send_raw(
        &self,
        user: &UserId,
        rfc822: &[u8],
        thread_id: Option<&ThreadId>,
    ) -> Result<MessageId, ApiError> {
        self.gmail.send_raw(user, rfc822, thread_id).await
    }
}

//! Configuration loading for the mailbox services
//!
//! Supports loading OAuth credentials from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)
//!
//! Tunables live in `mailbox.json` next to the credentials file; every field
//! has a default so a missing or partial file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Credentials filename in the mailbox config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Settings filename in the mailbox config directory
const SETTINGS_FILE: &str = "mailbox.json";

/// Redirect URI used when none is configured
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080";

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Google Cloud Console credential file format (installed app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl GmailCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials (for production builds)
    /// 2. JSON file (~/.config/mailbox/google-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri_from_env(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        let redirect_uri = installed
            .redirect_uris
            .into_iter()
            .next()
            .unwrap_or_else(redirect_uri_from_env);

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
            redirect_uri,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
            redirect_uri: redirect_uri_from_env(),
        })
    }

    /// Get the default credentials file path (~/.config/mailbox/google-credentials.json)
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }

    /// Check if credentials are available (compile-time, file, or env vars)
    pub fn is_available() -> bool {
        if Self::from_compile_time().is_some() {
            return true;
        }
        if config::config_exists(CREDENTIALS_FILE) {
            return true;
        }
        std::env::var("GMAIL_CLIENT_ID").is_ok() && std::env::var("GMAIL_CLIENT_SECRET").is_ok()
    }
}

fn redirect_uri_from_env() -> String {
    std::env::var("GMAIL_REDIRECT_URI")
        .ok()
        .filter(|uri| !uri.is_empty())
        .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string())
}

/// Tunables for every mailbox component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxSettings {
    pub sync: SyncSettings,
    pub cache: CacheSettings,
    pub search: SearchSettings,
    pub auth: AuthSettings,
    pub http: HttpSettings,
    pub genai: GenAiSettings,
}

impl MailboxSettings {
    /// Load `mailbox.json` from the config directory, or defaults if absent
    ///
    /// `GEMINI_API_KEY` fills in the API key when the file has none.
    pub fn load() -> Result<Self> {
        let mut settings = if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)?
        } else {
            Self::default()
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut settings: Self = config::load_json_file(path)?;
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if self.genai.api_key.is_none() {
            self.genai.api_key = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Page size on a first (full) sync
    pub full_batch_size: u32,
    /// Page size when a cursor exists
    pub incremental_batch_size: u32,
    /// Detail fetches in flight at once
    pub detail_concurrency: usize,
    pub detail_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Most recent threads kept in the search cache
    pub cache_window: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            full_batch_size: 100,
            incremental_batch_size: 50,
            detail_concurrency: 5,
            detail_attempts: 3,
            retry_base_delay_ms: 100,
            cache_window: 100,
        }
    }
}

impl SyncSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Users kept in the cache at once
    pub capacity: usize,
    /// Seconds without access before an entry expires
    pub idle_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            idle_ttl_secs: 30 * 60,
        }
    }
}

impl CacheSettings {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Fuzzy scores must be strictly above this (0-100)
    pub fuzzy_threshold: u8,
    /// Semantic hits must be strictly closer than this (L2)
    pub semantic_max_distance: f32,
    pub semantic_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 60,
            semantic_max_distance: 1.2,
            semantic_limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Tokens with less than this left are refreshed
    pub refresh_skew_secs: i64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_skew_secs: 5 * 60,
        }
    }
}

impl AuthSettings {
    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_skew_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenAiSettings {
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub summary_model: String,
}

impl Default for GenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            embedding_model: "text-embedding-004".to_string(),
            summary_model: "gemini-2.5-flash-lite".to_string(),
        }
    }
}

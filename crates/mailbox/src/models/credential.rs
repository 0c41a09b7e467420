//! OAuth credential record stored per user

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;
use crate::error::AuthError;

/// Token response from the OAuth2 token endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Persisted OAuth state for one user
///
/// Created at login, changed only by a token refresh or an explicit revoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCredential {
    pub user_id: UserId,
    pub access_token: Option<String>,
    /// Once granted, only cleared by [`UserCredential::revoked`]
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserCredential {
    /// Build the credential produced by an authorization-code exchange
    pub fn from_grant(
        user_id: UserId,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            user_id,
            access_token: Some(grant.access_token.clone()),
            refresh_token: grant.refresh_token.clone(),
            expires_at: grant.expires_in.map(|secs| expiry(now, secs)).transpose()?,
        })
    }

    /// Whether the access token can be used without refreshing
    ///
    /// A token is considered expiring when less than `skew` remains. A token
    /// without a known expiry is trusted until the API rejects it.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        if self.access_token.is_none() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at > now + skew,
            None => true,
        }
    }

    /// Apply a refresh response
    ///
    /// The refresh token is only replaced when the response carries one, and
    /// the expiry never moves backwards.
    pub fn refreshed(mut self, grant: &TokenGrant, now: DateTime<Utc>) -> Result<Self, AuthError> {
        let expires_at = grant.expires_in.map(|secs| expiry(now, secs)).transpose()?;
        self.access_token = Some(grant.access_token.clone());
        if let Some(refresh_token) = &grant.refresh_token {
            self.refresh_token = Some(refresh_token.clone());
        }
        if let Some(expires_at) = expires_at {
            self.expires_at = Some(match self.expires_at {
                Some(previous) => previous.max(expires_at),
                None => expires_at,
            });
        }
        Ok(self)
    }

    /// The credential left behind after an explicit revoke
    pub fn revoked(user_id: UserId) -> Self {
        Self {
            user_id,
            access_token: None,
            refresh_token: None,
            expires_at: None,
        }
    }
}

/// `now` plus a token lifetime reported by the endpoint
fn expiry(now: DateTime<Utc>, expires_in: u64) -> Result<DateTime<Utc>, AuthError> {
    i64::try_from(expires_in)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::Refresh(format!("token lifetime {}s is out of range", expires_in)))
}

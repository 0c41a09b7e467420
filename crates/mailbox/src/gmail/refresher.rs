//! Access-token lifecycle with single-flight refresh
//!
//! At most one refresh per user is in flight per [`TokenRefresher`]. The
//! first caller that finds the token expiring inserts a shared future into
//! the in-flight map; every later caller for the same user awaits that same
//! future and sees the same outcome. The future removes its own entry when
//! it settles, panics included, so a failure is never replayed to later
//! callers.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::auth::TokenEndpoint;
use crate::error::AuthError;
use crate::models::{UserCredential, UserId};
use crate::storage::{CredentialStore, run_blocking};

type RefreshFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;
type InFlight = Arc<Mutex<HashMap<UserId, RefreshFuture>>>;

/// Produces valid access tokens, refreshing through the token endpoint
pub struct TokenRefresher {
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    skew: chrono::Duration,
    in_flight: InFlight,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        skew: chrono::Duration,
    ) -> Self {
        Self {
            store,
            endpoint,
            skew,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return a token with at least the skew window left, refreshing if needed
    pub async fn get_valid_token(&self, user: &UserId) -> Result<String, AuthError> {
        let credential = load_credential(&self.store, user)
            .await?
            .ok_or_else(|| AuthError::NotAuthenticated(user.to_string()))?;

        if credential.is_fresh(Utc::now(), self.skew)
            && let Some(token) = credential.access_token
        {
            return Ok(token);
        }

        self.shared_refresh(user, None).await
    }

    /// Refresh after the API rejected `stale_token`
    ///
    /// Skips the freshness fast path. Joins a refresh already in flight, and
    /// returns without calling the endpoint when the stored token has been
    /// replaced since `stale_token` was issued.
    pub async fn force_refresh(&self, user: &UserId, stale_token: &str) -> Result<String, AuthError> {
        self.shared_refresh(user, Some(stale_token.to_string())).await
    }

    /// Exchange an authorization code and store the new credential
    pub async fn login(&self, user: &UserId, code: &str) -> Result<UserCredential, AuthError> {
        let grant = self.endpoint.exchange_code(code).await?;
        if grant.refresh_token.is_none() {
            warn!("Login for user {} returned no refresh token", user);
        }

        let credential = UserCredential::from_grant(user.clone(), &grant, Utc::now())?;
        save_credential(&self.store, credential.clone()).await?;
        info!("Stored credentials for user {}", user);
        Ok(credential)
    }

    /// Revoke upstream (best effort) and clear the stored credential
    pub async fn revoke(&self, user: &UserId) -> Result<(), AuthError> {
        let credential = load_credential(&self.store, user).await?;
        let token = credential.and_then(|c| c.refresh_token.or(c.access_token));

        if let Some(token) = token
            && let Err(e) = self.endpoint.revoke(&token).await
        {
            warn!("Remote revoke failed for user {}: {}", user, e);
        }

        save_credential(&self.store, UserCredential::revoked(user.clone())).await?;
        info!("Revoked credentials for user {}", user);
        Ok(())
    }

    /// Whether a token can be produced without re-authentication
    pub async fn has_valid_tokens(&self, user: &UserId) -> bool {
        match load_credential(&self.store, user).await {
            Ok(Some(credential)) => {
                credential.refresh_token.is_some() || credential.is_fresh(Utc::now(), self.skew)
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Could not read credentials for user {}: {}", user, e);
                false
            }
        }
    }

    /// Get or create the in-flight refresh for `user`
    ///
    /// The lookup and insert happen under one lock, so two callers can never
    /// both create a refresh.
    fn shared_refresh(&self, user: &UserId, stale_token: Option<String>) -> RefreshFuture {
        let mut in_flight = lock(&self.in_flight);
        match in_flight.entry(user.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight token refresh for user {}", user);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let refresh = refresh_task(
                    Arc::clone(&self.store),
                    Arc::clone(&self.endpoint),
                    Arc::clone(&self.in_flight),
                    self.skew,
                    user.clone(),
                    stale_token,
                )
                .boxed()
                .shared();
                entry.insert(refresh.clone());
                refresh
            }
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

async fn refresh_task(
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    in_flight: InFlight,
    skew: chrono::Duration,
    user: UserId,
    stale_token: Option<String>,
) -> Result<String, AuthError> {
    let _entry = InFlightEntry {
        in_flight,
        user: user.clone(),
    };
    AssertUnwindSafe(refresh_once(&store, endpoint.as_ref(), skew, &user, stale_token.as_deref()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!("Token refresh for user {} panicked", user);
            Err(AuthError::Refresh("token refresh panicked".to_string()))
        })
}

/// Removes the user's in-flight entry once the refresh settles
struct InFlightEntry {
    in_flight: InFlight,
    user: UserId,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.user);
    }
}

async fn refresh_once(
    store: &Arc<dyn CredentialStore>,
    endpoint: &dyn TokenEndpoint,
    skew: chrono::Duration,
    user: &UserId,
    stale_token: Option<&str>,
) -> Result<String, AuthError> {
    let credential = load_credential(store, user)
        .await?
        .ok_or_else(|| AuthError::NotAuthenticated(user.to_string()))?;

    // Another refresh may have finished between the caller's read and now
    if let Some(token) = credential.access_token.as_deref()
        && stale_token.is_none_or(|stale| stale != token)
        && credential.is_fresh(Utc::now(), skew)
    {
        debug!("Token for user {} already refreshed", user);
        return Ok(token.to_string());
    }

    let Some(refresh_token) = credential.refresh_token.clone() else {
        warn!("Token for user {} expired and no refresh token is stored", user);
        return Err(AuthError::NoRefreshToken(user.to_string()));
    };

    info!("Refreshing access token for user {}", user);
    let grant = match endpoint.refresh(&refresh_token).await {
        Ok(grant) => grant,
        Err(e) => {
            warn!("Token refresh failed for user {}: {}", user, e);
            return Err(e);
        }
    };

    let updated = match credential.refreshed(&grant, Utc::now()) {
        Ok(updated) => updated,
        Err(e) => {
            warn!("Unusable refresh response for user {}: {}", user, e);
            return Err(e);
        }
    };
    let expires_at = updated.expires_at;
    save_credential(store, updated).await?;
    info!(
        "Refreshed access token for user {} (expires {:?})",
        user, expires_at
    );
    Ok(grant.access_token)
}

async fn load_credential(
    store: &Arc<dyn CredentialStore>,
    user: &UserId,
) -> Result<Option<UserCredential>, AuthError> {
    let user = user.clone();
    run_blocking(store, move |s| s.get_credential(&user))
        .await
        .map_err(|e| AuthError::Store(format!("{:#}", e)))
}

async fn save_credential(
    store: &Arc<dyn CredentialStore>,
    credential: UserCredential,
) -> Result<(), AuthError> {
    run_blocking(store, move |s| s.save_credential(credential))
        .await
        .map_err(|e| AuthError::Store(format!("{:#}", e)))
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<UserId, RefreshFuture>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenGrant;
    use crate::storage::InMemoryMailStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Token endpoint that counts calls and answers after a delay
    struct SlowEndpoint {
        calls: AtomicUsize,
        fail: bool,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    }

    impl SlowEndpoint {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
                refresh_token: None,
                expires_in: Some(3600),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for SlowEndpoint {
        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
            Ok(TokenGrant {
                access_token: format!("access-for-{}", code),
                refresh_token: Some("refresh-1".to_string()),
                expires_in: Some(3600),
                scope: None,
                token_type: Some("Bearer".to_string()),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if self.fail {
                return Err(AuthError::Rejected {
                    status: 400,
                    body: "invalid_grant".to_string(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("access-{}", n),
                refresh_token: self.refresh_token.clone(),
                expires_in: self.expires_in,
                scope: None,
                token_type: Some("Bearer".to_string()),
            })
        }

        async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
            Err(AuthError::Refresh("offline".to_string()))
        }
    }

    fn expired_credential(user: &UserId) -> UserCredential {
        UserCredential {
            user_id: user.clone(),
            access_token: Some("old".to_string()),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(Utc::now() - Duration::minutes(1)),
        }
    }

    fn setup(endpoint: SlowEndpoint, credential: Option<UserCredential>) -> (Arc<TokenRefresher>, Arc<InMemoryMailStore>, Arc<SlowEndpoint>) {
        let store = Arc::new(InMemoryMailStore::new());
        if let Some(credential) = credential {
            store.save_credential(credential).unwrap();
        }
        let endpoint = Arc::new(endpoint);
        let refresher = Arc::new(TokenRefresher::new(
            store.clone(),
            endpoint.clone(),
            Duration::minutes(5),
        ));
        (refresher, store, endpoint)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let user = UserId::new("alice");
        let (refresher, _store, endpoint) =
            setup(SlowEndpoint::new(false), Some(expired_credential(&user)));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let refresher = refresher.clone();
                let user = user.clone();
                tokio::spawn(async move { refresher.get_valid_token(&user).await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(endpoint.calls(), 1);
        assert!(tokens.iter().all(|t| t == "access-1"));
        assert_eq!(refresher.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_replayed() {
        let user = UserId::new("alice");
        let original = expired_credential(&user);
        let (refresher, store, endpoint) = setup(SlowEndpoint::new(true), Some(original.clone()));

        let results = futures::future::join_all((0..5).map(|_| refresher.get_valid_token(&user))).await;
        assert_eq!(endpoint.calls(), 1);
        for result in &results {
            assert!(matches!(result, Err(AuthError::Rejected { status: 400, .. })));
        }

        // Stored state untouched, map cleared
        assert_eq!(store.get_credential(&user).unwrap(), Some(original));
        assert_eq!(refresher.in_flight_len(), 0);

        // The next call tries again instead of replaying the old failure
        assert!(refresher.get_valid_token(&user).await.is_err());
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_fails_and_clears_entry() {
        let user = UserId::new("alice");
        let original = expired_credential(&user);
        let endpoint = SlowEndpoint {
            expires_in: Some(u64::MAX / 2),
            ..SlowEndpoint::new(false)
        };
        let (refresher, store, endpoint) = setup(endpoint, Some(original.clone()));

        let results = futures::future::join_all((0..3).map(|_| refresher.get_valid_token(&user))).await;
        for result in &results {
            assert!(matches!(result, Err(AuthError::Refresh(_))));
        }
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(refresher.in_flight_len(), 0);
        assert_eq!(store.get_credential(&user).unwrap(), Some(original));

        // A later caller starts a new attempt rather than joining a dead one
        assert!(refresher.get_valid_token(&user).await.is_err());
        assert_eq!(endpoint.calls(), 2);
        assert_eq!(refresher.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_panicking_refresh_is_reported_and_cleared() {
        struct PanickingEndpoint;

        #[async_trait]
        impl TokenEndpoint for PanickingEndpoint {
            async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, AuthError> {
                unreachable!()
            }

            async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
                panic!("endpoint bug")
            }

            async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
                Ok(())
            }
        }

        let user = UserId::new("alice");
        let store = Arc::new(InMemoryMailStore::new());
        store.save_credential(expired_credential(&user)).unwrap();
        let refresher = TokenRefresher::new(store, Arc::new(PanickingEndpoint), Duration::minutes(5));

        assert!(matches!(
            refresher.get_valid_token(&user).await,
            Err(AuthError::Refresh(_))
        ));
        assert_eq!(refresher.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_and_moves_expiry_forward() {
        let user = UserId::new("alice");
        let original = expired_credential(&user);
        let (refresher, store, _endpoint) = setup(SlowEndpoint::new(false), Some(original.clone()));

        let token = refresher.get_valid_token(&user).await.unwrap();
        assert_eq!(token, "access-1");

        let stored = store.get_credential(&user).unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("access-1"));
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
        assert!(stored.expires_at > original.expires_at);
    }

    #[tokio::test]
    async fn test_fresh_token_skips_endpoint() {
        let user = UserId::new("alice");
        let mut credential = expired_credential(&user);
        credential.expires_at = Some(Utc::now() + Duration::hours(1));
        let (refresher, _store, endpoint) = setup(SlowEndpoint::new(false), Some(credential));

        assert_eq!(refresher.get_valid_token(&user).await.unwrap(), "old");
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_inside_skew_is_refreshed() {
        let user = UserId::new("alice");
        let mut credential = expired_credential(&user);
        credential.expires_at = Some(Utc::now() + Duration::minutes(2));
        let (refresher, _store, endpoint) = setup(SlowEndpoint::new(false), Some(credential));

        assert_eq!(refresher.get_valid_token(&user).await.unwrap(), "access-1");
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_token() {
        let user = UserId::new("alice");
        let mut credential = expired_credential(&user);
        credential.expires_at = Some(Utc::now() + Duration::hours(1));
        let (refresher, _store, endpoint) = setup(SlowEndpoint::new(false), Some(credential));

        assert_eq!(refresher.force_refresh(&user, "old").await.unwrap(), "access-1");
        assert_eq!(endpoint.calls(), 1);

        // A second 401 on the stale token finds the replacement already stored
        assert_eq!(refresher.force_refresh(&user, "old").await.unwrap(), "access-1");
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let user = UserId::new("nobody");
        let (refresher, _store, _endpoint) = setup(SlowEndpoint::new(false), None);
        assert_eq!(
            refresher.get_valid_token(&user).await,
            Err(AuthError::NotAuthenticated("nobody".to_string()))
        );
        assert!(!refresher.has_valid_tokens(&user).await);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let user = UserId::new("alice");
        let mut credential = expired_credential(&user);
        credential.refresh_token = None;
        let (refresher, _store, endpoint) = setup(SlowEndpoint::new(false), Some(credential));

        assert_eq!(
            refresher.get_valid_token(&user).await,
            Err(AuthError::NoRefreshToken("alice".to_string()))
        );
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_login_then_revoke() {
        let user = UserId::new("alice");
        let (refresher, store, _endpoint) = setup(SlowEndpoint::new(false), None);

        let credential = refresher.login(&user, "code123").await.unwrap();
        assert_eq!(credential.access_token.as_deref(), Some("access-for-code123"));
        assert!(refresher.has_valid_tokens(&user).await);
        assert_eq!(refresher.get_valid_token(&user).await.unwrap(), "access-for-code123");

        // Remote revoke fails in this endpoint; the local state is still cleared
        refresher.revoke(&user).await.unwrap();
        assert_eq!(
            store.get_credential(&user).unwrap(),
            Some(UserCredential::revoked(user.clone()))
        );
        assert!(!refresher.has_valid_tokens(&user).await);
    }
}

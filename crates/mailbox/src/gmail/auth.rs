//! Gmail OAuth2 token endpoint
//!
//! Implements the authorization-code exchange, refresh and revoke calls
//! against Google's OAuth2 endpoints. Token lifecycle (when to refresh, what
//! to persist) lives in [`super::TokenRefresher`].

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

use crate::config::GmailCredentials;
use crate::error::AuthError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::models::TokenGrant;

/// The OAuth2 operations the token lifecycle depends on
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code from the consent redirect
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError>;

    /// Obtain a new access token with a refresh token
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;

    /// Invalidate a token upstream
    async fn revoke(&self, token: &str) -> Result<(), AuthError>;
}

/// Google's OAuth2 endpoints for a configured client
pub struct GoogleOAuth {
    credentials: GmailCredentials,
    transport: Arc<dyn HttpTransport>,
}

impl GoogleOAuth {
    /// Gmail API OAuth2 endpoints
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    const REVOKE_URL: &'static str = "https://oauth2.googleapis.com/revoke";

    /// Required scope for Gmail access (modify allows read + label changes)
    const GMAIL_MODIFY_SCOPE: &'static str = "https://www.googleapis.com/auth/gmail.modify";

    pub fn new(credentials: GmailCredentials, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            credentials,
            transport,
        }
    }

    /// Consent URL the user visits to grant offline access
    pub fn build_authorize_url(&self, state: Option<&str>) -> String {
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
            Self::AUTH_URL,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(&self.credentials.redirect_uri),
            urlencoding::encode(Self::GMAIL_MODIFY_SCOPE),
        );
        if let Some(state) = state {
            url.push_str("&state=");
            url.push_str(&urlencoding::encode(state));
        }
        url
    }

    async fn request_token(&self, fields: Vec<(&str, &str)>) -> Result<TokenGrant, AuthError> {
        let request = HttpRequest::post_form(Self::TOKEN_URL, fields);
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        parse_token_response(&response)
    }
}

fn parse_token_response(response: &HttpResponse) -> Result<TokenGrant, AuthError> {
    if !response.is_success() {
        return Err(AuthError::Rejected {
            status: response.status,
            body: response.text(),
        });
    }

    response
        .json::<TokenGrant>()
        .map_err(|e| AuthError::Refresh(format!("Failed to parse token response: {}", e)))
}

#[async_trait]
impl TokenEndpoint for GoogleOAuth {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        debug!("Exchanging authorization code for tokens");
        self.request_token(vec![
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.request_token(vec![
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        // In the body, so the token never shows up in a logged URL
        let request = HttpRequest::post_form(Self::REVOKE_URL, [("token", token)]);
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        if !response.is_success() {
            warn!("Token revocation returned {}", response.status);
            return Err(AuthError::Rejected {
                status: response.status,
                body: response.text(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::http::RequestBody;
    use std::sync::Mutex;

    struct Scripted {
        response: HttpResponse,
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            Ok(self.response.clone())
        }
    }

    fn oauth(response: HttpResponse) -> (GoogleOAuth, Arc<Scripted>) {
        let transport = Arc::new(Scripted {
            response,
            seen: Mutex::new(Vec::new()),
        });
        let creds = GmailCredentials {
            client_id: "client id".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:8080".to_string(),
        };
        (GoogleOAuth::new(creds, transport.clone()), transport)
    }

    #[test]
    fn test_authorize_url() {
        let (oauth, _) = oauth(HttpResponse::new(200, Vec::new()));
        let url = oauth.build_authorize_url(Some("xyz"));
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=client%20id"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("gmail.modify"));
        assert!(url.ends_with("&state=xyz"));
    }

    #[tokio::test]
    async fn test_refresh_parses_grant_without_refresh_token() {
        let body = r#"{"access_token":"new","expires_in":3599,"scope":"s","token_type":"Bearer"}"#;
        let (oauth, transport) = oauth(HttpResponse::new(200, body));

        let grant = oauth.refresh("r1").await.unwrap();
        assert_eq!(grant.access_token, "new");
        assert_eq!(grant.refresh_token, None);
        assert_eq!(grant.expires_in, Some(3599));

        let seen = transport.seen.lock().unwrap();
        let RequestBody::Form(fields) = &seen[0].body else {
            panic!("expected form body");
        };
        assert!(fields.contains(&("grant_type".to_string(), "refresh_token".to_string())));
        assert!(fields.contains(&("refresh_token".to_string(), "r1".to_string())));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let (oauth, _) = oauth(HttpResponse::new(400, r#"{"error":"invalid_grant"}"#));
        let err = oauth.refresh("revoked").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_revoke_sends_token_in_form_body() {
        let (oauth, transport) = oauth(HttpResponse::new(200, Vec::new()));
        oauth.revoke("secret-refresh").await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://oauth2.googleapis.com/revoke");
        assert!(!seen[0].url.contains("secret-refresh"));
        let RequestBody::Form(fields) = &seen[0].body else {
            panic!("expected form body");
        };
        assert_eq!(fields, &vec![("token".to_string(), "secret-refresh".to_string())]);
    }
}

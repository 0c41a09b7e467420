//! Gmail API HTTP client
//!
//! [`AuthenticatedClient`] attaches the user's bearer token to every request
//! and self-heals a single 401 by forcing a token refresh. [`GmailClient`]
//! builds the mailbox operations on top of it.

use async_trait::async_trait;
use base64::prelude::*;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;

use super::api::{AttachmentResponse, GmailThread, ListThreadsResponse, SentMessage};
use super::normalize::{decode_base64_bytes, normalize_thread};
use super::source::{PageFetcher, PageRequest, ThreadFetcher, ThreadPage, ThreadRef};
use super::TokenRefresher;
use crate::error::{ApiError, AuthError};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::models::{MessageId, ThreadId, ThreadSnapshot, UserId};

/// Sends requests as a user, retrying exactly once on 401
pub struct AuthenticatedClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenRefresher>,
}

impl AuthenticatedClient {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: Arc<TokenRefresher>) -> Self {
        Self { transport, tokens }
    }

    pub fn tokens(&self) -> &Arc<TokenRefresher> {
        &self.tokens
    }

    /// Send `request` with the user's token
    ///
    /// A 401 triggers one forced refresh and one resend. A second 401 is an
    /// [`AuthError::Unauthorized`]; every other failure of the resent request
    /// is returned as is.
    pub async fn send(&self, user: &UserId, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let token = self.tokens.get_valid_token(user).await?;
        let response = self
            .transport
            .execute(request.clone().bearer_auth(&token))
            .await?;

        if response.status != 401 {
            return check_status(response);
        }

        info!("Got 401 for user {}, refreshing token and retrying once", user);
        let token = self.tokens.force_refresh(user, &token).await?;
        let response = self.transport.execute(request.bearer_auth(&token)).await?;

        if response.status == 401 {
            warn!("Still unauthorized after refresh for user {}", user);
            return Err(AuthError::Unauthorized {
                status: response.status,
                body: response.text(),
            }
            .into());
        }
        check_status(response)
    }

    /// Send and decode a JSON response body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        user: &UserId,
        request: HttpRequest,
    ) -> Result<T, ApiError> {
        let response = self.send(user, request).await?;
        response
            .json()
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Map a non-2xx response to an error
fn check_status(response: HttpResponse) -> Result<HttpResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }

    let status = response.status;
    let body = response.text();
    if status == 429 || (status == 403 && is_rate_limit_body(&body)) {
        let retry_after = response
            .header("Retry-After")
            .and_then(|v| v.trim().parse().ok());
        return Err(ApiError::RateLimited {
            status,
            retry_after,
        });
    }

    Err(ApiError::Status { status, body })
}

/// Gmail reports quota exhaustion as 403 with a reason in the body
fn is_rate_limit_body(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("ratelimitexceeded") || body.contains("quota") || body.contains("rate limit")
}

/// Gmail API client for one or more users
pub struct GmailClient {
    http: AuthenticatedClient,
    base_url: String,
}

impl GmailClient {
    /// Gmail API base URL for the authenticated user
    pub const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1/users/me";

    pub fn new(http: AuthenticatedClient) -> Self {
        Self::with_base_url(http, Self::BASE_URL)
    }

    /// Point the client at a different API root (tests, proxies)
    pub fn with_base_url(http: AuthenticatedClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn http(&self) -> &AuthenticatedClient {
        &self.http
    }

    /// List one page of threads
    ///
    /// # Arguments
    /// * `request` - Page size (1-500), continuation token and filters
    pub async fn list_threads(&self, user: &UserId, request: &PageRequest) -> Result<ThreadPage, ApiError> {
        let url = self.threads_url(request)?;
        let list: ListThreadsResponse = self.http.send_json(user, HttpRequest::get(url)).await?;

        let threads = list
            .threads
            .unwrap_or_default()
            .into_iter()
            .map(|t| ThreadRef {
                id: ThreadId::new(t.id),
                snippet: t.snippet,
            })
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn threads_url(&self, request: &PageRequest) -> Result<String, ApiError> {
        let mut params: Vec<(&str, String)> =
            vec![("maxResults", request.max_results.clamp(1, 500).to_string())];
        if let Some(token) = &request.page_token {
            params.push(("pageToken", token.clone()));
        }
        if let Some(query) = &request.query {
            params.push(("q", query.clone()));
        }
        if let Some(label) = &request.label_id {
            params.push(("labelIds", label.clone()));
        }
        if request.include_spam_trash {
            params.push(("includeSpamTrash", "true".to_string()));
        }

        url::Url::parse_with_params(&format!("{}/threads", self.base_url), &params)
            .map(String::from)
            .map_err(|e| ApiError::Decode(format!("Invalid listing URL: {}", e)))
    }

    /// Get a full thread, normalized
    pub async fn get_thread(&self, user: &UserId, id: &ThreadId) -> Result<ThreadSnapshot, ApiError> {
        let url = format!(
            "{}/threads/{}?format=full",
            self.base_url,
            urlencoding::encode(id.as_str())
        );
        let thread: GmailThread = self.http.send_json(user, HttpRequest::get(url)).await?;
        debug!(
            "Fetched thread {} with {} messages",
            thread.id,
            thread.messages.as_ref().map_or(0, Vec::len)
        );
        Ok(normalize_thread(thread))
    }

    /// Download attachment bytes
    pub async fn get_attachment(
        &self,
        user: &UserId,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let url = format!(
            "{}/messages/{}/attachments/{}",
            self.base_url,
            urlencoding::encode(message_id.as_str()),
            urlencoding::encode(attachment_id)
        );
        let attachment: AttachmentResponse = self.http.send_json(user, HttpRequest::get(url)).await?;

        let data = attachment
            .data
            .ok_or_else(|| ApiError::Decode("Attachment has no data".to_string()))?;
        decode_base64_bytes(&data)
            .ok_or_else(|| ApiError::Decode("Attachment data is not valid base64".to_string()))
    }

    /// Send an already assembled RFC 822 message
    pub async fn send_raw(
        &self,
        user: &UserId,
        rfc822: &[u8],
        thread_id: Option<&ThreadId>,
    ) -> Result<MessageId, ApiError> {
        let mut body = json!({ "raw": BASE64_URL_SAFE_NO_PAD.encode(rfc822) });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id.as_str());
        }

        let url = format!("{}/messages/send", self.base_url);
        let sent: SentMessage = self
            .http
            .send_json(user, HttpRequest::post_json(url, body))
            .await?;
        info!("Sent message {} (thread {:?})", sent.id, sent.thread_id);
        Ok(MessageId::new(sent.id))
    }

    /// Add and remove labels on every message of a thread
    pub async fn modify_thread_labels(
        &self,
        user: &UserId,
        id: &ThreadId,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}/threads/{}/modify",
            self.base_url,
            urlencoding::encode(id.as_str())
        );
        let body = json!({ "addLabelIds": add, "removeLabelIds": remove });
        self.http.send(user, HttpRequest::post_json(url, body)).await?;
        Ok(())
    }

    /// Permanently delete a thread
    pub async fn delete_thread(&self, user: &UserId, id: &ThreadId) -> Result<(), ApiError> {
        let url = format!("{}/threads/{}", self.base_url, urlencoding::encode(id.as_str()));
        self.http.send(user, HttpRequest::delete(url)).await?;
        Ok(())
    }

    /// Permanently delete a single message
    pub async fn delete_message(&self, user: &UserId, id: &MessageId) -> Result<(), ApiError> {
        let url = format!("{}/messages/{}", self.base_url, urlencoding::encode(id.as_str()));
        self.http.send(user, HttpRequest::delete(url)).await?;
        Ok(())
    }
}

#[async_trait]
impl PageFetcher for GmailClient {
    async fn list_page(&self, user: &UserId, request: &PageRequest) -> Result<ThreadPage, ApiError> {
        self.list_threads(user, request).await
    }
}

#[async_trait]
impl ThreadFetcher for GmailClient {
    async fn fetch_thread(&self, user: &UserId, thread_id: &ThreadId) -> Result<ThreadSnapshot, ApiError> {
        self.get_thread(user, thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::gmail::TokenEndpoint;
    use crate::http::Method;
    use crate::models::{TokenGrant, UserCredential};
    use crate::storage::{CredentialStore, InMemoryMailStore};
    use chrono::{Duration, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that replays queued responses and records requests
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<HttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn auth_header(&self, i: usize) -> String {
            let seen = self.seen.lock().unwrap();
            seen[i]
                .headers
                .iter()
                .find(|(n, _)| n == "Authorization")
                .map(|(_, v)| v.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::new("no scripted response"))
        }
    }

    struct CountingEndpoint {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, AuthError> {
            Err(AuthError::Refresh("unused".to_string()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                access_token: format!("fresh-{}", n),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
                token_type: None,
            })
        }

        async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn client(transport: Arc<Scripted>) -> (GmailClient, Arc<CountingEndpoint>) {
        let store = Arc::new(InMemoryMailStore::new());
        store
            .save_credential(UserCredential {
                user_id: UserId::new("alice"),
                access_token: Some("valid".to_string()),
                refresh_token: Some("refresh".to_string()),
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
            .unwrap();
        let endpoint = Arc::new(CountingEndpoint {
            calls: AtomicUsize::new(0),
        });
        let tokens = Arc::new(TokenRefresher::new(store, endpoint.clone(), Duration::minutes(5)));
        let http = AuthenticatedClient::new(transport, tokens);
        (GmailClient::with_base_url(http, "https://gmail.test/v1/users/me"), endpoint)
    }

    fn user() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_401_then_200_retries_once_with_new_token() {
        let transport = Scripted::new(vec![
            HttpResponse::new(401, "expired"),
            HttpResponse::new(200, r#"{"threads":[{"id":"t1"}],"nextPageToken":"p2"}"#),
        ]);
        let (gmail, endpoint) = client(transport.clone());

        let page = gmail.list_threads(&user(), &PageRequest::new(50)).await.unwrap();
        assert_eq!(page.threads.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));

        assert_eq!(transport.calls(), 2);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.auth_header(0), "Bearer valid");
        assert_eq!(transport.auth_header(1), "Bearer fresh-1");
    }

    #[tokio::test]
    async fn test_second_401_is_surfaced() {
        let transport = Scripted::new(vec![
            HttpResponse::new(401, "expired"),
            HttpResponse::new(401, "still expired"),
        ]);
        let (gmail, _) = client(transport.clone());

        let err = gmail.get_thread(&user(), &ThreadId::new("t1")).await.unwrap_err();
        assert!(err.is_auth());
        assert!(matches!(
            err,
            ApiError::Auth(AuthError::Unauthorized { status: 401, .. })
        ));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let transport = Scripted::new(vec![HttpResponse::new(500, "boom")]);
        let (gmail, endpoint) = client(transport.clone());

        let err = gmail.get_thread(&user(), &ThreadId::new("t1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_classification() {
        let mut limited = HttpResponse::new(429, "slow down");
        limited.headers.push(("Retry-After".to_string(), "3".to_string()));
        let transport = Scripted::new(vec![
            limited,
            HttpResponse::new(403, r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#),
            HttpResponse::new(403, r#"{"error":{"message":"insufficient permissions"}}"#),
        ]);
        let (gmail, _) = client(transport);
        let id = ThreadId::new("t1");

        let first = gmail.get_thread(&user(), &id).await.unwrap_err();
        assert!(matches!(
            first,
            ApiError::RateLimited {
                status: 429,
                retry_after: Some(3)
            }
        ));
        let second = gmail.get_thread(&user(), &id).await.unwrap_err();
        assert!(matches!(second, ApiError::RateLimited { status: 403, .. }));
        let third = gmail.get_thread(&user(), &id).await.unwrap_err();
        assert!(matches!(third, ApiError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_list_threads_builds_query() {
        let transport = Scripted::new(vec![HttpResponse::new(200, "{}")]);
        let (gmail, _) = client(transport.clone());

        let request = PageRequest::new(50)
            .query("after:1700000000")
            .page_token(Some("tok".to_string()))
            .label("INBOX");
        let page = gmail.list_threads(&user(), &request).await.unwrap();
        assert!(page.threads.is_empty());
        assert!(page.next_page_token.is_none());

        let seen = transport.seen.lock().unwrap();
        let url = &seen[0].url;
        assert!(url.starts_with("https://gmail.test/v1/users/me/threads?"));
        assert!(url.contains("maxResults=50"));
        assert!(url.contains("pageToken=tok"));
        assert!(url.contains("q=after%3A1700000000"));
        assert!(url.contains("labelIds=INBOX"));
        assert!(!url.contains("includeSpamTrash"));
    }

    #[tokio::test]
    async fn test_mutations() {
        let attachment = format!(r#"{{"size":5,"data":"{}"}}"#, BASE64_URL_SAFE_NO_PAD.encode("hello"));
        let transport = Scripted::new(vec![
            HttpResponse::new(200, r#"{"id":"m9","threadId":"t1"}"#),
            HttpResponse::new(200, "{}"),
            HttpResponse::new(204, ""),
            HttpResponse::new(200, attachment),
        ]);
        let (gmail, _) = client(transport.clone());
        let thread = ThreadId::new("t1");

        let sent = gmail.send_raw(&user(), b"Subject: hi\r\n\r\nbody", Some(&thread)).await.unwrap();
        assert_eq!(sent.as_str(), "m9");
        gmail
            .modify_thread_labels(&user(), &thread, &["STARRED".to_string()], &["UNREAD".to_string()])
            .await
            .unwrap();
        gmail.delete_thread(&user(), &thread).await.unwrap();
        let bytes = gmail
            .get_attachment(&user(), &MessageId::new("m1"), "att-1")
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://gmail.test/v1/users/me/messages/send");
        assert_eq!(seen[1].url, "https://gmail.test/v1/users/me/threads/t1/modify");
        assert_eq!(
            seen[1].body,
            crate::http::RequestBody::Json(json!({
                "addLabelIds": ["STARRED"],
                "removeLabelIds": ["UNREAD"]
            }))
        );
        assert_eq!(seen[2].method, Method::Delete);
        assert_eq!(
            seen[3].url,
            "https://gmail.test/v1/users/me/messages/m1/attachments/att-1"
        );
    }
}

//! HTTP plumbing shared by the Gmail, OAuth and GenAI clients
//!
//! Requests are plain values so that callers can resend them (the 401 retry
//! path) and tests can script responses without a network.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::TransportError;

/// Upper bound for a single response body (attachments can be large)
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// An outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: RequestBody::Json(body),
            ..Self::new(Method::Post, url)
        }
    }

    pub fn post_form<K, V>(url: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self {
            body: RequestBody::Form(fields),
            ..Self::new(Method::Post, url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the bearer credential, replacing any earlier one
    pub fn bearer_auth(mut self, token: &str) -> Self {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
        self.header("Authorization", format!("Bearer {}", token))
    }
}

/// A response of any status
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes requests; non-2xx statuses are responses, not errors
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport over a blocking `ureq` agent
///
/// Each call runs on the blocking pool so the async caller only suspends.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

#[async_trait]
impl HttpTransport for UreqTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || execute_blocking(&agent, request))
            .await
            .map_err(|e| TransportError::new(format!("HTTP worker failed: {}", e)))?
    }
}

fn execute_blocking(agent: &ureq::Agent, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let HttpRequest {
        method,
        url,
        headers,
        body,
    } = request;

    let result = match method {
        Method::Get => {
            let mut req = agent.get(url.as_str());
            for (name, value) in &headers {
                req = req.header(name.as_str(), value.as_str());
            }
            req.call()
        }
        Method::Delete => {
            let mut req = agent.delete(url.as_str());
            for (name, value) in &headers {
                req = req.header(name.as_str(), value.as_str());
            }
            req.call()
        }
        Method::Post => {
            let mut req = agent.post(url.as_str());
            for (name, value) in &headers {
                req = req.header(name.as_str(), value.as_str());
            }
            match body {
                RequestBody::Empty => req.send_empty(),
                RequestBody::Json(value) => req.send_json(&value),
                RequestBody::Form(fields) => req.send_form(
                    fields
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str())),
                ),
            }
        }
    };

    let mut response = result.map_err(|e| transport_error(method, &url, &e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .body_mut()
        .with_config()
        .limit(MAX_BODY_BYTES)
        .read_to_vec()
        .map_err(|e| TransportError::new(format!("Failed to read response body: {}", e)))?;

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// The URL without its query string, which may carry credentials
fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

fn transport_error(method: Method, url: &str, cause: &str) -> TransportError {
    let redacted = redact_url(url);
    TransportError::new(format!(
        "{} {}: {}",
        method_name(method),
        redacted,
        cause.replace(url, redacted)
    ))
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Delete => "DELETE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_hides_query_string() {
        let url = "https://example.com/v1/models/m:embedContent?key=sekrit";
        assert_eq!(redact_url(url), "https://example.com/v1/models/m:embedContent");
        assert_eq!(redact_url("https://example.com/a"), "https://example.com/a");

        let err = transport_error(Method::Post, url, &format!("timeout calling {}", url));
        let message = err.to_string();
        assert!(!message.contains("sekrit"));
        assert!(message.starts_with("POST https://example.com/v1/models/m:embedContent: "));
    }

    #[test]
    fn test_bearer_auth_replaces_existing() {
        let req = HttpRequest::get("https://example.com")
            .bearer_auth("old")
            .header("Accept", "application/json")
            .bearer_auth("new");

        let auth: Vec<_> = req
            .headers
            .iter()
            .filter(|(n, _)| n == "Authorization")
            .collect();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth[0].1, "Bearer new");
        assert_eq!(req.headers.len(), 2);
    }

    #[test]
    fn test_response_helpers() {
        let mut resp = HttpResponse::new(200, br#"{"ok": true}"#.to_vec());
        resp.headers.push(("Retry-After".to_string(), "7".to_string()));

        assert!(resp.is_success());
        assert_eq!(resp.header("retry-after"), Some("7"));
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["ok"], true);
        assert!(!HttpResponse::new(401, Vec::new()).is_success());
    }

    #[test]
    fn test_post_form_collects_fields() {
        let req = HttpRequest::post_form("https://example.com/token", [("grant_type", "refresh_token")]);
        assert_eq!(req.method, Method::Post);
        assert_eq!(
            req.body,
            RequestBody::Form(vec![("grant_type".to_string(), "refresh_token".to_string())])
        );
    }
}

//! Embeddings and summaries from the generative language API

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::config::GenAiSettings;
use crate::error::GenAiError;
use crate::http::{HttpRequest, HttpTransport};

/// Characters of input sent to the embedding model
const EMBED_INPUT_LIMIT: usize = 8000;

/// Bullets kept from a summary
const MAX_BULLETS: usize = 5;

const API_KEY_HEADER: &str = "x-goog-api-key";

pub const NO_CONTENT_SUMMARY: &str = "No content to summarize";
pub const FAILED_SUMMARY: &str = "Failed to summarize";

/// Turns text into a semantic vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenAiError>;
}

/// Produces a short summary of a text
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<Summary, GenAiError>;
}

/// A summary and up to five bullet points drawn from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub bullets: Vec<String>,
}

impl Summary {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let bullets = split_bullets(&text);
        Self { text, bullets }
    }

    /// A summary carrying only a status message
    pub fn message(text: &str) -> Self {
        Self {
            text: text.to_string(),
            bullets: Vec::new(),
        }
    }
}

/// Split on line breaks and sentence ends, keeping the first five pieces
fn split_bullets(text: &str) -> Vec<String> {
    let mut bullets = Vec::new();
    for line in text.lines() {
        let mut start = 0;
        let chars: Vec<(usize, char)> = line.char_indices().collect();
        for (i, &(idx, c)) in chars.iter().enumerate() {
            let at_boundary = matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).is_some_and(|&(_, next)| next.is_whitespace());
            if at_boundary {
                let end = idx + c.len_utf8();
                push_bullet(&mut bullets, &line[start..end]);
                start = end;
            }
        }
        push_bullet(&mut bullets, &line[start..]);
        if bullets.len() >= MAX_BULLETS {
            break;
        }
    }
    bullets.truncate(MAX_BULLETS);
    bullets
}

fn push_bullet(bullets: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        bullets.push(piece.to_string());
    }
}

/// Gemini API client for embeddings and summaries
pub struct GeminiClient {
    transport: Arc<dyn HttpTransport>,
    settings: GenAiSettings,
    base_url: String,
}

impl GeminiClient {
    pub const BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(transport: Arc<dyn HttpTransport>, settings: GenAiSettings) -> Self {
        Self::with_base_url(transport, settings, Self::BASE_URL)
    }

    pub fn with_base_url(
        transport: Arc<dyn HttpTransport>,
        settings: GenAiSettings,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            settings,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    fn api_key(&self) -> Result<&str, GenAiError> {
        self.settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(GenAiError::MissingApiKey)
    }

    /// The key travels as a header; URLs end up in error messages
    async fn post(&self, url: String, body: serde_json::Value) -> Result<serde_json::Value, GenAiError> {
        let request = HttpRequest::post_json(url, body).header(API_KEY_HEADER, self.api_key()?);
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(GenAiError::Status {
                status: response.status,
                body: response.text(),
            });
        }
        response.json().map_err(|e| GenAiError::Decode(e.to_string()))
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenAiError> {
        if text.trim().is_empty() {
            return Err(GenAiError::EmptyInput);
        }
        let text: String = text.chars().take(EMBED_INPUT_LIMIT).collect();

        let model = &self.settings.embedding_model;
        let url = self.model_url(model, "embedContent");
        let body = json!({
            "model": format!("models/{}", model),
            "content": { "parts": [{ "text": text }] }
        });

        let value = self.post(url, body).await?;
        let response: EmbedResponse =
            serde_json::from_value(value).map_err(|e| GenAiError::Decode(e.to_string()))?;
        if response.embedding.values.is_empty() {
            return Err(GenAiError::Decode("embedding has no values".to_string()));
        }
        debug!("Embedded {} chars into {} dims", text.len(), response.embedding.values.len());
        Ok(response.embedding.values)
    }
}

#[async_trait]
impl Summarizer for GeminiClient {
    async fn summarize(&self, text: &str) -> Result<Summary, GenAiError> {
        if text.trim().is_empty() {
            return Err(GenAiError::EmptyInput);
        }

        let prompt = format!(
            "Summarize the following email clearly and concisely.\n\
             Provide ONLY the summary text, with no explanation.\n\n\
             Email:\n{}\n",
            text
        );
        let url = self.model_url(&self.settings.summary_model, "generateContent");
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let value = self.post(url, body).await?;
        let response: GenerateResponse =
            serde_json::from_value(value).map_err(|e| GenAiError::Decode(e.to_string()))?;
        match response.text() {
            Some(summary) => Ok(Summary::from_text(summary)),
            None => {
                warn!("Summary response had no text");
                Ok(Summary::message(FAILED_SUMMARY))
            }
        }
    }
}

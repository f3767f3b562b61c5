//! Gemini `embedContent` client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lattice_core::error::{check_dimension, EmbedError};
use lattice_core::traits::EmbeddingClient;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{error_message, http_client, transport_error};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
}

impl GeminiEmbedder {
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Gemini API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing Gemini model name");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Gemini API key")?,
        );
        let client = http_client(headers, timeout)?;
        let model = model.trim().trim_start_matches("models/").to_string();
        let endpoint = format!("{}/models/{}:embedContent", base_url.trim_end_matches('/'), model);
        Ok(Self { client, endpoint, model })
    }
}

#[async_trait]
impl EmbeddingClient for GeminiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, EmbedError> {
        let request = EmbedContentRequest {
            model: format!("models/{}", self.model),
            content: Content { parts: vec![Part { text }] },
            output_dimensionality: dimension,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error(&e))?;
        if !status.is_success() {
            return Err(EmbedError::api(Some(status.as_u16()), error_message(&body)));
        }
        let parsed: EmbedContentResponse = serde_json::from_str(&body).map_err(|e| {
            let message = format!("failed to parse Gemini embedding response: {e}");
            EmbedError::api(Some(status.as_u16()), message)
        })?;
        let values = parsed.embedding.map(|e| e.values).unwrap_or_default();
        check_dimension(values, dimension)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: String,
    content: Content<'a>,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: Option<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

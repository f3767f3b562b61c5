//! OpenAI-compatible `/embeddings` client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lattice_core::error::{check_dimension, EmbedError};
use lattice_core::traits::EmbeddingClient;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{error_message, http_client, transport_error};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        let client = http_client(headers, timeout)?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model: model.trim().to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: dimension,
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
        let mut parsed: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            let message = format!("failed to parse OpenAI embedding response: {e}");
            EmbedError::api(Some(status.as_u16()), message)
        })?;
        parsed.data.sort_by_key(|entry| entry.index);
        let values = parsed
            .data
            .into_iter()
            .next()
            .map(|entry| entry.embedding)
            .unwrap_or_default();
        check_dimension(values, dimension)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

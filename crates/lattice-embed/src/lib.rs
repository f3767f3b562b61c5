//! Embedding provider adapters behind `lattice_core::traits::EmbeddingClient`.
//!
//! Remote providers normalize HTTP failures into `EmbedError` and validate
//! the returned dimensionality; the fake provider produces deterministic
//! vectors for dry runs and tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lattice_core::config::{BackfillSettings, ProviderKind};
use lattice_core::error::EmbedError;
use lattice_core::traits::EmbeddingClient;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;

pub mod fake;
pub mod gemini;
pub mod openai;

pub use fake::FakeEmbedder;
pub use gemini::GeminiEmbedder;
pub use openai::OpenAiEmbedder;

/// Builds the embedder selected by `settings.provider`.
pub fn build_embedder(settings: &BackfillSettings) -> Result<Arc<dyn EmbeddingClient>> {
    let api_key = settings.embedding_api_key.as_deref().unwrap_or_default();
    let timeout = settings.http_timeout();
    let embedder: Arc<dyn EmbeddingClient> = match settings.provider {
        ProviderKind::Gemini => Arc::new(GeminiEmbedder::new(
            api_key,
            settings.embedding_base_url.as_deref().unwrap_or(gemini::DEFAULT_BASE_URL),
            &settings.embedding_model,
            timeout,
        )?),
        ProviderKind::OpenAi => Arc::new(OpenAiEmbedder::new(
            api_key,
            settings.embedding_base_url.as_deref().unwrap_or(openai::DEFAULT_BASE_URL),
            &settings.embedding_model,
            timeout,
        )?),
        ProviderKind::Fake => {
            tracing::info!("using fake embedder; vectors are not semantically meaningful");
            Arc::new(FakeEmbedder::new())
        }
    };
    Ok(embedder)
}

pub(crate) fn http_client(mut headers: HeaderMap, timeout: Duration) -> Result<Client> {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .context("failed to build embedding HTTP client")
}

pub(crate) fn transport_error(err: &reqwest::Error) -> EmbedError {
    EmbedError::api(err.status().map(|s| s.as_u16()), err.to_string())
}

/// Pulls a readable message out of a provider error body. Both Gemini and
/// OpenAI wrap errors as `{"error": {"message": ..., "status"|"type": ...}}`.
pub(crate) fn error_message(body: &str) -> String {
    let json = serde_json::from_str::<serde_json::Value>(body).unwrap_or_default();
    let error = json.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(serde_json::Value::as_str);
    let kind = error
        .and_then(|e| e.get("status").or_else(|| e.get("type")))
        .and_then(serde_json::Value::as_str);
    match (message, kind) {
        (Some(message), Some(kind)) => format!("{kind}: {message}"),
        (Some(message), None) => message.to_string(),
        _ if body.trim().is_empty() => "<empty body>".to_string(),
        _ => body.trim().to_string(),
    }
}

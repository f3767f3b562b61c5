//! PostgREST row store for Supabase tables.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lattice_core::error::StoreError;
use lattice_core::traits::RowStore;
use lattice_core::types::{BackfillTarget, RowId, RowPage};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde_json::{Map, Value};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    rest_url: String,
}

impl SupabaseStore {
    pub fn new(url: &str, service_key: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!url.trim().is_empty(), "missing Supabase URL");
        anyhow::ensure!(!service_key.trim().is_empty(), "missing Supabase service key");
        let key = service_key.trim();
        let apikey = HeaderValue::from_str(key).context("invalid Supabase service key")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .context("invalid Supabase service key")?;
        let mut headers = HeaderMap::new();
        headers.insert("apikey", apikey);
        headers.insert(AUTHORIZATION, bearer);
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Supabase HTTP client")?;
        let rest_url = format!("{}/rest/v1", url.trim().trim_end_matches('/'));
        Ok(Self { client, rest_url })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_url, table)
    }
}

#[async_trait]
impl RowStore for SupabaseStore {
    async fn fetch_pending(
        &self,
        target: &BackfillTarget,
        after: Option<&RowId>,
        limit: usize,
    ) -> Result<RowPage, StoreError> {
        let mut select = vec![target.id_column.clone()];
        select.extend(target.field_columns().into_iter().filter(|c| c != &target.id_column));
        let mut query: Vec<(&str, String)> = vec![
            ("select", select.join(",")),
            (target.embedding_column.as_str(), "is.null".to_string()),
            ("order", format!("{}.asc", target.id_column)),
            ("limit", limit.to_string()),
        ];
        if let Some(after) = after {
            query.push((target.id_column.as_str(), format!("gt.{after}")));
        }

        let response = self
            .client
            .get(self.table_url(&target.table))
            .query(&query)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let body = success_body(response).await?;
        let raw: Vec<Value> =
            serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))?;

        let last_id = raw
            .last()
            .and_then(|row| row.get(&target.id_column))
            .and_then(RowId::from_json);
        let rows = raw
            .iter()
            .filter_map(|row| {
                let projected = target.project_row(row);
                if projected.is_none() {
                    warn!(table = %target.table, "row without usable id column; skipping");
                }
                projected
            })
            .collect();
        debug!(table = %target.table, scanned = raw.len(), "fetched pending rows");
        Ok(RowPage { rows, scanned: raw.len(), last_id })
    }

    async fn write_embedding(
        &self,
        target: &BackfillTarget,
        id: &RowId,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        let mut body = Map::new();
        body.insert(target.embedding_column.clone(), Value::from(vector.to_vec()));
        let response = self
            .client
            .patch(self.table_url(&target.table))
            .query(&[(target.id_column.as_str(), format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        success_body(response).await?;
        Ok(())
    }
}

async fn success_body(response: Response) -> Result<String, StoreError> {
    let status = response.status();
    let body = response.text().await.map_err(|e| StoreError::Transport(e.to_string()))?;
    if status.is_success() {
        return Ok(body);
    }
    Err(StoreError::Http { status: status.as_u16(), message: postgrest_message(&body) })
}

/// PostgREST errors look like `{"code": "...", "message": "...", "hint": ...}`.
fn postgrest_message(body: &str) -> String {
    let json = serde_json::from_str::<Value>(body).unwrap_or_default();
    let message = json.get("message").and_then(Value::as_str);
    let code = json.get("code").and_then(Value::as_str);
    match (message, code) {
        (Some(message), Some(code)) => format!("{code}: {message}"),
        (Some(message), None) => message.to_string(),
        _ if body.trim().is_empty() => "<empty body>".to_string(),
        _ => body.trim().to_string(),
    }
}

use async_trait::async_trait;

use crate::error::{EmbedError, StoreError};
use crate::types::{BackfillTarget, RowId, RowPage};

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Stable identifier of the model, recorded in progress snapshots.
    fn model_id(&self) -> &str;
    /// Embeds one non-empty text. The returned vector has exactly
    /// `dimension` values or the call fails.
    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, EmbedError>;
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Rows of `target` whose embedding column is unset, ordered by id and
    /// strictly after `after`.
    async fn fetch_pending(
        &self,
        target: &BackfillTarget,
        after: Option<&RowId>,
        limit: usize,
    ) -> Result<RowPage, StoreError>;

    async fn write_embedding(
        &self,
        target: &BackfillTarget,
        id: &RowId,
        vector: &[f32],
    ) -> Result<(), StoreError>;
}

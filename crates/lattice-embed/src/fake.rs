//! Deterministic hashed bag-of-words embedder.
//!
//! Selected with `LATTICE_PROVIDER=fake` for dry runs against a real table
//! without spending API quota, and used by tests.

use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use lattice_core::error::{check_dimension, EmbedError};
use lattice_core::traits::EmbeddingClient;
use twox_hash::XxHash64;

pub const FAKE_MODEL_ID: &str = "fake-xxhash64";

#[derive(Debug, Clone, Default)]
pub struct FakeEmbedder;

impl FakeEmbedder {
    pub fn new() -> Self {
        Self
    }

    /// L2-normalized vector of `dim` values; identical text gives identical
    /// vectors.
    pub fn vector(text: &str, dim: usize) -> Vec<f32> {
        let mut v = vec![0f32; dim];
        if dim == 0 {
            return v;
        }
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % dim;
            let val = (((h >> 32) as u32) as f32) / (u32::MAX as f32);
            v[idx] += val + (i as f32 % 3.0) * 0.01;
        }
        let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt().max(1e-6);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for FakeEmbedder {
    fn model_id(&self) -> &str {
        FAKE_MODEL_ID
    }

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, EmbedError> {
        check_dimension(Self::vector(text, dimension), dimension)
    }
}

//! Embedding vectors, the provider seam and cosine similarity.

use crate::error::StrategyError;
use serde::{Deserialize, Serialize};

pub type Embedding = Vec<f32>;

/// Dimension of the built-in hashing embedder.
pub const DEFAULT_DIMENSION: usize = 768;

/// Turns free text into an embedding. Implementations must be deterministic
/// for a given model so cached query embeddings stay valid.
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> anyhow::Result<Embedding>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// Precomputed embedding of a catalogue track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEmbedding {
    pub track_id: String,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
}

/// Character-hashing embedder used when no external model is wired in.
///
/// Each character adds `sin(code * 0.1) * 0.1` to the slot
/// `(code * (position + 1)) % dimension`; the result is L2-normalized.
/// Identical texts always map to identical vectors.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> anyhow::Result<Embedding> {
        let mut vector = vec![0.0_f32; self.dimension];
        let dimension = self.dimension as u64;

        for (position, ch) in text.chars().enumerate() {
            let code = u64::from(u32::from(ch));
            let slot = code.wrapping_mul(position as u64 + 1) % dimension;
            vector[slot as usize] += ((code as f64 * 0.1).sin() * 0.1) as f32;
        }

        let norm = vector.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value = (f64::from(*value) / norm) as f32;
            }
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        "hashing-v1"
    }
}

/// Cosine similarity in `[-1, 1]`.
///
/// Comparing vectors of different dimensions is a programming error and
/// fails with `DIMENSION_MISMATCH`. A zero vector has similarity 0 with
/// everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, StrategyError> {
    if a.len() != b.len() {
        return Err(StrategyError::DimensionMismatch {
            expected: a.len(),
            found: b.len(),
        });
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0, 0.0, 0.0), |(dot, na, nb), (x, y)| {
        let (x, y) = (f64::from(*x), f64::from(*y));
        (dot + x * y, na + x * x, nb + y * y)
    });

    let magnitude = norm_a.sqrt() * norm_b.sqrt();
    if magnitude == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / magnitude).clamp(-1.0, 1.0))
}

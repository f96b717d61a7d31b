//! Embedding similarity: cosine similarity squashed into a [0, 1] match score.
//!
//! Raw cosine values for the embedding space we use cluster in a narrow positive
//! band, so the score is passed through a logistic centred at 0.5 with
//! steepness 10 to spread that band over [0, 1].

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const LOGISTIC_CENTER: f32 = 0.5;
const LOGISTIC_STEEPNESS: f32 = 10.0;

/// Fixed-length embedding vector produced by an `Embedder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Scale `v` to unit length. Fails for zero (or empty) vectors.
pub fn l2_normalize(v: &Embedding) -> Result<Embedding, ValidationError> {
    let norm = v.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Err(ValidationError::ZeroNorm);
    }
    Ok(Embedding(v.0.iter().map(|x| x / norm).collect()))
}

/// Cosine similarity in [-1, 1].
pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> Result<f32, ValidationError> {
    if a.len() != b.len() {
        return Err(ValidationError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    let a = l2_normalize(a)?;
    let b = l2_normalize(b)?;
    let dot: f32 = a.0.iter().zip(&b.0).map(|(x, y)| x * y).sum();
    Ok(dot.clamp(-1.0, 1.0))
}

/// Interpretable match score in [0, 1].
pub fn score(a: &Embedding, b: &Embedding) -> Result<f32, ValidationError> {
    let cos = cosine_similarity(a, b)?;
    Ok(logistic(cos))
}

fn logistic(cos: f32) -> f32 {
    1.0 / (1.0 + (-LOGISTIC_STEEPNESS * (cos - LOGISTIC_CENTER)).exp())
}

/// Element-wise mean of same-length embeddings.
pub fn mean_embedding(vectors: &[Embedding]) -> Result<Embedding, ValidationError> {
    let first = vectors.first().ok_or(ValidationError::NoEmbeddings)?;
    let dim = first.len();
    let mut acc = vec![0f32; dim];
    for v in vectors {
        if v.len() != dim {
            return Err(ValidationError::LengthMismatch {
                left: dim,
                right: v.len(),
            });
        }
        for (slot, x) in acc.iter_mut().zip(&v.0) {
            *slot += x;
        }
    }
    let n = vectors.len() as f32;
    Ok(Embedding(acc.into_iter().map(|x| x / n).collect()))
}

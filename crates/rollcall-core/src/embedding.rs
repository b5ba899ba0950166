//! Embedding validation, normalization and enrollment quality checks.
//!
//! Every embedding that reaches the matcher or the gallery goes through
//! [`normalize`]; raw model output is never compared directly.

use crate::types::Embedding;
use thiserror::Error;

/// Norm floor below which a vector is treated as a blank or degenerate crop.
pub const NORM_EPSILON: f32 = 1e-6;

/// Allowed deviation of a normalized vector's norm from 1.0.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-2;

/// Default mean pairwise cosine similarity required to accept an enrollment.
pub const DEFAULT_STABILITY_THRESHOLD: f32 = 0.75;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("embedding norm {0:e} is below the degenerate floor")]
    DegenerateNorm(f32),
    #[error("normalized norm {0} drifted outside 1±{UNIT_NORM_TOLERANCE}")]
    NormDrift(f32),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no embeddings supplied")]
    NoSamples,
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

fn check_finite(values: &[f32]) -> Result<(), EmbeddingError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(idx) => Err(EmbeddingError::NonFinite(idx)),
        None => Ok(()),
    }
}

/// Scale a raw vector to unit length.
///
/// Rejects empty input, NaN/Infinity, and vectors whose norm is below
/// [`NORM_EPSILON`]. The result is re-measured and rejected if its norm is not
/// within [`UNIT_NORM_TOLERANCE`] of 1.0.
pub fn normalize(raw: &[f32]) -> Result<Embedding, EmbeddingError> {
    if raw.is_empty() {
        return Err(EmbeddingError::Empty);
    }
    check_finite(raw)?;

    // Squares are taken on the vector scaled into [-1, 1] so finite
    // inputs near f32::MAX cannot overflow.
    let scale = max_abs(raw);
    if scale == 0.0 {
        return Err(EmbeddingError::DegenerateNorm(0.0));
    }
    let scaled: Vec<f32> = raw.iter().map(|v| v / scale).collect();
    let scaled_norm = l2_norm(&scaled);
    let norm = scale * scaled_norm;
    if norm < NORM_EPSILON {
        return Err(EmbeddingError::DegenerateNorm(norm));
    }

    let values: Vec<f32> = scaled.iter().map(|v| v / scaled_norm).collect();
    check_finite(&values)?;

    let check = l2_norm(&values);
    if (check - 1.0).abs() > UNIT_NORM_TOLERANCE {
        return Err(EmbeddingError::NormDrift(check));
    }

    Ok(Embedding::from_unit(values))
}

/// Normalize and additionally require a fixed dimension (the model's D).
pub fn normalize_with_dim(raw: &[f32], expected: usize) -> Result<Embedding, EmbeddingError> {
    if raw.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: raw.len(),
        });
    }
    normalize(raw)
}

/// Element-wise mean of several raw or normalized vectors, re-normalized.
pub fn average<V: AsRef<[f32]>>(samples: &[V]) -> Result<Embedding, EmbeddingError> {
    let first = samples.first().ok_or(EmbeddingError::NoSamples)?.as_ref();
    let dim = first.len();
    if dim == 0 {
        return Err(EmbeddingError::Empty);
    }

    let count = samples.len() as f32;
    let mut mean = vec![0.0f32; dim];
    for sample in samples {
        let values = sample.as_ref();
        if values.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: values.len(),
            });
        }
        check_finite(values)?;
        for (acc, v) in mean.iter_mut().zip(values) {
            *acc += v / count;
        }
    }

    normalize(&mean)
}

/// Cosine similarity of two unit vectors, clamped to [-1, 1].
///
/// Returns `None` when the dimensions differ.
pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> Option<f32> {
    if a.dim() != b.dim() {
        return None;
    }
    let dot: f32 = a
        .values()
        .iter()
        .zip(b.values())
        .map(|(x, y)| x * y)
        .sum();
    Some(dot.clamp(-1.0, 1.0))
}

/// Mean pairwise cosine similarity over all pairs of samples.
///
/// A single sample is trivially stable (1.0). Dimension mismatches are an
/// error rather than a low score.
pub fn stability(samples: &[Embedding]) -> Result<f32, EmbeddingError> {
    let first = samples.first().ok_or(EmbeddingError::NoSamples)?;
    if samples.len() == 1 {
        return Ok(1.0);
    }

    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for (i, a) in samples.iter().enumerate() {
        for b in &samples[i + 1..] {
            let sim = cosine_similarity(a, b).ok_or(EmbeddingError::DimensionMismatch {
                expected: first.dim(),
                actual: b.dim(),
            })?;
            total += sim;
            pairs += 1;
        }
    }

    Ok(total / pairs as f32)
}

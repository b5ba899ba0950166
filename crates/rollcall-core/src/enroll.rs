//! Identity registration with a capture-stability quality gate.

use thiserror::Error;

use crate::attendance;
use crate::embedding::{self, EmbeddingError, DEFAULT_STABILITY_THRESHOLD};
use crate::store::{Gallery, StorageError};
use crate::types::{Embedding, EmployeeTemplate};

pub const DEFAULT_MIN_SAMPLES: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("invalid employee: {0}")]
    InvalidInput(String),
    #[error("need at least {required} valid samples, got {actual}")]
    TooFewSamples { required: usize, actual: usize },
    #[error("sample {index} rejected: {source}")]
    EmbeddingInvalid {
        index: usize,
        #[source]
        source: EmbeddingError,
    },
    #[error("capture unstable: mean pairwise similarity {score:.3} below {threshold:.3}, please retry")]
    Unstable { score: f32, threshold: f32 },
    #[error("samples are inconsistent: {0}")]
    Inconsistent(EmbeddingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationConfig {
    /// Mean pairwise cosine similarity the samples must reach.
    pub stability_threshold: f32,
    pub min_samples: usize,
    /// Embedding dimension the model produces, if known.
    pub expected_dim: Option<usize>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            min_samples: DEFAULT_MIN_SAMPLES,
            expected_dim: None,
        }
    }
}

/// Validate raw samples, check their stability, and store one averaged template.
pub fn register_identity<G: Gallery + ?Sized>(
    gallery: &mut G,
    employee_id: &str,
    name: &str,
    samples: &[Vec<f32>],
    config: &RegistrationConfig,
) -> Result<EmployeeTemplate, RegistrationError> {
    attendance::validate(employee_id, name).map_err(RegistrationError::InvalidInput)?;

    if samples.len() < config.min_samples.max(1) {
        return Err(RegistrationError::TooFewSamples {
            required: config.min_samples.max(1),
            actual: samples.len(),
        });
    }

    let normalized: Vec<Embedding> = samples
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            match config.expected_dim {
                Some(dim) => embedding::normalize_with_dim(raw, dim),
                None => embedding::normalize(raw),
            }
            .map_err(|source| RegistrationError::EmbeddingInvalid { index, source })
        })
        .collect::<Result<_, _>>()?;

    let score = embedding::stability(&normalized).map_err(RegistrationError::Inconsistent)?;
    if score < config.stability_threshold {
        tracing::warn!(
            employee_id,
            score,
            threshold = config.stability_threshold,
            "enrollment capture unstable"
        );
        return Err(RegistrationError::Unstable {
            score,
            threshold: config.stability_threshold,
        });
    }

    let values: Vec<&[f32]> = normalized.iter().map(|e| e.values()).collect();
    let template = embedding::average(&values).map_err(RegistrationError::Inconsistent)?;

    let stored = gallery.insert(employee_id, name.trim(), &[template])?;
    tracing::info!(
        employee_id,
        samples = samples.len(),
        stability = score,
        "identity registered"
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGallery;

    fn jittered(base: &[f32], k: usize) -> Vec<f32> {
        base.iter()
            .enumerate()
            .map(|(i, v)| v + if (i + k) % 3 == 0 { 0.05 } else { -0.02 })
            .collect()
    }

    fn stable_samples() -> Vec<Vec<f32>> {
        let base = [0.5, 0.3, -0.2, 0.7, 0.1, -0.4];
        (0..5).map(|k| jittered(&base, k)).collect()
    }

    #[test]
    fn test_register_stable_samples() {
        let mut gallery = MemoryGallery::new();
        let template = register_identity(
            &mut gallery,
            "E1",
            "Ada Lovelace",
            &stable_samples(),
            &RegistrationConfig::default(),
        )
        .unwrap();
        assert_eq!(template.embeddings.len(), 1);
        let norm: f32 = template.embeddings[0].values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
        assert_eq!(gallery.all().unwrap().len(), 1);
    }

    #[test]
    fn test_register_unstable_rejected() {
        let mut gallery = MemoryGallery::new();
        let samples = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let err = register_identity(&mut gallery, "E1", "Ada", &samples, &RegistrationConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Unstable { .. }));
        assert!(gallery.all().unwrap().is_empty());
    }

    #[test]
    fn test_register_duplicate_id() {
        let mut gallery = MemoryGallery::new();
        let config = RegistrationConfig::default();
        register_identity(&mut gallery, "E1", "Ada", &stable_samples(), &config).unwrap();
        let err = register_identity(&mut gallery, "E1", "Ada", &stable_samples(), &config).unwrap_err();
        assert_eq!(err, RegistrationError::Storage(StorageError::DuplicateId("E1".into())));
    }

    #[test]
    fn test_register_too_few_samples() {
        let mut gallery = MemoryGallery::new();
        let err = register_identity(
            &mut gallery,
            "E1",
            "Ada",
            &stable_samples()[..2],
            &RegistrationConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, RegistrationError::TooFewSamples { required: 3, actual: 2 });
    }

    #[test]
    fn test_register_invalid_sample() {
        let mut gallery = MemoryGallery::new();
        let mut samples = stable_samples();
        samples[3] = vec![0.0; 6];
        let err = register_identity(&mut gallery, "E1", "Ada", &samples, &RegistrationConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::EmbeddingInvalid { index: 3, .. }));
    }

    #[test]
    fn test_register_wrong_dimension() {
        let mut gallery = MemoryGallery::new();
        let config = RegistrationConfig {
            expected_dim: Some(192),
            ..RegistrationConfig::default()
        };
        let err = register_identity(&mut gallery, "E1", "Ada", &stable_samples(), &config).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::EmbeddingInvalid {
                index: 0,
                source: EmbeddingError::DimensionMismatch { expected: 192, actual: 6 }
            }
        ));
    }

    #[test]
    fn test_register_mixed_dimensions() {
        let mut gallery = MemoryGallery::new();
        let mut samples = stable_samples();
        samples[2].push(0.3);
        let err = register_identity(&mut gallery, "E1", "Ada", &samples, &RegistrationConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Inconsistent(EmbeddingError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_register_blank_name() {
        let mut gallery = MemoryGallery::new();
        let err = register_identity(&mut gallery, "E1", "   ", &stable_samples(), &RegistrationConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidInput(_)));
    }
}

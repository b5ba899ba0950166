use serde::{Deserialize, Serialize};

use crate::embedding::{self, EmbeddingError};

/// Bounding box for a detected face in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// L2-normalized face embedding.
///
/// Only constructible through [`embedding::normalize`] (or deserialization,
/// which re-validates), so every value of this type is a finite unit vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Wrap values that have already passed normalization.
    pub(crate) fn from_unit(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]; `None` when dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        embedding::cosine_similarity(self, other)
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

impl<'de> Deserialize<'de> for Embedding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            values: Vec<f32>,
        }
        let raw = Raw::deserialize(deserializer)?;
        embedding::normalize(&raw.values).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(raw: Vec<f32>) -> Result<Self, Self::Error> {
        embedding::normalize(&raw)
    }
}

/// An enrolled employee with one or more reference templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeTemplate {
    pub employee_id: String,
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

/// Accepted identity produced by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub employee_id: String,
    pub name: String,
    /// Best cosine similarity against this employee's templates.
    pub score: f32,
    /// Best score minus the best score of any other employee.
    pub margin: f32,
}

/// Why the matcher declined to name anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    EmptyGallery,
    BelowThreshold,
    Ambiguous,
}

/// Matcher classification for a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaceOutcome {
    Matched(MatchResult),
    Rejected {
        reason: RejectReason,
        /// Closest employee, if the gallery was not empty.
        closest: Option<String>,
        score: f32,
        margin: f32,
    },
    /// The embedding could not be produced or normalized.
    Invalid { error: String },
}

impl FaceOutcome {
    pub fn matched(&self) -> Option<&MatchResult> {
        match self {
            FaceOutcome::Matched(m) => Some(m),
            _ => None,
        }
    }
}

/// One entry of the voting window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "employee_id", rename_all = "snake_case")]
pub enum Vote {
    Identity(String),
    Unknown,
}

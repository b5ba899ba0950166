//! Nearest-neighbor identity matching with margin-based rejection.

use crate::embedding;
use crate::types::{EmployeeTemplate, FaceOutcome, MatchResult, RejectReason};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.82;
pub const DEFAULT_MARGIN_THRESHOLD: f32 = 0.10;

/// Cosine floor; second-best score when only one employee is enrolled.
const SCORE_FLOOR: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    /// Minimum best-template cosine similarity.
    pub similarity_threshold: f32,
    /// Minimum gap between the best and the runner-up employee.
    pub margin_threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            margin_threshold: DEFAULT_MARGIN_THRESHOLD,
        }
    }
}

/// Strategy for classifying a raw probe against the enrolled gallery.
pub trait Matcher {
    fn classify(&self, probe: &[f32], gallery: &[EmployeeTemplate]) -> FaceOutcome;
}

/// Rejection-biased cosine matcher.
///
/// Both conditions must hold to accept: the best score clears the similarity
/// threshold, and it beats every other employee by at least the margin.
#[derive(Debug, Clone, Default)]
pub struct CosineMatcher {
    pub config: MatcherConfig,
}

impl CosineMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }
}

impl Matcher for CosineMatcher {
    fn classify(&self, probe: &[f32], gallery: &[EmployeeTemplate]) -> FaceOutcome {
        let probe = match embedding::normalize(probe) {
            Ok(p) => p,
            Err(e) => {
                return FaceOutcome::Invalid {
                    error: e.to_string(),
                }
            }
        };

        let mut best: Option<(&EmployeeTemplate, f32)> = None;
        let mut second = SCORE_FLOOR;

        for template in gallery {
            // Templates of a different dimension never match.
            let Some(score) = template
                .embeddings
                .iter()
                .filter_map(|e| probe.similarity(e))
                .reduce(f32::max)
            else {
                continue;
            };

            match best {
                Some((_, best_score)) if score <= best_score => {
                    second = second.max(score);
                }
                Some((_, best_score)) => {
                    second = second.max(best_score);
                    best = Some((template, score));
                }
                None => best = Some((template, score)),
            }
        }

        let Some((template, score)) = best else {
            return FaceOutcome::Rejected {
                reason: RejectReason::EmptyGallery,
                closest: None,
                score: 0.0,
                margin: 0.0,
            };
        };

        let margin = score - second;
        let reason = if score < self.config.similarity_threshold {
            Some(RejectReason::BelowThreshold)
        } else if margin < self.config.margin_threshold {
            Some(RejectReason::Ambiguous)
        } else {
            None
        };

        match reason {
            None => FaceOutcome::Matched(MatchResult {
                employee_id: template.employee_id.clone(),
                name: template.name.clone(),
                score,
                margin,
            }),
            Some(reason) => {
                tracing::debug!(
                    closest = %template.employee_id,
                    score,
                    margin,
                    ?reason,
                    "match rejected"
                );
                FaceOutcome::Rejected {
                    reason,
                    closest: Some(template.employee_id.clone()),
                    score,
                    margin,
                }
            }
        }
    }
}

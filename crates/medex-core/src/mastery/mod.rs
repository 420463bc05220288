/// Per-learner, per-theme mastery models.
///
/// Two model families share one canonical output field:
/// - v0: recency-weighted accuracy over day buckets
/// - v1: Bayesian Knowledge Tracing with per-concept parameters
pub mod bkt;
pub mod v0;

pub use bkt::{BktParams, BktState};
pub use v0::{compute_mastery_v0, MasteryComputation, MasteryV0Params, RecencyBucket};

use serde::{Deserialize, Serialize};

// ============================================================================
// MASTERY BANDS
// ============================================================================

/// Mastery band used by revision v0 spacing and analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryBand {
    Weak,
    Medium,
    Strong,
    Mastered,
}

impl MasteryBand {
    /// Classify a mastery score into its band.
    ///
    /// Band edges: weak <= 0.39 < medium <= 0.69 < strong <= 0.84 < mastered.
    pub fn from_score(score: f64) -> Self {
        if score <= 0.39 {
            MasteryBand::Weak
        } else if score <= 0.69 {
            MasteryBand::Medium
        } else if score <= 0.84 {
            MasteryBand::Strong
        } else {
            MasteryBand::Mastered
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryBand::Weak => "weak",
            MasteryBand::Medium => "medium",
            MasteryBand::Strong => "strong",
            MasteryBand::Mastered => "mastered",
        }
    }
}

impl std::fmt::Display for MasteryBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

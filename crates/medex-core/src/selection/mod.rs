/// Adaptive selection engine.
///
/// Produces an ordered, deterministic question list for a (learner, filter)
/// request: derived seed, exclusion pool, theme scoring, constrained
/// Thompson sampling, quota allocation, per-theme item picking, and
/// interleaving.
pub mod engine;
pub mod picker;
pub mod seed;
pub mod themes;

pub use engine::{SelectionEngine, SelectionOutcome, SelectionRequest};
pub use picker::{ItemCandidate, PickResult, PickerStats};
pub use seed::{derive_seed, seeded_rng};
pub use themes::{
    compute_base_priority, compute_due_ratio, compute_recency_penalty, run_theme_selection,
    ThemeCandidate,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionParams {
    pub exclude_seen_within_days: i64,
    pub exclude_seen_within_sessions: i64,
    pub max_candidate_themes: i64,
    // Base-priority weights (sum to 1.0)
    pub w_weakness: f64,
    pub w_due: f64,
    pub w_uncertainty: f64,
    pub w_recency: f64,
    pub epsilon_floor: f64,
    pub recency_tau_days: f64,
    pub due_baseline: f64,
    pub supply_min: i64,
    pub min_theme_count: usize,
    pub max_theme_count: usize,
    pub min_per_theme: usize,
    pub max_per_theme: usize,
    /// Theme mastery below this marks its concepts weak for picking.
    pub weak_mastery_threshold: f64,
    // Desirable-difficulty band over p(correct)
    pub p_low: f64,
    pub p_high: f64,
    pub explore_new_rate: f64,
    pub explore_uncertainty_rate: f64,
    pub high_uncertainty_threshold: f64,
    pub min_attempts_for_rated: i64,
    pub per_theme_item_limit: i64,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            exclude_seen_within_days: 14,
            exclude_seen_within_sessions: 3,
            max_candidate_themes: 30,
            w_weakness: 0.40,
            w_due: 0.30,
            w_uncertainty: 0.20,
            w_recency: 0.10,
            epsilon_floor: 0.05,
            recency_tau_days: 7.0,
            due_baseline: 10.0,
            supply_min: 10,
            min_theme_count: 2,
            max_theme_count: 6,
            min_per_theme: 2,
            max_per_theme: 10,
            weak_mastery_threshold: 0.40,
            p_low: 0.55,
            p_high: 0.80,
            explore_new_rate: 0.10,
            explore_uncertainty_rate: 0.05,
            high_uncertainty_threshold: 100.0,
            min_attempts_for_rated: 5,
            per_theme_item_limit: 100,
        }
    }
}

impl SelectionParams {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

// ============================================================================
// SELECTION LOG
// ============================================================================

/// Persisted record of one selection decision, for replay and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionLogRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub requested_at: DateTime<Utc>,
    pub mode: String,
    pub year: i32,
    pub block_ids: Vec<i64>,
    pub theme_ids_filter: Option<Vec<i64>>,
    pub count: i64,
    pub seed: String,
    pub run_id: Option<Uuid>,
    pub plan: Value,
    pub item_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_weights_sum_to_one() {
        let p = SelectionParams::default();
        let sum = p.w_weakness + p.w_due + p.w_uncertainty + p.w_recency;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_params_merge_from_value() {
        let p = SelectionParams::from_value(&json!({"p_low": 0.5, "max_theme_count": 4}));
        assert_eq!(p.p_low, 0.5);
        assert_eq!(p.max_theme_count, 4);
        // Untouched fields keep defaults
        assert_eq!(p.p_high, 0.80);
        assert_eq!(p.exclude_seen_within_days, 14);
    }
}

/// Mastery v0: recency-weighted accuracy.
///
/// Attempts are bucketed by age (7/30/90 days by default); each bucket's
/// accuracy contributes its weight to the final score. A minimum-attempts
/// floor returns 0.0 with an `insufficient_attempts` reason so a couple of
/// lucky guesses never read as mastery.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{AttemptSample, ItemDifficulty};

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecencyBucket {
    pub days: i64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasteryV0Params {
    pub lookback_days: i64,
    pub min_attempts: usize,
    pub recency_buckets: Vec<RecencyBucket>,
    pub use_difficulty: bool,
    pub difficulty_weight_easy: f64,
    pub difficulty_weight_medium: f64,
    pub difficulty_weight_hard: f64,
}

impl Default for MasteryV0Params {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            min_attempts: 5,
            recency_buckets: vec![
                RecencyBucket {
                    days: 7,
                    weight: 0.50,
                },
                RecencyBucket {
                    days: 30,
                    weight: 0.30,
                },
                RecencyBucket {
                    days: 90,
                    weight: 0.20,
                },
            ],
            use_difficulty: false,
            difficulty_weight_easy: 0.90,
            difficulty_weight_medium: 1.00,
            difficulty_weight_hard: 1.10,
        }
    }
}

impl MasteryV0Params {
    /// Merge a stored params blob over the defaults. Unknown or malformed
    /// blobs fall back to defaults.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    fn difficulty_weight(&self, difficulty: Option<ItemDifficulty>) -> f64 {
        match difficulty {
            Some(ItemDifficulty::Easy) => self.difficulty_weight_easy,
            Some(ItemDifficulty::Hard) => self.difficulty_weight_hard,
            _ => self.difficulty_weight_medium,
        }
    }
}

// ============================================================================
// COMPUTATION
// ============================================================================

/// Canonical v0 output assembled into a MasteryRecord by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct MasteryComputation {
    pub attempts_total: i64,
    pub correct_total: i64,
    pub accuracy_pct: f64,
    pub mastery_score: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub breakdown: Value,
}

/// Compute mastery for one (learner, theme) from its attempt history.
pub fn compute_mastery_v0(
    attempts: &[AttemptSample],
    params: &MasteryV0Params,
    now: DateTime<Utc>,
) -> MasteryComputation {
    let attempts_total = attempts.len() as i64;
    let correct_total = attempts.iter().filter(|a| a.is_correct).count() as i64;
    let accuracy_pct = if attempts_total > 0 {
        round2(correct_total as f64 / attempts_total as f64 * 100.0)
    } else {
        0.0
    };
    let last_attempt_at = attempts.iter().filter_map(|a| a.answered_at).max();

    if attempts.is_empty() {
        return MasteryComputation {
            attempts_total,
            correct_total,
            accuracy_pct,
            mastery_score: 0.0,
            last_attempt_at,
            breakdown: json!({"reason": "no_attempts"}),
        };
    }

    if (attempts_total as usize) < params.min_attempts {
        return MasteryComputation {
            attempts_total,
            correct_total,
            accuracy_pct,
            mastery_score: 0.0,
            last_attempt_at,
            breakdown: json!({
                "reason": "insufficient_attempts",
                "required": params.min_attempts,
                "actual": attempts_total,
            }),
        };
    }

    let (score, breakdown) = recency_weighted_accuracy(attempts, params, now);
    MasteryComputation {
        attempts_total,
        correct_total,
        accuracy_pct,
        mastery_score: score,
        last_attempt_at,
        breakdown,
    }
}

/// The weighted-bucket score itself, with a per-bucket breakdown blob.
pub fn recency_weighted_accuracy(
    attempts: &[AttemptSample],
    params: &MasteryV0Params,
    now: DateTime<Utc>,
) -> (f64, Value) {
    let mut buckets = serde_json::Map::new();
    let mut mastery_score = 0.0;

    for bucket in &params.recency_buckets {
        let cutoff = now - Duration::days(bucket.days);
        let in_bucket: Vec<&AttemptSample> = attempts
            .iter()
            .filter(|a| a.answered_at.map(|t| t >= cutoff).unwrap_or(false))
            .collect();

        if in_bucket.is_empty() {
            buckets.insert(
                format!("{}d", bucket.days),
                json!({
                    "attempts": 0,
                    "correct": 0,
                    "accuracy": 0.0,
                    "weight": bucket.weight,
                    "contribution": 0.0,
                }),
            );
            continue;
        }

        let correct = in_bucket.iter().filter(|a| a.is_correct).count();
        let accuracy = if params.use_difficulty {
            let mut weighted_correct = 0.0;
            let mut weighted_total = 0.0;
            for a in &in_bucket {
                let w = params.difficulty_weight(a.difficulty);
                weighted_total += w;
                if a.is_correct {
                    weighted_correct += w;
                }
            }
            if weighted_total > 0.0 {
                weighted_correct / weighted_total
            } else {
                0.0
            }
        } else {
            correct as f64 / in_bucket.len() as f64
        };

        let contribution = accuracy * bucket.weight;
        mastery_score += contribution;

        buckets.insert(
            format!("{}d", bucket.days),
            json!({
                "attempts": in_bucket.len(),
                "correct": correct,
                "accuracy": round4(accuracy),
                "weight": bucket.weight,
                "contribution": round4(contribution),
            }),
        );
    }

    let mastery_score = round4(mastery_score.clamp(0.0, 1.0));
    let breakdown = json!({
        "total_attempts": attempts.len(),
        "buckets": Value::Object(buckets),
        "mastery_score": mastery_score,
        "use_difficulty": params.use_difficulty,
    });

    (mastery_score, breakdown)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(days_ago: i64, correct: bool, now: DateTime<Utc>) -> AttemptSample {
        AttemptSample {
            is_correct: correct,
            answered_at: Some(now - Duration::days(days_ago)),
            difficulty: None,
        }
    }

    #[test]
    fn test_no_attempts() {
        let result = compute_mastery_v0(&[], &MasteryV0Params::default(), Utc::now());
        assert_eq!(result.mastery_score, 0.0);
        assert_eq!(result.breakdown["reason"], "no_attempts");
    }

    #[test]
    fn test_insufficient_attempts_floors_to_zero() {
        let now = Utc::now();
        let attempts = vec![attempt(1, true, now), attempt(2, true, now)];
        let result = compute_mastery_v0(&attempts, &MasteryV0Params::default(), now);
        assert_eq!(result.mastery_score, 0.0);
        assert_eq!(result.breakdown["reason"], "insufficient_attempts");
        assert_eq!(result.attempts_total, 2);
        assert_eq!(result.accuracy_pct, 100.0);
    }

    #[test]
    fn test_all_correct_recent_attempts_scores_one() {
        let now = Utc::now();
        let attempts: Vec<AttemptSample> = (0..6).map(|i| attempt(i, true, now)).collect();
        let result = compute_mastery_v0(&attempts, &MasteryV0Params::default(), now);
        // All attempts fall in every bucket, so score = 0.5 + 0.3 + 0.2
        assert!((result.mastery_score - 1.0).abs() < 1e-9);
        assert_eq!(result.correct_total, 6);
    }

    #[test]
    fn test_all_wrong_scores_zero() {
        let now = Utc::now();
        let attempts: Vec<AttemptSample> = (0..6).map(|i| attempt(i, false, now)).collect();
        let result = compute_mastery_v0(&attempts, &MasteryV0Params::default(), now);
        assert_eq!(result.mastery_score, 0.0);
    }

    #[test]
    fn test_recent_accuracy_weighs_more_than_old() {
        let now = Utc::now();
        // Recent correct, old wrong
        let recent_strong: Vec<AttemptSample> = (0..5)
            .map(|i| attempt(i, true, now))
            .chain((40..45).map(|i| attempt(i, false, now)))
            .collect();
        // Recent wrong, old correct
        let recent_weak: Vec<AttemptSample> = (0..5)
            .map(|i| attempt(i, false, now))
            .chain((40..45).map(|i| attempt(i, true, now)))
            .collect();

        let params = MasteryV0Params::default();
        let strong = compute_mastery_v0(&recent_strong, &params, now);
        let weak = compute_mastery_v0(&recent_weak, &params, now);
        assert!(strong.mastery_score > weak.mastery_score);
    }

    #[test]
    fn test_score_bounds() {
        let now = Utc::now();
        let attempts: Vec<AttemptSample> = (0..20)
            .map(|i| attempt(i % 90, i % 3 != 0, now))
            .collect();
        let result = compute_mastery_v0(&attempts, &MasteryV0Params::default(), now);
        assert!((0.0..=1.0).contains(&result.mastery_score));
    }

    #[test]
    fn test_difficulty_weighting_changes_bucket_accuracy() {
        let now = Utc::now();
        let mut attempts = Vec::new();
        for i in 0..3 {
            attempts.push(AttemptSample {
                is_correct: true,
                answered_at: Some(now - Duration::days(i)),
                difficulty: Some(ItemDifficulty::Hard),
            });
        }
        for i in 0..3 {
            attempts.push(AttemptSample {
                is_correct: false,
                answered_at: Some(now - Duration::days(i)),
                difficulty: Some(ItemDifficulty::Easy),
            });
        }

        let plain = MasteryV0Params::default();
        let weighted = MasteryV0Params {
            use_difficulty: true,
            ..MasteryV0Params::default()
        };

        let plain_score = compute_mastery_v0(&attempts, &plain, now).mastery_score;
        let weighted_score = compute_mastery_v0(&attempts, &weighted, now).mastery_score;
        // Correct-on-hard counts more than wrong-on-easy costs
        assert!(weighted_score > plain_score);
    }

    #[test]
    fn test_params_from_value_merges_defaults() {
        let params = MasteryV0Params::from_value(&json!({"min_attempts": 3}));
        assert_eq!(params.min_attempts, 3);
        assert_eq!(params.lookback_days, 90);
        assert_eq!(params.recency_buckets.len(), 3);
    }

    #[test]
    fn test_params_from_garbage_falls_back() {
        let params = MasteryV0Params::from_value(&json!("not an object"));
        assert_eq!(params, MasteryV0Params::default());
    }
}

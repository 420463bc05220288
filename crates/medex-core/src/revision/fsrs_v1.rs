/// Revision v1: FSRS scheduling from MCQ attempts.
///
/// MCQ answers carry no self-graded rating, so one is derived from the
/// attempt telemetry before the FSRS update runs. Weights are global
/// defaults until a learner has enough review logs for a personalized fit.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Result;

/// Target retention for due-date computation.
pub const DESIRED_RETENTION: f32 = 0.90;

/// Review-log count before personalized weights apply.
pub const PERSONALIZATION_MIN_REVIEWS: i64 = 50;

/// Answer changes at or above this count read as hesitation.
const HESITATION_CHANGES: i32 = 2;

/// Under this, a correct answer reads as fluent recall.
const FAST_ANSWER_MS: i64 = 15_000;

/// Over this, a correct answer reads as a struggle.
const SLOW_ANSWER_MS: i64 = 60_000;

/// Telemetry above this is treated as an idle tab, not a long think.
const MAX_PLAUSIBLE_MS: i64 = 30 * 60 * 1000;

// ============================================================================
// RATINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewRating {
    Again = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl ReviewRating {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(ReviewRating::Again),
            2 => Some(ReviewRating::Hard),
            3 => Some(ReviewRating::Good),
            4 => Some(ReviewRating::Easy),
            _ => None,
        }
    }
}

/// Discard negative telemetry and clamp absurd durations.
pub fn validate_telemetry(
    time_spent_ms: Option<i64>,
    change_count: Option<i32>,
) -> (Option<i64>, Option<i32>) {
    let time = time_spent_ms.and_then(|t| {
        if t < 0 {
            None
        } else {
            Some(t.min(MAX_PLAUSIBLE_MS))
        }
    });
    let changes = change_count.and_then(|c| if c < 0 { None } else { Some(c) });
    (time, changes)
}

/// Derive an FSRS rating from a graded attempt and its telemetry.
pub fn map_attempt_to_rating(
    correct: bool,
    time_spent_ms: Option<i64>,
    change_count: Option<i32>,
    marked_for_review: bool,
) -> ReviewRating {
    if !correct {
        return ReviewRating::Again;
    }

    let (time, changes) = validate_telemetry(time_spent_ms, change_count);
    let hesitated = changes.map(|c| c >= HESITATION_CHANGES).unwrap_or(false);
    let slow = time.map(|t| t > SLOW_ANSWER_MS).unwrap_or(false);
    let fast = time.map(|t| t < FAST_ANSWER_MS).unwrap_or(false);
    let clean = changes.map(|c| c == 0).unwrap_or(false);

    if marked_for_review || hesitated || slow {
        ReviewRating::Hard
    } else if fast && clean {
        ReviewRating::Easy
    } else {
        ReviewRating::Good
    }
}

// ============================================================================
// FSRS UPDATE
// ============================================================================

/// New schedule state after one review.
#[derive(Debug, Clone, PartialEq)]
pub struct FsrsOutcome {
    pub stability: f64,
    pub difficulty: f64,
    pub interval_days: i64,
    pub due_at: DateTime<Utc>,
    /// Predicted recall at the moment of this review (1.0 for first reviews).
    pub retrievability: f64,
    pub rating: ReviewRating,
}

/// Apply one FSRS review step.
///
/// `current` is the prior (stability, difficulty), absent for first reviews.
/// `weights` is the personalized parameter set when the learner has one.
pub fn update_fsrs(
    current: Option<(f64, f64)>,
    rating: ReviewRating,
    delta_days: f64,
    weights: Option<&[f32]>,
    reviewed_at: DateTime<Utc>,
) -> Result<FsrsOutcome> {
    let engine = fsrs::FSRS::new(weights).map_err(|e| anyhow::anyhow!(e))?;

    let elapsed = delta_days.max(0.0).round() as u32;
    let memory = current.map(|(stability, difficulty)| fsrs::MemoryState {
        stability: stability as f32,
        difficulty: difficulty as f32,
    });

    let retrievability = match current {
        Some((stability, _)) => predicted_retrievability(stability, delta_days),
        None => 1.0,
    };

    let next_states = engine
        .next_states(memory, DESIRED_RETENTION, elapsed)
        .map_err(|e| anyhow::anyhow!(e))?;

    let chosen = match rating {
        ReviewRating::Again => &next_states.again,
        ReviewRating::Hard => &next_states.hard,
        ReviewRating::Good => &next_states.good,
        ReviewRating::Easy => &next_states.easy,
    };

    let interval_days = (chosen.interval.round() as i64).max(1);
    Ok(FsrsOutcome {
        stability: chosen.memory.stability as f64,
        difficulty: chosen.memory.difficulty as f64,
        interval_days,
        due_at: reviewed_at + Duration::days(interval_days),
        retrievability,
        rating,
    })
}

/// FSRS power-law forgetting curve: R(t, S) = (1 + F·t/S)^D.
fn predicted_retrievability(stability: f64, elapsed_days: f64) -> f64 {
    const FACTOR: f64 = 19.0 / 81.0;
    const DECAY: f64 = -0.5;
    if stability <= 0.0 {
        return 0.0;
    }
    (1.0 + FACTOR * elapsed_days.max(0.0) / stability)
        .powf(DECAY)
        .clamp(0.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================

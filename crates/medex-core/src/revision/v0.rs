/// Revision v0: interval-bin spacing driven by the mastery band.
///
/// The bin ladder is fixed; the band picks the starting rung and consecutive
/// correct answers climb it. A wrong answer resets the climb.
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{ModelKind, Provenance, RevisionRecord};
use crate::mastery::MasteryBand;

/// Interval bins in days.
pub const REVISION_BINS: [i64; 7] = [1, 3, 7, 14, 30, 60, 120];

fn band_base_index(band: MasteryBand) -> usize {
    match band {
        MasteryBand::Weak => 0,
        MasteryBand::Medium => 1,
        MasteryBand::Strong => 2,
        MasteryBand::Mastered => 3,
    }
}

/// Interval for a band at a given consecutive-correct stage.
pub fn next_interval_days(band: MasteryBand, stage: i32) -> i64 {
    let idx = band_base_index(band)
        .saturating_add(stage.max(0) as usize)
        .min(REVISION_BINS.len() - 1);
    REVISION_BINS[idx]
}

/// Apply one v0 review to a (learner, concept) schedule state.
pub fn update_revision_v0(
    previous: Option<&RevisionRecord>,
    user_id: Uuid,
    theme_id: i64,
    concept_id: i64,
    band: MasteryBand,
    correct: bool,
    now: DateTime<Utc>,
    provenance: Provenance,
) -> RevisionRecord {
    let stage = if correct {
        previous.and_then(|r| r.stage).unwrap_or(0) + 1
    } else {
        0
    };
    let interval = next_interval_days(band, stage);

    RevisionRecord {
        user_id,
        theme_id,
        concept_id,
        due_at: now + Duration::days(interval),
        last_review_at: now,
        model: ModelKind::V0,
        stability: None,
        difficulty: None,
        retrievability: None,
        interval_days: Some(interval),
        stage: Some(stage),
        provenance,
    }
}

// ============================================================================
// TESTS
// ============================================================================

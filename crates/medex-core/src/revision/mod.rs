/// Per-learner review scheduling.
///
/// v0 walks a fixed interval-bin ladder driven by the theme's mastery band;
/// v1 is FSRS with optional personalized weights.
pub mod fsrs_v1;
pub mod v0;

pub use fsrs_v1::{
    map_attempt_to_rating, update_fsrs, validate_telemetry, FsrsOutcome, ReviewRating,
    DESIRED_RETENTION, PERSONALIZATION_MIN_REVIEWS,
};
pub use v0::{next_interval_days, update_revision_v0, REVISION_BINS};

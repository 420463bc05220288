use crate::domain::{BanditThemeState, EloRating, MasteryRecord, RevisionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Canonical persistent knowledge state: mastery, review schedule, Elo
/// ratings, bandit posteriors.
///
/// Written by the update pipeline, read by the selection engine and
/// analytics. Every write path must be guarded by the runtime freeze check
/// in the calling service.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait StateRepository: Send + Sync {
    // ========================================================================
    // Mastery
    // ========================================================================

    /// Mastery records for the given themes. Empty `theme_ids` means all.
    async fn get_mastery(
        &self,
        user_id: Uuid,
        theme_ids: &[i64],
    ) -> anyhow::Result<Vec<MasteryRecord>>;

    async fn upsert_mastery(&self, record: &MasteryRecord) -> anyhow::Result<()>;

    // ========================================================================
    // Revision schedule
    // ========================================================================

    async fn get_revision_state(
        &self,
        user_id: Uuid,
        concept_id: i64,
    ) -> anyhow::Result<Option<RevisionRecord>>;

    async fn upsert_revision(&self, record: &RevisionRecord) -> anyhow::Result<()>;

    /// Concepts due before the given instant, grouped by theme.
    async fn due_concepts_by_theme(
        &self,
        user_id: Uuid,
        theme_ids: &[i64],
        due_before: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<i64, Vec<i64>>>;

    /// Total review-log count for the learner (FSRS personalization gate).
    async fn review_log_count(&self, user_id: Uuid) -> anyhow::Result<i64>;

    /// Personalized FSRS weights, if the learner has a fitted set.
    async fn fsrs_weights(&self, user_id: Uuid) -> anyhow::Result<Option<Vec<f32>>>;

    /// Append one review-log row (rating, correctness, elapsed days).
    async fn append_review_log(
        &self,
        user_id: Uuid,
        concept_id: i64,
        rating: i32,
        correct: bool,
        delta_days: f64,
        reviewed_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    // ========================================================================
    // Elo ratings
    // ========================================================================

    async fn get_user_rating(&self, user_id: Uuid) -> anyhow::Result<Option<EloRating>>;

    async fn get_item_ratings(
        &self,
        item_ids: &[Uuid],
    ) -> anyhow::Result<HashMap<Uuid, EloRating>>;

    async fn upsert_rating(&self, rating: &EloRating) -> anyhow::Result<()>;

    async fn all_item_ratings(&self) -> anyhow::Result<Vec<EloRating>>;

    async fn all_user_ratings(&self) -> anyhow::Result<Vec<EloRating>>;

    /// Claim an attempt id for the Elo update log. Returns false when the
    /// attempt was already processed (idempotency).
    async fn try_claim_attempt(&self, attempt_id: Uuid) -> anyhow::Result<bool>;

    // ========================================================================
    // Bandit posteriors
    // ========================================================================

    async fn get_bandit_states(
        &self,
        user_id: Uuid,
        theme_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, BanditThemeState>>;

    async fn upsert_bandit_state(&self, state: &BanditThemeState) -> anyhow::Result<()>;

    // ========================================================================
    // Exclusion pool
    // ========================================================================

    /// Item ids the learner has seen within the last N days or K sessions.
    async fn recently_seen_items(
        &self,
        user_id: Uuid,
        within_days: i64,
        within_sessions: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>>;

    // ========================================================================
    // Job locks
    // ========================================================================

    /// Advisory lock keyed by (job_kind, scope); prevents double-running
    /// recenter and cohort recompute jobs.
    async fn try_acquire_job_lock(&self, job_kind: &str, scope: &str) -> anyhow::Result<bool>;

    async fn release_job_lock(&self, job_kind: &str, scope: &str) -> anyhow::Result<()>;
}

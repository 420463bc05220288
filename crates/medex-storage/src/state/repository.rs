use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{query, query_as, FromRow, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use medex_core::domain::{
    BanditThemeState, EloRating, EloScope, MasteryRecord, ModelKind, Provenance, RevisionRecord,
};
use medex_core::ports::StateRepository;

use crate::convert::{
    opt_from_millis, opt_millis, opt_parse_uuid, parse_json, parse_uuid, placeholders,
    to_millis,
};

#[derive(Debug, FromRow)]
struct MasteryRow {
    user_id: String,
    year: i32,
    block_id: i64,
    theme_id: i64,
    attempts_total: i64,
    correct_total: i64,
    accuracy_pct: f64,
    mastery_score: f64,
    mastery_model: String,
    last_attempt_at: Option<i64>,
    breakdown_json: String,
    algo_version_id: Option<String>,
    params_id: Option<String>,
    run_id: Option<String>,
}

impl MasteryRow {
    fn into_domain(self) -> anyhow::Result<MasteryRecord> {
        Ok(MasteryRecord {
            user_id: parse_uuid(&self.user_id)?,
            year: self.year,
            block_id: self.block_id,
            theme_id: self.theme_id,
            attempts_total: self.attempts_total,
            correct_total: self.correct_total,
            accuracy_pct: self.accuracy_pct,
            mastery_score: self.mastery_score,
            mastery_model: ModelKind::parse(&self.mastery_model)
                .ok_or_else(|| anyhow::anyhow!("unknown model {:?}", self.mastery_model))?,
            last_attempt_at: opt_from_millis(self.last_attempt_at),
            breakdown: parse_json(&self.breakdown_json),
            provenance: Provenance {
                algo_version_id: opt_parse_uuid(self.algo_version_id)?,
                params_id: opt_parse_uuid(self.params_id)?,
                run_id: opt_parse_uuid(self.run_id)?,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct RevisionRow {
    user_id: String,
    theme_id: i64,
    concept_id: i64,
    due_at: i64,
    last_review_at: i64,
    model: String,
    stability: Option<f64>,
    difficulty: Option<f64>,
    retrievability: Option<f64>,
    interval_days: Option<i64>,
    stage: Option<i32>,
    algo_version_id: Option<String>,
    params_id: Option<String>,
    run_id: Option<String>,
}

impl RevisionRow {
    fn into_domain(self) -> anyhow::Result<RevisionRecord> {
        Ok(RevisionRecord {
            user_id: parse_uuid(&self.user_id)?,
            theme_id: self.theme_id,
            concept_id: self.concept_id,
            due_at: crate::convert::from_millis(self.due_at),
            last_review_at: crate::convert::from_millis(self.last_review_at),
            model: ModelKind::parse(&self.model)
                .ok_or_else(|| anyhow::anyhow!("unknown model {:?}", self.model))?,
            stability: self.stability,
            difficulty: self.difficulty,
            retrievability: self.retrievability,
            interval_days: self.interval_days,
            stage: self.stage,
            provenance: Provenance {
                algo_version_id: opt_parse_uuid(self.algo_version_id)?,
                params_id: opt_parse_uuid(self.params_id)?,
                run_id: opt_parse_uuid(self.run_id)?,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct RatingRow {
    scope: String,
    subject_id: String,
    rating: f64,
    uncertainty: f64,
    n_attempts: i64,
    last_seen_at: Option<i64>,
}

impl RatingRow {
    fn into_domain(self) -> anyhow::Result<EloRating> {
        let scope = EloScope::parse(&self.scope)
            .ok_or_else(|| anyhow::anyhow!("unknown elo scope {:?}", self.scope))?;
        let subject = parse_uuid(&self.subject_id)?;
        Ok(EloRating {
            scope,
            user_id: (scope == EloScope::User).then_some(subject),
            item_id: (scope == EloScope::Item).then_some(subject),
            rating: self.rating,
            uncertainty: self.uncertainty,
            n_attempts: self.n_attempts,
            last_seen_at: opt_from_millis(self.last_seen_at),
        })
    }
}

fn rating_subject(rating: &EloRating) -> anyhow::Result<String> {
    match rating.scope {
        EloScope::User => rating
            .user_id
            .map(|id| id.to_string())
            .ok_or_else(|| anyhow::anyhow!("user-scope rating without user_id")),
        EloScope::Item => rating
            .item_id
            .map(|id| id.to_string())
            .ok_or_else(|| anyhow::anyhow!("item-scope rating without item_id")),
    }
}

const MASTERY_COLUMNS: &str = "user_id, year, block_id, theme_id, attempts_total, \
     correct_total, accuracy_pct, mastery_score, mastery_model, last_attempt_at, \
     breakdown_json, algo_version_id, params_id, run_id";

const REVISION_COLUMNS: &str = "user_id, theme_id, concept_id, due_at, last_review_at, \
     model, stability, difficulty, retrievability, interval_days, stage, \
     algo_version_id, params_id, run_id";

const RATING_COLUMNS: &str =
    "scope, subject_id, rating, uncertainty, n_attempts, last_seen_at";

pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store personalized FSRS weights for a learner (fitting is offline).
    pub async fn save_fsrs_weights(
        &self,
        user_id: Uuid,
        weights: &[f32],
    ) -> anyhow::Result<()> {
        query(
            "INSERT INTO fsrs_user_params (user_id, weights_json, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                weights_json = excluded.weights_json,
                updated_at = excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(serde_json::to_string(weights)?)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateRepository for SqliteStateRepository {
    // ========================================================================
    // Mastery
    // ========================================================================

    async fn get_mastery(
        &self,
        user_id: Uuid,
        theme_ids: &[i64],
    ) -> anyhow::Result<Vec<MasteryRecord>> {
        let mut sql = format!("SELECT {MASTERY_COLUMNS} FROM theme_mastery WHERE user_id = ?");
        if !theme_ids.is_empty() {
            sql.push_str(&format!(" AND theme_id IN ({})", placeholders(theme_ids.len())));
        }
        sql.push_str(" ORDER BY theme_id");

        let mut q = query_as::<_, MasteryRow>(&sql).bind(user_id.to_string());
        for theme_id in theme_ids {
            q = q.bind(theme_id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(MasteryRow::into_domain).collect()
    }

    async fn upsert_mastery(&self, record: &MasteryRecord) -> anyhow::Result<()> {
        query(
            "INSERT INTO theme_mastery
             (user_id, year, block_id, theme_id, attempts_total, correct_total,
              accuracy_pct, mastery_score, mastery_model, last_attempt_at,
              breakdown_json, algo_version_id, params_id, run_id, computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, theme_id) DO UPDATE SET
                year = excluded.year,
                block_id = excluded.block_id,
                attempts_total = excluded.attempts_total,
                correct_total = excluded.correct_total,
                accuracy_pct = excluded.accuracy_pct,
                mastery_score = excluded.mastery_score,
                mastery_model = excluded.mastery_model,
                last_attempt_at = excluded.last_attempt_at,
                breakdown_json = excluded.breakdown_json,
                algo_version_id = excluded.algo_version_id,
                params_id = excluded.params_id,
                run_id = excluded.run_id,
                computed_at = excluded.computed_at",
        )
        .bind(record.user_id.to_string())
        .bind(record.year)
        .bind(record.block_id)
        .bind(record.theme_id)
        .bind(record.attempts_total)
        .bind(record.correct_total)
        .bind(record.accuracy_pct)
        .bind(record.mastery_score)
        .bind(record.mastery_model.as_str())
        .bind(opt_millis(record.last_attempt_at))
        .bind(serde_json::to_string(&record.breakdown)?)
        .bind(record.provenance.algo_version_id.map(|id| id.to_string()))
        .bind(record.provenance.params_id.map(|id| id.to_string()))
        .bind(record.provenance.run_id.map(|id| id.to_string()))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Revision
    // ========================================================================

    async fn get_revision_state(
        &self,
        user_id: Uuid,
        concept_id: i64,
    ) -> anyhow::Result<Option<RevisionRecord>> {
        let row = query_as::<_, RevisionRow>(&format!(
            "SELECT {REVISION_COLUMNS} FROM revision_states
             WHERE user_id = ? AND concept_id = ?"
        ))
        .bind(user_id.to_string())
        .bind(concept_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RevisionRow::into_domain).transpose()
    }

    async fn upsert_revision(&self, record: &RevisionRecord) -> anyhow::Result<()> {
        query(
            "INSERT INTO revision_states
             (user_id, theme_id, concept_id, due_at, last_review_at, model,
              stability, difficulty, retrievability, interval_days, stage,
              algo_version_id, params_id, run_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, concept_id) DO UPDATE SET
                theme_id = excluded.theme_id,
                due_at = excluded.due_at,
                last_review_at = excluded.last_review_at,
                model = excluded.model,
                stability = excluded.stability,
                difficulty = excluded.difficulty,
                retrievability = excluded.retrievability,
                interval_days = excluded.interval_days,
                stage = excluded.stage,
                algo_version_id = excluded.algo_version_id,
                params_id = excluded.params_id,
                run_id = excluded.run_id",
        )
        .bind(record.user_id.to_string())
        .bind(record.theme_id)
        .bind(record.concept_id)
        .bind(to_millis(record.due_at))
        .bind(to_millis(record.last_review_at))
        .bind(record.model.as_str())
        .bind(record.stability)
        .bind(record.difficulty)
        .bind(record.retrievability)
        .bind(record.interval_days)
        .bind(record.stage)
        .bind(record.provenance.algo_version_id.map(|id| id.to_string()))
        .bind(record.provenance.params_id.map(|id| id.to_string()))
        .bind(record.provenance.run_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_concepts_by_theme(
        &self,
        user_id: Uuid,
        theme_ids: &[i64],
        due_before: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<i64, Vec<i64>>> {
        let mut sql = String::from(
            "SELECT theme_id, concept_id FROM revision_states
             WHERE user_id = ? AND due_at <= ?",
        );
        if !theme_ids.is_empty() {
            sql.push_str(&format!(" AND theme_id IN ({})", placeholders(theme_ids.len())));
        }
        sql.push_str(" ORDER BY due_at");

        let mut q = query_as::<_, (i64, i64)>(&sql)
            .bind(user_id.to_string())
            .bind(to_millis(due_before));
        for theme_id in theme_ids {
            q = q.bind(theme_id);
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut by_theme: HashMap<i64, Vec<i64>> = HashMap::new();
        for (theme_id, concept_id) in rows {
            by_theme.entry(theme_id).or_default().push(concept_id);
        }
        Ok(by_theme)
    }

    async fn review_log_count(&self, user_id: Uuid) -> anyhow::Result<i64> {
        let (count,): (i64,) =
            query_as("SELECT COUNT(*) FROM review_logs WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn fsrs_weights(&self, user_id: Uuid) -> anyhow::Result<Option<Vec<f32>>> {
        let row: Option<(Option<String>,)> =
            query_as("SELECT weights_json FROM fsrs_user_params WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(weights,)| weights) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn append_review_log(
        &self,
        user_id: Uuid,
        concept_id: i64,
        rating: i32,
        correct: bool,
        delta_days: f64,
        reviewed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        query(
            "INSERT INTO review_logs
             (user_id, concept_id, rating, correct, delta_days, reviewed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(concept_id)
        .bind(rating)
        .bind(correct as i64)
        .bind(delta_days)
        .bind(to_millis(reviewed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Elo
    // ========================================================================

    async fn get_user_rating(&self, user_id: Uuid) -> anyhow::Result<Option<EloRating>> {
        let row = query_as::<_, RatingRow>(&format!(
            "SELECT {RATING_COLUMNS} FROM elo_ratings WHERE scope = 'user' AND subject_id = ?"
        ))
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(RatingRow::into_domain).transpose()
    }

    async fn get_item_ratings(
        &self,
        item_ids: &[Uuid],
    ) -> anyhow::Result<HashMap<Uuid, EloRating>> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT {RATING_COLUMNS} FROM elo_ratings
             WHERE scope = 'item' AND subject_id IN ({})",
            placeholders(item_ids.len())
        );
        let mut q = query_as::<_, RatingRow>(&sql);
        for item_id in item_ids {
            q = q.bind(item_id.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut ratings = HashMap::new();
        for row in rows {
            let rating = row.into_domain()?;
            if let Some(item_id) = rating.item_id {
                ratings.insert(item_id, rating);
            }
        }
        Ok(ratings)
    }

    async fn upsert_rating(&self, rating: &EloRating) -> anyhow::Result<()> {
        if !rating.rating.is_finite() || !rating.uncertainty.is_finite() {
            anyhow::bail!("refusing to store non-finite rating");
        }
        query(
            "INSERT INTO elo_ratings
             (scope, subject_id, rating, uncertainty, n_attempts, last_seen_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(scope, subject_id) DO UPDATE SET
                rating = excluded.rating,
                uncertainty = excluded.uncertainty,
                n_attempts = excluded.n_attempts,
                last_seen_at = excluded.last_seen_at",
        )
        .bind(rating.scope.as_str())
        .bind(rating_subject(rating)?)
        .bind(rating.rating)
        .bind(rating.uncertainty)
        .bind(rating.n_attempts)
        .bind(opt_millis(rating.last_seen_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_item_ratings(&self) -> anyhow::Result<Vec<EloRating>> {
        let rows = query_as::<_, RatingRow>(&format!(
            "SELECT {RATING_COLUMNS} FROM elo_ratings WHERE scope = 'item' ORDER BY subject_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RatingRow::into_domain).collect()
    }

    async fn all_user_ratings(&self) -> anyhow::Result<Vec<EloRating>> {
        let rows = query_as::<_, RatingRow>(&format!(
            "SELECT {RATING_COLUMNS} FROM elo_ratings WHERE scope = 'user' ORDER BY subject_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RatingRow::into_domain).collect()
    }

    async fn try_claim_attempt(&self, attempt_id: Uuid) -> anyhow::Result<bool> {
        let result = query(
            "INSERT OR IGNORE INTO elo_update_log (attempt_id, processed_at) VALUES (?, ?)",
        )
        .bind(attempt_id.to_string())
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Bandit
    // ========================================================================

    async fn get_bandit_states(
        &self,
        user_id: Uuid,
        theme_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, BanditThemeState>> {
        let mut sql = String::from(
            "SELECT user_id, theme_id, alpha, beta, n_sessions, last_selected_at, last_reward
             FROM bandit_theme_states WHERE user_id = ?",
        );
        if !theme_ids.is_empty() {
            sql.push_str(&format!(" AND theme_id IN ({})", placeholders(theme_ids.len())));
        }

        #[derive(FromRow)]
        struct BanditRow {
            user_id: String,
            theme_id: i64,
            alpha: f64,
            beta: f64,
            n_sessions: i64,
            last_selected_at: Option<i64>,
            last_reward: Option<f64>,
        }

        let mut q = query_as::<_, BanditRow>(&sql).bind(user_id.to_string());
        for theme_id in theme_ids {
            q = q.bind(theme_id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut states = HashMap::new();
        for row in rows {
            states.insert(
                row.theme_id,
                BanditThemeState {
                    user_id: parse_uuid(&row.user_id)?,
                    theme_id: row.theme_id,
                    alpha: row.alpha,
                    beta: row.beta,
                    n_sessions: row.n_sessions,
                    last_selected_at: opt_from_millis(row.last_selected_at),
                    last_reward: row.last_reward,
                },
            );
        }
        Ok(states)
    }

    async fn upsert_bandit_state(&self, state: &BanditThemeState) -> anyhow::Result<()> {
        query(
            "INSERT INTO bandit_theme_states
             (user_id, theme_id, alpha, beta, n_sessions, last_selected_at, last_reward)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, theme_id) DO UPDATE SET
                alpha = excluded.alpha,
                beta = excluded.beta,
                n_sessions = excluded.n_sessions,
                last_selected_at = excluded.last_selected_at,
                last_reward = excluded.last_reward",
        )
        .bind(state.user_id.to_string())
        .bind(state.theme_id)
        .bind(state.alpha)
        .bind(state.beta)
        .bind(state.n_sessions)
        .bind(opt_millis(state.last_selected_at))
        .bind(state.last_reward)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Exclusion pool
    // ========================================================================

    async fn recently_seen_items(
        &self,
        user_id: Uuid,
        within_days: i64,
        within_sessions: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>> {
        let cutoff = to_millis(now - Duration::days(within_days));
        let rows = query_as::<_, (String,)>(
            "SELECT DISTINCT si.item_id
             FROM session_items si
             JOIN sessions s ON s.id = si.session_id
             WHERE s.user_id = ?
               AND (s.started_at >= ?
                    OR si.session_id IN (
                        SELECT id FROM sessions WHERE user_id = ?
                        ORDER BY started_at DESC LIMIT ?))",
        )
        .bind(user_id.to_string())
        .bind(cutoff)
        .bind(user_id.to_string())
        .bind(within_sessions)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|(raw,)| parse_uuid(&raw)).collect()
    }

    // ========================================================================
    // Job locks
    // ========================================================================

    async fn try_acquire_job_lock(&self, job_kind: &str, scope: &str) -> anyhow::Result<bool> {
        let result = query(
            "INSERT OR IGNORE INTO job_locks (job_kind, scope, acquired_at) VALUES (?, ?, ?)",
        )
        .bind(job_kind)
        .bind(scope)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_job_lock(&self, job_kind: &str, scope: &str) -> anyhow::Result<()> {
        query("DELETE FROM job_locks WHERE job_kind = ? AND scope = ?")
            .bind(job_kind)
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{query, query_as, FromRow, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use medex_core::domain::{
    AttemptEvent, AttemptEventKind, AttemptSample, ItemDifficulty, RuntimeSnapshot, Session,
    SessionAnswer, SessionAttempt, SessionItemRecord, SessionMode, SessionStatus,
    SyllabusTriple,
};
use medex_core::ports::SessionRepository;

use crate::convert::{from_millis, opt_from_millis, opt_millis, parse_uuid, to_millis};

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    mode: String,
    status: String,
    year: i32,
    blocks_json: String,
    themes_json: Option<String>,
    total_questions: i32,
    started_at: i64,
    expires_at: Option<i64>,
    duration_seconds: Option<i64>,
    submitted_at: Option<i64>,
    score_correct: Option<i32>,
    score_total: Option<i32>,
    score_pct: Option<f64>,
    algo_profile_at_start: String,
    algo_overrides_json: String,
    algo_policy_version: String,
    exam_mode_at_start: i64,
    freeze_updates_at_start: i64,
}

impl SessionRow {
    fn into_domain(self) -> anyhow::Result<Session> {
        Ok(Session {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            mode: SessionMode::parse(&self.mode)
                .ok_or_else(|| anyhow::anyhow!("unknown session mode {:?}", self.mode))?,
            status: SessionStatus::parse(&self.status)
                .ok_or_else(|| anyhow::anyhow!("unknown session status {:?}", self.status))?,
            year: self.year,
            block_ids: serde_json::from_str(&self.blocks_json)?,
            theme_ids: self
                .themes_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            total_questions: self.total_questions,
            started_at: from_millis(self.started_at),
            expires_at: opt_from_millis(self.expires_at),
            duration_seconds: self.duration_seconds,
            submitted_at: opt_from_millis(self.submitted_at),
            score_correct: self.score_correct,
            score_total: self.score_total,
            score_pct: self.score_pct,
            algo_at_start: RuntimeSnapshot {
                profile: self.algo_profile_at_start,
                overrides: serde_json::from_str(&self.algo_overrides_json)
                    .unwrap_or_default(),
                policy_version: self.algo_policy_version,
                exam_mode: self.exam_mode_at_start != 0,
                freeze_updates: self.freeze_updates_at_start != 0,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionItemRow {
    session_id: String,
    position: i32,
    item_id: String,
    item_version: i64,
    snapshot_json: String,
}

impl SessionItemRow {
    fn into_domain(self) -> anyhow::Result<SessionItemRecord> {
        Ok(SessionItemRecord {
            session_id: parse_uuid(&self.session_id)?,
            position: self.position,
            item_id: parse_uuid(&self.item_id)?,
            item_version: self.item_version,
            frozen: serde_json::from_str(&self.snapshot_json)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct AnswerRow {
    id: String,
    session_id: String,
    item_id: String,
    selected_index: Option<i32>,
    is_correct: Option<i64>,
    answered_at: Option<i64>,
    changed_count: i32,
    marked_for_review: i64,
}

impl AnswerRow {
    fn into_domain(self) -> anyhow::Result<SessionAnswer> {
        Ok(SessionAnswer {
            id: parse_uuid(&self.id)?,
            session_id: parse_uuid(&self.session_id)?,
            item_id: parse_uuid(&self.item_id)?,
            selected_index: self.selected_index,
            is_correct: self.is_correct.map(|v| v != 0),
            answered_at: opt_from_millis(self.answered_at),
            changed_count: self.changed_count,
            marked_for_review: self.marked_for_review != 0,
        })
    }
}

const SESSION_COLUMNS: &str = "id, user_id, mode, status, year, blocks_json, themes_json, \
     total_questions, started_at, expires_at, duration_seconds, submitted_at, \
     score_correct, score_total, score_pct, algo_profile_at_start, algo_overrides_json, \
     algo_policy_version, exam_mode_at_start, freeze_updates_at_start";

const ANSWER_COLUMNS: &str = "id, session_id, item_id, selected_index, is_correct, \
     answered_at, changed_count, marked_for_review";

pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_session(&self, session_id: Uuid) -> anyhow::Result<Option<Session>> {
        let row = query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionRow::into_domain).transpose()
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn insert_session(
        &self,
        session: &Session,
        items: &[SessionItemRecord],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        query(
            "INSERT INTO sessions
             (id, user_id, mode, status, year, blocks_json, themes_json, total_questions,
              started_at, expires_at, duration_seconds, submitted_at, score_correct,
              score_total, score_pct, algo_profile_at_start, algo_overrides_json,
              algo_policy_version, exam_mode_at_start, freeze_updates_at_start)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(session.mode.as_str())
        .bind(session.status.as_str())
        .bind(session.year)
        .bind(serde_json::to_string(&session.block_ids)?)
        .bind(
            session
                .theme_ids
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(session.total_questions)
        .bind(to_millis(session.started_at))
        .bind(opt_millis(session.expires_at))
        .bind(session.duration_seconds)
        .bind(opt_millis(session.submitted_at))
        .bind(session.score_correct)
        .bind(session.score_total)
        .bind(session.score_pct)
        .bind(&session.algo_at_start.profile)
        .bind(serde_json::to_string(&session.algo_at_start.overrides)?)
        .bind(&session.algo_at_start.policy_version)
        .bind(session.algo_at_start.exam_mode as i64)
        .bind(session.algo_at_start.freeze_updates as i64)
        .execute(&mut *tx)
        .await?;

        for item in items {
            query(
                "INSERT INTO session_items
                 (session_id, position, item_id, item_version, snapshot_json,
                  year, block_id, theme_id, concept_id, difficulty)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(item.session_id.to_string())
            .bind(item.position)
            .bind(item.item_id.to_string())
            .bind(item.item_version)
            .bind(serde_json::to_string(&item.frozen)?)
            .bind(item.frozen.year)
            .bind(item.frozen.block_id)
            .bind(item.frozen.theme_id)
            .bind(item.frozen.concept_id)
            .bind(item.frozen.difficulty.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> anyhow::Result<Option<Session>> {
        self.fetch_session(session_id).await
    }

    async fn list_items(&self, session_id: Uuid) -> anyhow::Result<Vec<SessionItemRecord>> {
        let rows = query_as::<_, SessionItemRow>(
            "SELECT session_id, position, item_id, item_version, snapshot_json
             FROM session_items WHERE session_id = ? ORDER BY position",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionItemRow::into_domain).collect()
    }

    async fn list_answers(&self, session_id: Uuid) -> anyhow::Result<Vec<SessionAnswer>> {
        let rows = query_as::<_, AnswerRow>(&format!(
            "SELECT {ANSWER_COLUMNS} FROM session_answers WHERE session_id = ?"
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AnswerRow::into_domain).collect()
    }

    async fn get_answer(
        &self,
        session_id: Uuid,
        item_id: Uuid,
    ) -> anyhow::Result<Option<SessionAnswer>> {
        let row = query_as::<_, AnswerRow>(&format!(
            "SELECT {ANSWER_COLUMNS} FROM session_answers
             WHERE session_id = ? AND item_id = ?"
        ))
        .bind(session_id.to_string())
        .bind(item_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(AnswerRow::into_domain).transpose()
    }

    async fn upsert_answer(&self, answer: &SessionAnswer) -> anyhow::Result<SessionAnswer> {
        // Concurrent writers serialize on UNIQUE(session_id, item_id);
        // last committed write wins on field values.
        query(
            "INSERT INTO session_answers
             (id, session_id, item_id, selected_index, is_correct, answered_at,
              changed_count, marked_for_review)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, item_id) DO UPDATE SET
                selected_index = excluded.selected_index,
                is_correct = excluded.is_correct,
                answered_at = excluded.answered_at,
                changed_count = excluded.changed_count,
                marked_for_review = excluded.marked_for_review",
        )
        .bind(answer.id.to_string())
        .bind(answer.session_id.to_string())
        .bind(answer.item_id.to_string())
        .bind(answer.selected_index)
        .bind(answer.is_correct.map(|v| v as i64))
        .bind(opt_millis(answer.answered_at))
        .bind(answer.changed_count)
        .bind(answer.marked_for_review as i64)
        .execute(&self.pool)
        .await?;

        self.get_answer(answer.session_id, answer.item_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("answer row vanished after upsert"))
    }

    async fn finalize_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        score_correct: i32,
        score_total: i32,
        score_pct: f64,
        submitted_at: DateTime<Utc>,
    ) -> anyhow::Result<(Session, bool)> {
        // The WHERE status = 'ACTIVE' guard makes the transition happen at
        // most once under concurrent submits.
        let result = query(
            "UPDATE sessions
             SET status = ?, score_correct = ?, score_total = ?, score_pct = ?,
                 submitted_at = ?
             WHERE id = ? AND status = 'ACTIVE'",
        )
        .bind(status.as_str())
        .bind(score_correct)
        .bind(score_total)
        .bind(score_pct)
        .bind(to_millis(submitted_at))
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;

        let session = self
            .fetch_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} vanished"))?;
        Ok((session, result.rows_affected() > 0))
    }

    async fn record_events(&self, events: &[AttemptEvent]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            query(
                "INSERT INTO attempt_events
                 (session_id, item_id, kind, client_ts, server_ts, seq)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(event.session_id.to_string())
            .bind(event.item_id.to_string())
            .bind(event.kind.as_str())
            .bind(opt_millis(event.client_ts))
            .bind(to_millis(event.server_ts))
            .bind(event.seq)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn next_event_seq(&self, session_id: Uuid) -> anyhow::Result<i64> {
        let (max_seq,): (Option<i64>,) =
            query_as("SELECT MAX(seq) FROM attempt_events WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(max_seq.unwrap_or(0) + 1)
    }

    async fn list_session_attempts(
        &self,
        session_id: Uuid,
    ) -> anyhow::Result<Vec<SessionAttempt>> {
        #[derive(FromRow)]
        struct AttemptRow {
            id: String,
            item_id: String,
            year: i32,
            block_id: i64,
            theme_id: i64,
            concept_id: Option<i64>,
            is_correct: Option<i64>,
            answered_at: Option<i64>,
            changed_count: i32,
            marked_for_review: i64,
            difficulty: String,
        }

        let rows = query_as::<_, AttemptRow>(
            "SELECT sa.id, sa.item_id, si.year, si.block_id, si.theme_id, si.concept_id,
                    sa.is_correct, sa.answered_at, sa.changed_count, sa.marked_for_review,
                    si.difficulty
             FROM session_answers sa
             JOIN session_items si
               ON si.session_id = sa.session_id AND si.item_id = sa.item_id
             WHERE sa.session_id = ? AND sa.selected_index IS NOT NULL
             ORDER BY si.position",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        // First QUESTION_VIEWED per item, for time-spent telemetry.
        let viewed: HashMap<String, i64> = query_as::<_, (String, i64)>(
            "SELECT item_id, MIN(server_ts) FROM attempt_events
             WHERE session_id = ? AND kind = ? GROUP BY item_id",
        )
        .bind(session_id.to_string())
        .bind(AttemptEventKind::QuestionViewed.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        rows.into_iter()
            .map(|row| {
                let time_spent_ms = match (row.answered_at, viewed.get(&row.item_id)) {
                    (Some(answered), Some(&first_viewed)) if answered > first_viewed => {
                        Some(answered - first_viewed)
                    }
                    _ => None,
                };
                Ok(SessionAttempt {
                    attempt_id: parse_uuid(&row.id)?,
                    item_id: parse_uuid(&row.item_id)?,
                    year: row.year,
                    block_id: row.block_id,
                    theme_id: row.theme_id,
                    concept_id: row.concept_id,
                    is_correct: row.is_correct.map(|v| v != 0).unwrap_or(false),
                    answered_at: opt_from_millis(row.answered_at),
                    time_spent_ms,
                    change_count: row.changed_count,
                    marked_for_review: row.marked_for_review != 0,
                    difficulty: ItemDifficulty::parse(&row.difficulty),
                })
            })
            .collect()
    }

    async fn collect_theme_attempts(
        &self,
        user_id: Uuid,
        theme_id: i64,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttemptSample>> {
        let cutoff = to_millis(now - Duration::days(lookback_days));
        let rows = query_as::<_, (Option<i64>, Option<i64>, String)>(
            "SELECT sa.is_correct, sa.answered_at, si.difficulty
             FROM session_answers sa
             JOIN sessions s ON s.id = sa.session_id
             JOIN session_items si
               ON si.session_id = sa.session_id AND si.item_id = sa.item_id
             WHERE s.user_id = ?
               AND s.status IN ('SUBMITTED', 'EXPIRED')
               AND s.submitted_at >= ?
               AND si.theme_id = ?
               AND sa.selected_index IS NOT NULL",
        )
        .bind(user_id.to_string())
        .bind(cutoff)
        .bind(theme_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(is_correct, answered_at, difficulty)| AttemptSample {
                is_correct: is_correct.map(|v| v != 0).unwrap_or(false),
                answered_at: opt_from_millis(answered_at),
                difficulty: ItemDifficulty::parse(&difficulty),
            })
            .collect())
    }

    async fn attempted_triples(
        &self,
        user_id: Uuid,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SyllabusTriple>> {
        let cutoff = to_millis(now - Duration::days(lookback_days));
        let rows = query_as::<_, (i32, i64, i64)>(
            "SELECT DISTINCT si.year, si.block_id, si.theme_id
             FROM session_items si
             JOIN sessions s ON s.id = si.session_id
             WHERE s.user_id = ?
               AND s.status IN ('SUBMITTED', 'EXPIRED')
               AND s.submitted_at >= ?
             ORDER BY si.theme_id",
        )
        .bind(user_id.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(year, block_id, theme_id)| SyllabusTriple {
                year,
                block_id,
                theme_id,
            })
            .collect())
    }
}

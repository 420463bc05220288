/// Session state machine.
///
/// ACTIVE → SUBMITTED | EXPIRED, nothing else. Content is frozen per item
/// at creation; grading reads the frozen snapshot; the final score is
/// computed exactly once at the transition; expiry is lazy on read.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    Actor, AttemptEvent, AttemptEventKind, CognitiveLevel, EngineError, ItemDifficulty, Result,
    Session, SessionAnswer, SessionItemRecord, SessionMode, SessionProgress, SessionStatus,
    OPTION_COUNT,
};
use crate::elo::EloParams;
use crate::ports::{ContentRepository, RuntimeRepository, SessionRepository, StateRepository};
use crate::registry::{AlgoKey, RunLogger};
use crate::runtime::{AlgoModule, RuntimeControl};
use crate::selection::{
    SelectionEngine, SelectionLogRecord, SelectionParams, SelectionRequest,
};

// ============================================================================
// REQUEST / VIEWS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub mode: SessionMode,
    pub year: i32,
    pub block_ids: Vec<i64>,
    pub theme_ids: Option<Vec<i64>>,
    pub count: usize,
    pub duration_seconds: Option<i64>,
    pub difficulty: Option<Vec<ItemDifficulty>>,
    pub cognitive: Option<Vec<CognitiveLevel>>,
}

/// One rendered session slot. `correct_index` and `explanation` stay out of
/// this view until the session is finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionItemView {
    pub position: i32,
    pub item_id: Uuid,
    pub stem: String,
    pub options: Vec<String>,
    pub theme_id: i64,
    pub block_id: i64,
    pub difficulty: ItemDifficulty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session: Session,
    pub items: Vec<SessionItemView>,
    pub progress: SessionProgress,
}

/// Post-completion review: full snapshots plus the learner's answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReviewItem {
    pub position: i32,
    pub item_id: Uuid,
    pub stem: String,
    pub options: Vec<String>,
    pub correct_index: i32,
    pub explanation: Option<String>,
    pub selected_index: Option<i32>,
    pub is_correct: Option<bool>,
    pub marked_for_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReview {
    pub session: Session,
    pub items: Vec<SessionReviewItem>,
}

#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub item_id: Uuid,
    pub kind: AttemptEventKind,
    pub client_ts: Option<DateTime<Utc>>,
}

const MAX_SESSION_QUESTIONS: usize = 200;

// ============================================================================
// SERVICE
// ============================================================================

pub struct SessionService {
    content: Arc<dyn ContentRepository>,
    sessions: Arc<dyn SessionRepository>,
    runtime: Arc<RuntimeControl>,
    runtime_repo: Arc<dyn RuntimeRepository>,
    selection: SelectionEngine,
    run_logger: RunLogger,
}

impl SessionService {
    pub fn new(
        content: Arc<dyn ContentRepository>,
        sessions: Arc<dyn SessionRepository>,
        state: Arc<dyn StateRepository>,
        runtime: Arc<RuntimeControl>,
    ) -> Self {
        let runtime_repo = runtime.repo();
        Self {
            selection: SelectionEngine::new(Arc::clone(&content), state),
            run_logger: RunLogger::new(Arc::clone(&runtime_repo)),
            content,
            sessions,
            runtime,
            runtime_repo,
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    pub async fn create(
        &self,
        actor: Actor,
        request: CreateSessionRequest,
    ) -> Result<SessionState> {
        validate_create(&request)?;
        let now = Utc::now();

        // Freeze the runtime decision context onto the session first; every
        // later decision for this session reads the snapshot.
        let snapshot = self.runtime.open_session_snapshot().await?;
        let adaptive_version =
            RuntimeControl::snapshot_version(&snapshot, AlgoModule::Adaptive);

        let selection_params = self.resolve_selection_params().await?;
        let elo_params = self.resolve_elo_params().await?;

        let selection_request = SelectionRequest {
            user_id: actor.user_id,
            year: request.year,
            block_ids: request.block_ids.clone(),
            theme_ids: request.theme_ids.clone(),
            count: request.count,
            mode: request.mode,
            difficulty: request.difficulty.clone(),
            cognitive: request.cognitive.clone(),
        };
        let outcome = self
            .selection
            .select(
                &selection_request,
                adaptive_version,
                snapshot.freeze_updates,
                now,
                &selection_params,
                &elo_params,
            )
            .await?;

        if outcome.item_ids.len() < request.count {
            return Err(EngineError::NotEnoughQuestions {
                available: outcome.item_ids.len(),
                requested: request.count,
            });
        }

        // Freeze content per item.
        let session_id = Uuid::new_v4();
        let mut items: Vec<SessionItemRecord> = Vec::with_capacity(outcome.item_ids.len());
        for (index, item_id) in outcome.item_ids.iter().enumerate() {
            let item = self
                .content
                .get_published(*item_id)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?
                .ok_or_else(|| {
                    EngineError::Integrity(format!("selected item {item_id} is not published"))
                })?;
            item.validate()?;
            let frozen = item.freeze();
            let version = self
                .content
                .record_item_version(*item_id, &frozen)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            items.push(SessionItemRecord {
                session_id,
                position: (index + 1) as i32,
                item_id: *item_id,
                item_version: version,
                frozen,
            });
        }

        let session = Session {
            id: session_id,
            user_id: actor.user_id,
            mode: request.mode,
            status: SessionStatus::Active,
            year: request.year,
            block_ids: request.block_ids.clone(),
            theme_ids: request.theme_ids.clone(),
            total_questions: items.len() as i32,
            started_at: now,
            expires_at: request
                .duration_seconds
                .map(|secs| now + Duration::seconds(secs)),
            duration_seconds: request.duration_seconds,
            submitted_at: None,
            score_correct: None,
            score_total: None,
            score_pct: None,
            algo_at_start: snapshot,
        };

        self.sessions
            .insert_session(&session, &items)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let log = SelectionLogRecord {
            id: Uuid::new_v4(),
            user_id: actor.user_id,
            requested_at: now,
            mode: request.mode.as_str().to_string(),
            year: request.year,
            block_ids: request.block_ids,
            theme_ids_filter: request.theme_ids,
            count: request.count as i64,
            seed: outcome.seed_hex,
            run_id: None,
            plan: outcome.plan,
            item_ids: outcome.item_ids,
        };
        if let Err(e) = self.runtime_repo.insert_selection_log(&log).await {
            tracing::warn!(error = %e, session_id = %session_id, "failed to write selection log");
        }

        let answers = Vec::new();
        Ok(SessionState {
            progress: compute_progress(&items, &answers),
            items: items.iter().map(item_view).collect(),
            session,
        })
    }

    // ========================================================================
    // Read with lazy expiry
    // ========================================================================

    /// Session state for the owner. Returns the state and whether this read
    /// performed the lazy expiry transition (the caller fans out telemetry
    /// updates on that edge, exactly as for submit).
    pub async fn get_state(
        &self,
        actor: Actor,
        session_id: Uuid,
    ) -> Result<(SessionState, bool)> {
        let session = self.fetch_owned(actor, session_id).await?;
        let (session, expired_now) = self.lazy_expire(session).await?;

        let items = self
            .sessions
            .list_items(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let answers = self
            .sessions
            .list_answers(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        Ok((
            SessionState {
                progress: compute_progress(&items, &answers),
                items: items.iter().map(item_view).collect(),
                session,
            },
            expired_now,
        ))
    }

    /// Review with correct answers; only after SUBMITTED/EXPIRED.
    pub async fn review(&self, actor: Actor, session_id: Uuid) -> Result<SessionReview> {
        let session = self.fetch_owned(actor, session_id).await?;
        let (session, _) = self.lazy_expire(session).await?;
        if !session.status.is_terminal() {
            return Err(EngineError::Validation(
                "review is available only after the session is finished".to_string(),
            ));
        }

        let items = self
            .sessions
            .list_items(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let answers = self
            .sessions
            .list_answers(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let review_items = items
            .iter()
            .map(|record| {
                let answer = answers.iter().find(|a| a.item_id == record.item_id);
                SessionReviewItem {
                    position: record.position,
                    item_id: record.item_id,
                    stem: record.frozen.stem.clone(),
                    options: record.frozen.options.clone(),
                    correct_index: record.frozen.correct_index,
                    explanation: record.frozen.explanation.clone(),
                    selected_index: answer.and_then(|a| a.selected_index),
                    is_correct: answer.and_then(|a| a.is_correct),
                    marked_for_review: answer.map(|a| a.marked_for_review).unwrap_or(false),
                }
            })
            .collect();

        Ok(SessionReview {
            session,
            items: review_items,
        })
    }

    // ========================================================================
    // Answers
    // ========================================================================

    pub async fn submit_answer(
        &self,
        actor: Actor,
        session_id: Uuid,
        item_id: Uuid,
        selected_index: Option<i32>,
        marked_for_review: Option<bool>,
    ) -> Result<(SessionAnswer, SessionProgress)> {
        if let Some(index) = selected_index {
            if !(0..OPTION_COUNT as i32).contains(&index) {
                return Err(EngineError::Validation(format!(
                    "selected_index must be in [0, {}]",
                    OPTION_COUNT - 1
                )));
            }
        }

        let session = self.fetch_owned(actor, session_id).await?;
        let (session, _) = self.lazy_expire(session).await?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::Validation("session is not active".to_string()));
        }

        let items = self
            .sessions
            .list_items(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let item_record = items
            .iter()
            .find(|record| record.item_id == item_id)
            .ok_or_else(|| EngineError::NotFound("question not in session".to_string()))?;

        let now = Utc::now();
        let existing = self
            .sessions
            .get_answer(session_id, item_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let mut answer = existing.unwrap_or(SessionAnswer {
            id: Uuid::new_v4(),
            session_id,
            item_id,
            selected_index: None,
            is_correct: None,
            answered_at: None,
            changed_count: 0,
            marked_for_review: false,
        });

        let mut events = Vec::new();
        if let (Some(previous), Some(current)) = (answer.selected_index, selected_index) {
            if previous != current {
                answer.changed_count += 1;
                events.push(AttemptEventKind::AnswerChanged);
            }
        }

        answer.selected_index = selected_index;
        if selected_index.is_some() {
            answer.answered_at = Some(now);
            events.push(AttemptEventKind::AnswerSelected);
        }
        if let Some(marked) = marked_for_review {
            if marked && !answer.marked_for_review {
                events.push(AttemptEventKind::MarkReview);
            }
            answer.marked_for_review = marked;
        }

        // Grade against the frozen snapshot, never the live item.
        answer.is_correct =
            selected_index.map(|index| index == item_record.frozen.correct_index);

        let stored = self
            .sessions
            .upsert_answer(&answer)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        self.record_event_kinds(session_id, item_id, &events, now)
            .await?;

        let answers = self
            .sessions
            .list_answers(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Ok((stored, compute_progress(&items, &answers)))
    }

    /// Append client telemetry events for an active session.
    pub async fn record_events(
        &self,
        actor: Actor,
        session_id: Uuid,
        incoming: Vec<IncomingEvent>,
    ) -> Result<usize> {
        let session = self.fetch_owned(actor, session_id).await?;
        let (session, _) = self.lazy_expire(session).await?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::Validation("session is not active".to_string()));
        }

        let now = Utc::now();
        let mut seq = self
            .sessions
            .next_event_seq(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let events: Vec<AttemptEvent> = incoming
            .into_iter()
            .map(|event| {
                let record = AttemptEvent {
                    session_id,
                    item_id: event.item_id,
                    kind: event.kind,
                    client_ts: event.client_ts,
                    server_ts: now,
                    seq,
                };
                seq += 1;
                record
            })
            .collect();

        self.sessions
            .record_events(&events)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Ok(events.len())
    }

    // ========================================================================
    // Submit / expire
    // ========================================================================

    /// Submit the session. Idempotent: a terminal session is returned
    /// unchanged with `false`.
    pub async fn submit(&self, actor: Actor, session_id: Uuid) -> Result<(Session, bool)> {
        let session = self.fetch_owned(actor, session_id).await?;

        // Past-deadline submits resolve as expiry first.
        let (session, expired_now) = self.lazy_expire(session).await?;
        if session.status != SessionStatus::Active {
            return Ok((session, expired_now));
        }

        self.finalize(&session, SessionStatus::Submitted).await
    }

    async fn lazy_expire(&self, session: Session) -> Result<(Session, bool)> {
        if session.status != SessionStatus::Active {
            return Ok((session, false));
        }
        let expired = session
            .expires_at
            .map(|deadline| Utc::now() >= deadline)
            .unwrap_or(false);
        if !expired {
            return Ok((session, false));
        }
        self.finalize(&session, SessionStatus::Expired).await
    }

    /// Compute the final score and perform the single state transition.
    async fn finalize(
        &self,
        session: &Session,
        status: SessionStatus,
    ) -> Result<(Session, bool)> {
        let answers = self
            .sessions
            .list_answers(session.id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let score_correct = answers
            .iter()
            .filter(|a| a.is_correct == Some(true))
            .count() as i32;
        let score_total = session.total_questions;
        let score_pct = if score_total > 0 {
            round2(score_correct as f64 / score_total as f64 * 100.0)
        } else {
            0.0
        };

        let (stored, transitioned) = self
            .sessions
            .finalize_session(
                session.id,
                status,
                score_correct,
                score_total,
                score_pct,
                Utc::now(),
            )
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        if transitioned {
            tracing::info!(
                session_id = %session.id,
                status = stored.status.as_str(),
                score_pct,
                "session finalized"
            );
        }
        Ok((stored, transitioned))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn fetch_owned(&self, actor: Actor, session_id: Uuid) -> Result<Session> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        if session.user_id != actor.user_id {
            // Do not leak other learners' session ids.
            return Err(EngineError::NotFound(format!("session {session_id}")));
        }
        Ok(session)
    }

    async fn record_event_kinds(
        &self,
        session_id: Uuid,
        item_id: Uuid,
        kinds: &[AttemptEventKind],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if kinds.is_empty() {
            return Ok(());
        }
        let mut seq = self
            .sessions
            .next_event_seq(session_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let events: Vec<AttemptEvent> = kinds
            .iter()
            .map(|&kind| {
                let event = AttemptEvent {
                    session_id,
                    item_id,
                    kind,
                    client_ts: None,
                    server_ts: now,
                    seq,
                };
                seq += 1;
                event
            })
            .collect();
        self.sessions
            .record_events(&events)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))
    }

    async fn resolve_selection_params(&self) -> Result<SelectionParams> {
        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Adaptive)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Ok(resolved
            .map(|(_, params)| SelectionParams::from_value(&params.params))
            .unwrap_or_default())
    }

    async fn resolve_elo_params(&self) -> Result<EloParams> {
        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Difficulty)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Ok(resolved
            .map(|(_, params)| EloParams::from_value(&params.params))
            .unwrap_or_default())
    }
}

// ============================================================================
// PURE HELPERS
// ============================================================================

fn validate_create(request: &CreateSessionRequest) -> Result<()> {
    if request.count == 0 || request.count > MAX_SESSION_QUESTIONS {
        return Err(EngineError::Validation(format!(
            "count must be between 1 and {MAX_SESSION_QUESTIONS}"
        )));
    }
    if request.year <= 0 {
        return Err(EngineError::Validation("year must be positive".to_string()));
    }
    if request.block_ids.is_empty() {
        return Err(EngineError::Validation(
            "at least one block is required".to_string(),
        ));
    }
    if let Some(duration) = request.duration_seconds {
        if duration <= 0 {
            return Err(EngineError::Validation(
                "duration_seconds must be positive".to_string(),
            ));
        }
    }
    if let Some(themes) = &request.theme_ids {
        if themes.is_empty() {
            return Err(EngineError::Validation(
                "theme filter must not be empty when provided".to_string(),
            ));
        }
    }
    Ok(())
}

fn item_view(record: &SessionItemRecord) -> SessionItemView {
    SessionItemView {
        position: record.position,
        item_id: record.item_id,
        stem: record.frozen.stem.clone(),
        options: record.frozen.options.clone(),
        theme_id: record.frozen.theme_id,
        block_id: record.frozen.block_id,
        difficulty: record.frozen.difficulty,
    }
}

/// Progress aggregate: answered count, marked count, and the first
/// unanswered position (or the last position when all are answered).
pub fn compute_progress(
    items: &[SessionItemRecord],
    answers: &[SessionAnswer],
) -> SessionProgress {
    let answered: HashSet<Uuid> = answers
        .iter()
        .filter(|a| a.selected_index.is_some())
        .map(|a| a.item_id)
        .collect();
    let marked = answers.iter().filter(|a| a.marked_for_review).count() as i32;

    let mut current_position = 1;
    let mut found = false;
    for record in items {
        if !answered.contains(&record.item_id) {
            current_position = record.position;
            found = true;
            break;
        }
    }
    if !found {
        if let Some(last) = items.last() {
            current_position = last.position;
        }
    }

    SessionProgress {
        answered_count: answered.len() as i32,
        marked_for_review_count: marked,
        current_position,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================

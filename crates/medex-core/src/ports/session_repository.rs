use crate::domain::{
    AttemptEvent, AttemptSample, Session, SessionAnswer, SessionAttempt, SessionItemRecord,
    SessionStatus, SyllabusTriple,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence for the session state machine: sessions, frozen session
/// items, answers, and the attempt event stream.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a session together with its frozen items, atomically.
    async fn insert_session(
        &self,
        session: &Session,
        items: &[SessionItemRecord],
    ) -> anyhow::Result<()>;

    async fn get_session(&self, session_id: Uuid) -> anyhow::Result<Option<Session>>;

    /// Frozen items in position order.
    async fn list_items(&self, session_id: Uuid) -> anyhow::Result<Vec<SessionItemRecord>>;

    async fn list_answers(&self, session_id: Uuid) -> anyhow::Result<Vec<SessionAnswer>>;

    async fn get_answer(
        &self,
        session_id: Uuid,
        item_id: Uuid,
    ) -> anyhow::Result<Option<SessionAnswer>>;

    /// Upsert the answer row for `(session, item)`. Concurrent writers
    /// serialize on the uniqueness constraint; the returned row is the
    /// committed state.
    async fn upsert_answer(&self, answer: &SessionAnswer) -> anyhow::Result<SessionAnswer>;

    /// Transition ACTIVE → SUBMITTED/EXPIRED and set scores atomically.
    /// Returns the stored session and whether this call performed the
    /// transition; a no-op when the row is already terminal (the concurrent
    /// winner's scores are returned with `false`).
    async fn finalize_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        score_correct: i32,
        score_total: i32,
        score_pct: f64,
        submitted_at: DateTime<Utc>,
    ) -> anyhow::Result<(Session, bool)>;

    /// Append attempt events with their assigned sequence numbers.
    async fn record_events(&self, events: &[AttemptEvent]) -> anyhow::Result<()>;

    /// Next monotonic event sequence for the session.
    async fn next_event_seq(&self, session_id: Uuid) -> anyhow::Result<i64>;

    /// Graded attempts of a finished session, joined with frozen syllabus
    /// tags and telemetry, for the update pipeline.
    async fn list_session_attempts(
        &self,
        session_id: Uuid,
    ) -> anyhow::Result<Vec<SessionAttempt>>;

    /// Historical attempt samples for one (learner, theme) within the
    /// lookback window, across submitted/expired sessions.
    async fn collect_theme_attempts(
        &self,
        user_id: Uuid,
        theme_id: i64,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttemptSample>>;

    /// Distinct (year, block, theme) triples the learner attempted within
    /// the lookback window.
    async fn attempted_triples(
        &self,
        user_id: Uuid,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SyllabusTriple>>;
}

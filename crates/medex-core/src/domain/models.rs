use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::error::EngineError;

// Roles carried on the request context (auth itself is external)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }
}

/// Identity of the caller, extracted from the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn student(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Student,
        }
    }

    pub fn require_admin(&self) -> Result<(), EngineError> {
        if self.role != Role::Admin {
            return Err(EngineError::NotAuthorized(
                "admin role required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learner {
    pub id: Uuid,
    pub email: Option<String>,
    pub role: Role,
    pub year_of_study: i32,
    pub is_active: bool,
}

// ===== Syllabus dimensions =====

/// (year, block, theme) dimension used for filtering and aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyllabusTriple {
    pub year: i32,
    pub block_id: i64,
    pub theme_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemDifficulty {
    Easy,
    Medium,
    Hard,
}

impl ItemDifficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemDifficulty::Easy => "easy",
            ItemDifficulty::Medium => "medium",
            ItemDifficulty::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "easy" => Some(ItemDifficulty::Easy),
            "medium" => Some(ItemDifficulty::Medium),
            "hard" => Some(ItemDifficulty::Hard),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemDifficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CognitiveLevel {
    Recall,
    Application,
    Analysis,
}

impl CognitiveLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CognitiveLevel::Recall => "recall",
            CognitiveLevel::Application => "application",
            CognitiveLevel::Analysis => "analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recall" => Some(CognitiveLevel::Recall),
            "application" => Some(CognitiveLevel::Application),
            "analysis" => Some(CognitiveLevel::Analysis),
            _ => None,
        }
    }
}

// ===== Published items =====

/// Number of answer options on every published multiple-choice item.
pub const OPTION_COUNT: usize = 5;

/// A published multiple-choice question as exposed by the content view.
///
/// The CMS workflow that produces published items is external; the engine
/// only ever reads items in this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedItem {
    pub id: Uuid,
    pub year: i32,
    pub block_id: i64,
    pub theme_id: i64,
    pub concept_id: Option<i64>,
    pub stem: String,
    pub options: Vec<String>,
    pub correct_index: i32,
    pub explanation: Option<String>,
    pub difficulty: ItemDifficulty,
    pub cognitive_level: CognitiveLevel,
}

impl PublishedItem {
    /// Validates the published-item invariant: exactly five non-empty
    /// options and a correct index in range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.options.len() != OPTION_COUNT {
            return Err(EngineError::Integrity(format!(
                "item {} has {} options, expected {}",
                self.id,
                self.options.len(),
                OPTION_COUNT
            )));
        }
        if self.options.iter().any(|o| o.trim().is_empty()) {
            return Err(EngineError::Integrity(format!(
                "item {} has an empty option",
                self.id
            )));
        }
        if !(0..OPTION_COUNT as i32).contains(&self.correct_index) {
            return Err(EngineError::Integrity(format!(
                "item {} correct_index {} out of range",
                self.id, self.correct_index
            )));
        }
        Ok(())
    }

    /// Copies the item into the immutable snapshot shape frozen onto a
    /// session at creation time.
    pub fn freeze(&self) -> FrozenItem {
        FrozenItem {
            item_id: self.id,
            stem: self.stem.clone(),
            options: self.options.clone(),
            correct_index: self.correct_index,
            explanation: self.explanation.clone(),
            year: self.year,
            block_id: self.block_id,
            theme_id: self.theme_id,
            concept_id: self.concept_id,
            difficulty: self.difficulty,
        }
    }
}

/// Per-item content snapshot stored on a session item.
///
/// Grading and rendering read only from this snapshot, never from the live
/// item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenItem {
    pub item_id: Uuid,
    pub stem: String,
    pub options: Vec<String>,
    pub correct_index: i32,
    pub explanation: Option<String>,
    pub year: i32,
    pub block_id: i64,
    pub theme_id: i64,
    pub concept_id: Option<i64>,
    pub difficulty: ItemDifficulty,
}

// ===== Sessions =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionMode {
    Tutor,
    Exam,
    Revision,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Tutor => "TUTOR",
            SessionMode::Exam => "EXAM",
            SessionMode::Revision => "REVISION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TUTOR" => Some(SessionMode::Tutor),
            "EXAM" => Some(SessionMode::Exam),
            "REVISION" => Some(SessionMode::Revision),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    Submitted,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Submitted => "SUBMITTED",
            SessionStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SessionStatus::Active),
            "SUBMITTED" => Some(SessionStatus::Submitted),
            "EXPIRED" => Some(SessionStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Submitted | SessionStatus::Expired)
    }
}

/// Runtime configuration captured at session creation.
///
/// Decisions for the session consult this snapshot, never the live config,
/// so a kill-switch flip never perturbs a session mid-flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub profile: String,
    pub overrides: BTreeMap<String, String>,
    pub policy_version: String,
    pub exam_mode: bool,
    pub freeze_updates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub year: i32,
    pub block_ids: Vec<i64>,
    pub theme_ids: Option<Vec<i64>>,
    pub total_questions: i32,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub score_correct: Option<i32>,
    pub score_total: Option<i32>,
    pub score_pct: Option<f64>,
    pub algo_at_start: RuntimeSnapshot,
}

/// One ordered slot of a session, with the frozen content and the item
/// version recorded at freeze time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionItemRecord {
    pub session_id: Uuid,
    pub position: i32,
    pub item_id: Uuid,
    pub item_version: i64,
    pub frozen: FrozenItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnswer {
    pub id: Uuid,
    pub session_id: Uuid,
    pub item_id: Uuid,
    pub selected_index: Option<i32>,
    pub is_correct: Option<bool>,
    pub answered_at: Option<DateTime<Utc>>,
    pub changed_count: i32,
    pub marked_for_review: bool,
}

/// Aggregate answering progress for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub answered_count: i32,
    pub marked_for_review_count: i32,
    /// First unanswered position, or the last position when all answered.
    pub current_position: i32,
}

// ===== Attempt telemetry =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptEventKind {
    QuestionViewed,
    AnswerSelected,
    AnswerChanged,
    Blur,
    MarkReview,
}

impl AttemptEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptEventKind::QuestionViewed => "QUESTION_VIEWED",
            AttemptEventKind::AnswerSelected => "ANSWER_SELECTED",
            AttemptEventKind::AnswerChanged => "ANSWER_CHANGED",
            AttemptEventKind::Blur => "BLUR",
            AttemptEventKind::MarkReview => "MARK_REVIEW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUESTION_VIEWED" => Some(AttemptEventKind::QuestionViewed),
            "ANSWER_SELECTED" => Some(AttemptEventKind::AnswerSelected),
            "ANSWER_CHANGED" => Some(AttemptEventKind::AnswerChanged),
            "BLUR" => Some(AttemptEventKind::Blur),
            "MARK_REVIEW" => Some(AttemptEventKind::MarkReview),
            _ => None,
        }
    }
}

/// Telemetry event for one answer interaction, with a monotonic per-session
/// sequence assigned at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub session_id: Uuid,
    pub item_id: Uuid,
    pub kind: AttemptEventKind,
    pub client_ts: Option<DateTime<Utc>>,
    pub server_ts: DateTime<Utc>,
    pub seq: i64,
}

/// A graded attempt joined with its frozen syllabus tags and telemetry,
/// as consumed by the update pipeline.
#[derive(Debug, Clone)]
pub struct SessionAttempt {
    /// The session answer row id; Elo updates are idempotent on it.
    pub attempt_id: Uuid,
    pub item_id: Uuid,
    pub year: i32,
    pub block_id: i64,
    pub theme_id: i64,
    pub concept_id: Option<i64>,
    pub is_correct: bool,
    pub answered_at: Option<DateTime<Utc>>,
    pub time_spent_ms: Option<i64>,
    pub change_count: i32,
    pub marked_for_review: bool,
    pub difficulty: Option<ItemDifficulty>,
}

/// A single historical attempt sample used by mastery computation.
#[derive(Debug, Clone)]
pub struct AttemptSample {
    pub is_correct: bool,
    pub answered_at: Option<DateTime<Utc>>,
    pub difficulty: Option<ItemDifficulty>,
}

// ===== Knowledge state =====

/// Which model family produced a state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    V0,
    V1,
    Hybrid,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::V0 => "v0",
            ModelKind::V1 => "v1",
            ModelKind::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v0" => Some(ModelKind::V0),
            "v1" => Some(ModelKind::V1),
            "hybrid" => Some(ModelKind::Hybrid),
            _ => None,
        }
    }
}

/// Provenance stamped on every knowledge-state write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub algo_version_id: Option<Uuid>,
    pub params_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
}

/// Per (learner, theme) mastery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub user_id: Uuid,
    pub year: i32,
    pub block_id: i64,
    pub theme_id: i64,
    pub attempts_total: i64,
    pub correct_total: i64,
    pub accuracy_pct: f64,
    pub mastery_score: f64,
    pub mastery_model: ModelKind,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Opaque model-state blob: bucket breakdown for v0, BKT posterior for v1.
    pub breakdown: serde_json::Value,
    pub provenance: Provenance,
}

/// Per (learner, concept) review-schedule state. Theme-level due counts are
/// derived by aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub user_id: Uuid,
    pub theme_id: i64,
    pub concept_id: i64,
    pub due_at: DateTime<Utc>,
    pub last_review_at: DateTime<Utc>,
    pub model: ModelKind,
    // FSRS state (v1)
    pub stability: Option<f64>,
    pub difficulty: Option<f64>,
    pub retrievability: Option<f64>,
    // Interval-bucket state (v0)
    pub interval_days: Option<i64>,
    pub stage: Option<i32>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EloScope {
    User,
    Item,
}

impl EloScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EloScope::User => "user",
            EloScope::Item => "item",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(EloScope::User),
            "item" => Some(EloScope::Item),
            _ => None,
        }
    }
}

/// Elo-style rating with uncertainty, for a learner or an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EloRating {
    pub scope: EloScope,
    pub user_id: Option<Uuid>,
    pub item_id: Option<Uuid>,
    pub rating: f64,
    pub uncertainty: f64,
    pub n_attempts: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Beta posterior for a (learner, theme) bandit arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditThemeState {
    pub user_id: Uuid,
    pub theme_id: i64,
    pub alpha: f64,
    pub beta: f64,
    pub n_sessions: i64,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub last_reward: Option<f64>,
}

// ============================================================================
// TESTS
// ============================================================================

//! Request/response DTOs for the transport layer.
//!
//! The transport itself (HTTP, auth, rate limits) is external; these types
//! are the named contract it codes against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use medex_core::domain::{
    CognitiveLevel, EngineError, ItemDifficulty, SessionMode, SessionStatus,
};
use medex_core::session::CreateSessionRequest;

// ============================================================================
// SESSION DTOS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionDto {
    pub mode: String,
    pub year: i32,
    pub blocks: Vec<i64>,
    pub themes: Option<Vec<i64>>,
    pub count: usize,
    pub duration_seconds: Option<i64>,
    pub difficulty: Option<Vec<String>>,
    pub cognitive: Option<Vec<String>>,
}

impl CreateSessionDto {
    pub fn into_request(self) -> Result<CreateSessionRequest, EngineError> {
        let mode = SessionMode::parse(&self.mode).ok_or_else(|| {
            EngineError::Validation(format!(
                "invalid mode {:?}, must be TUTOR, EXAM or REVISION",
                self.mode
            ))
        })?;
        let difficulty = self
            .difficulty
            .map(|values| {
                values
                    .iter()
                    .map(|raw| {
                        ItemDifficulty::parse(raw).ok_or_else(|| {
                            EngineError::Validation(format!("invalid difficulty {raw:?}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let cognitive = self
            .cognitive
            .map(|values| {
                values
                    .iter()
                    .map(|raw| {
                        CognitiveLevel::parse(raw).ok_or_else(|| {
                            EngineError::Validation(format!("invalid cognitive level {raw:?}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(CreateSessionRequest {
            mode,
            year: self.year,
            block_ids: self.blocks,
            theme_ids: self.themes,
            count: self.count,
            duration_seconds: self.duration_seconds,
            difficulty,
            cognitive,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerDto {
    pub question_id: Uuid,
    pub selected_index: Option<i32>,
    pub marked_for_review: Option<bool>,
}

/// Client-side attempt telemetry event (viewed/blur and friends).
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptEventDto {
    pub question_id: Uuid,
    pub kind: String,
    pub client_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponseDto {
    pub question_id: Uuid,
    pub selected_index: Option<i32>,
    pub changed_count: i32,
    pub marked_for_review: bool,
    pub progress: ProgressDto,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressDto {
    pub answered_count: i32,
    pub marked_for_review_count: i32,
    pub current_position: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummaryDto {
    pub id: Uuid,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub total_questions: i32,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub score_correct: Option<i32>,
    pub score_total: Option<i32>,
    pub score_pct: Option<f64>,
}

// ============================================================================
// ADMIN DTOS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchProfileDto {
    pub profile: String,
    pub overrides: Option<BTreeMap<String, String>>,
    pub reason: String,
    pub confirmation_phrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FreezeDto {
    pub reason: String,
    pub confirmation_phrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalRequestDto {
    pub action_type: String,
    pub payload: Option<serde_json::Value>,
    pub reason: String,
    pub confirmation_phrase: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalDecisionDto {
    pub request_id: Uuid,
    pub confirmation_phrase: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatusDto {
    pub active_profile: String,
    pub active_since: DateTime<Utc>,
    pub overrides: BTreeMap<String, String>,
    pub freeze_updates: bool,
    pub prefer_cache: bool,
    pub pending_approvals: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalDto {
    pub request_id: Uuid,
    pub action_type: String,
    pub status: String,
    pub reason: String,
    pub requested_by: Uuid,
    pub approver: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ============================================================================
// ERROR ENVELOPE
// ============================================================================

/// Error envelope the transport serializes; status mapping is the
/// transport's concern, the code is stable.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDto {
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for ErrorDto {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

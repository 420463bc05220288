//! Service facade wiring storage and core services together.
//!
//! The HTTP transport, auth, and rate limiting are external; they call these
//! methods with an already-resolved `Actor` and serialize the results.

pub mod audit;
pub mod config;
pub mod types;

pub use audit::{AuditBuffer, AuditEnvelope};
pub use config::AppConfig;

use once_cell::sync::OnceCell;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use medex_core::analytics::{AnalyticsService, BlockAnalytics, LearnerOverview, ThemeAnalytics};
use medex_core::domain::{Actor, AttemptEventKind, EngineError, Result, Session};
use medex_core::pipeline::UpdatePipeline;
use medex_core::ports::{
    ContentRepository, RuntimeRepository, SessionRepository, StateRepository,
};
use medex_core::runtime::{
    ActionType, ApprovalService, ProfileSwitch, RuntimeControl, RuntimeProfile,
};
use medex_core::session::{IncomingEvent, SessionReview, SessionService, SessionState};
use medex_storage::{
    init_db, SqliteContentRepository, SqliteRuntimeRepository, SqliteSessionRepository,
    SqliteStateRepository,
};

use types::{
    AnswerDto, AnswerResponseDto, ApprovalDecisionDto, ApprovalDto, ApprovalRequestDto,
    AttemptEventDto, CreateSessionDto, FreezeDto, ProgressDto, RuntimeStatusDto,
    SessionSummaryDto, SwitchProfileDto,
};

// ============================================================================
// APP STATE
// ============================================================================

pub struct AppState {
    pub pool: SqlitePool,
    pub content_repo: Arc<SqliteContentRepository>,
    pub state_repo: Arc<SqliteStateRepository>,
    pub runtime_repo: Arc<SqliteRuntimeRepository>,
    pub runtime: Arc<RuntimeControl>,
    pub audit: Arc<AuditBuffer>,
    session_service: SessionService,
    approval_service: ApprovalService,
    pipeline: UpdatePipeline,
    analytics: AnalyticsService,
}

static APP: OnceCell<AppState> = OnceCell::new();

/// Process-wide state (call `setup` first).
pub fn app() -> &'static AppState {
    APP.get().expect("engine not initialized - call setup first")
}

/// One-time process setup from environment configuration.
pub async fn setup(config: &AppConfig) -> anyhow::Result<&'static AppState> {
    let state = AppState::connect(&config.database_url, config.is_production(), config.exam_mode)
        .await?;
    APP.set(state)
        .map_err(|_| anyhow::anyhow!("engine already initialized"))?;
    Ok(app())
}

impl AppState {
    /// Build a full engine stack over one database. Used by `setup` and by
    /// tests that want an isolated instance.
    pub async fn connect(
        database_url: &str,
        production: bool,
        exam_mode: bool,
    ) -> anyhow::Result<Self> {
        let pool = init_db(database_url).await?;

        let content_repo = Arc::new(SqliteContentRepository::new(pool.clone()));
        let state_repo = Arc::new(SqliteStateRepository::new(pool.clone()));
        let session_repo = Arc::new(SqliteSessionRepository::new(pool.clone()));
        let runtime_repo = Arc::new(SqliteRuntimeRepository::new(pool.clone()));
        let audit = Arc::new(AuditBuffer::new());

        let runtime = Arc::new(RuntimeControl::new(
            Arc::clone(&runtime_repo) as Arc<dyn RuntimeRepository>,
            audit.clone(),
            production,
            exam_mode,
        ));

        let session_service = SessionService::new(
            Arc::clone(&content_repo) as Arc<dyn ContentRepository>,
            Arc::clone(&session_repo) as Arc<dyn SessionRepository>,
            Arc::clone(&state_repo) as Arc<dyn StateRepository>,
            Arc::clone(&runtime),
        );
        let pipeline = UpdatePipeline::new(
            Arc::clone(&session_repo) as Arc<dyn SessionRepository>,
            Arc::clone(&state_repo) as Arc<dyn StateRepository>,
            Arc::clone(&runtime),
        );
        let analytics =
            AnalyticsService::new(Arc::clone(&state_repo) as Arc<dyn StateRepository>);
        let approval_service = ApprovalService::new(Arc::clone(&runtime), audit.clone());

        Ok(Self {
            pool,
            content_repo,
            state_repo,
            runtime_repo,
            runtime,
            audit,
            session_service,
            approval_service,
            pipeline,
            analytics,
        })
    }

    // ========================================================================
    // Learner surface
    // ========================================================================

    pub async fn create_session(
        &self,
        actor: Actor,
        dto: CreateSessionDto,
    ) -> Result<SessionState> {
        let request = dto.into_request()?;
        self.session_service.create(actor, request).await
    }

    /// State read with lazy expiry; an expiry edge triggers the same
    /// telemetry fan-out as submit.
    pub async fn get_session(&self, actor: Actor, session_id: Uuid) -> Result<SessionState> {
        let (state, expired_now) = self.session_service.get_state(actor, session_id).await?;
        if expired_now {
            self.fan_out(&state.session).await;
        }
        Ok(state)
    }

    pub async fn submit_answer(
        &self,
        actor: Actor,
        session_id: Uuid,
        dto: AnswerDto,
    ) -> Result<AnswerResponseDto> {
        let (answer, progress) = self
            .session_service
            .submit_answer(
                actor,
                session_id,
                dto.question_id,
                dto.selected_index,
                dto.marked_for_review,
            )
            .await?;
        Ok(AnswerResponseDto {
            question_id: answer.item_id,
            selected_index: answer.selected_index,
            changed_count: answer.changed_count,
            marked_for_review: answer.marked_for_review,
            progress: ProgressDto {
                answered_count: progress.answered_count,
                marked_for_review_count: progress.marked_for_review_count,
                current_position: progress.current_position,
            },
        })
    }

    /// Idempotent submit; the fan-out runs only on the transition edge.
    pub async fn submit_session(
        &self,
        actor: Actor,
        session_id: Uuid,
    ) -> Result<SessionSummaryDto> {
        let (session, transitioned) = self.session_service.submit(actor, session_id).await?;
        if transitioned {
            self.fan_out(&session).await;
        }
        Ok(summary_of(&session))
    }

    pub async fn review_session(
        &self,
        actor: Actor,
        session_id: Uuid,
    ) -> Result<SessionReview> {
        self.session_service.review(actor, session_id).await
    }

    /// Ingest client attempt telemetry for an active session.
    pub async fn record_events(
        &self,
        actor: Actor,
        session_id: Uuid,
        events: Vec<AttemptEventDto>,
    ) -> Result<usize> {
        let incoming = events
            .into_iter()
            .map(|dto| {
                let kind = AttemptEventKind::parse(&dto.kind).ok_or_else(|| {
                    EngineError::Validation(format!("unknown event kind {:?}", dto.kind))
                })?;
                Ok(IncomingEvent {
                    item_id: dto.question_id,
                    kind,
                    client_ts: dto.client_ts,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.session_service
            .record_events(actor, session_id, incoming)
            .await
    }

    async fn fan_out(&self, session: &Session) {
        match self.pipeline.on_session_finished(session).await {
            Ok(summary) => {
                tracing::info!(
                    session_id = %session.id,
                    modules = summary.modules.len(),
                    "telemetry fan-out complete"
                );
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "telemetry fan-out failed");
            }
        }
    }

    // ========================================================================
    // Analytics surface
    // ========================================================================

    pub async fn analytics_overview(&self, actor: Actor) -> Result<LearnerOverview> {
        self.analytics.overview(actor.user_id).await
    }

    pub async fn analytics_block(&self, actor: Actor, block_id: i64) -> Result<BlockAnalytics> {
        self.analytics.block(actor.user_id, block_id).await
    }

    pub async fn analytics_theme(
        &self,
        actor: Actor,
        theme_id: i64,
    ) -> Result<Option<ThemeAnalytics>> {
        self.analytics.theme(actor.user_id, theme_id).await
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    pub async fn runtime_status(&self, actor: Actor) -> Result<RuntimeStatusDto> {
        actor.require_admin()?;
        let config = self.runtime.config_live().await?;
        let pending = self.approval_service.list_pending(actor).await?;
        Ok(RuntimeStatusDto {
            active_profile: config.active_profile.as_str().to_string(),
            active_since: config.active_since,
            overrides: config.overrides,
            freeze_updates: config.safe_mode.freeze_updates,
            prefer_cache: config.safe_mode.prefer_cache,
            pending_approvals: pending.len(),
        })
    }

    pub async fn switch_profile(
        &self,
        actor: Actor,
        dto: SwitchProfileDto,
    ) -> Result<RuntimeStatusDto> {
        let target = RuntimeProfile::parse(&dto.profile).ok_or_else(|| {
            EngineError::Validation(format!(
                "invalid profile {:?}, must be V1_PRIMARY or V0_FALLBACK",
                dto.profile
            ))
        })?;
        self.runtime
            .switch_profile(
                ProfileSwitch {
                    target,
                    overrides: dto.overrides.unwrap_or_default(),
                    reason: dto.reason,
                    confirmation_phrase: dto.confirmation_phrase,
                },
                actor,
            )
            .await?;
        self.runtime_status(actor).await
    }

    pub async fn freeze_updates(&self, actor: Actor, dto: FreezeDto) -> Result<RuntimeStatusDto> {
        self.runtime
            .set_freeze(true, &dto.reason, dto.confirmation_phrase.as_deref(), actor)
            .await?;
        self.runtime_status(actor).await
    }

    pub async fn unfreeze_updates(
        &self,
        actor: Actor,
        dto: FreezeDto,
    ) -> Result<RuntimeStatusDto> {
        self.runtime
            .set_freeze(false, &dto.reason, dto.confirmation_phrase.as_deref(), actor)
            .await?;
        self.runtime_status(actor).await
    }

    pub async fn request_approval(
        &self,
        actor: Actor,
        dto: ApprovalRequestDto,
    ) -> Result<ApprovalDto> {
        let action_type = ActionType::parse(&dto.action_type).ok_or_else(|| {
            EngineError::Validation(format!("unknown action type {:?}", dto.action_type))
        })?;
        let approval = self
            .approval_service
            .request(
                action_type,
                dto.payload.unwrap_or(Value::Null),
                &dto.reason,
                &dto.confirmation_phrase,
                actor,
            )
            .await?;
        Ok(approval_dto(&approval))
    }

    pub async fn approve(&self, actor: Actor, dto: ApprovalDecisionDto) -> Result<ApprovalDto> {
        let phrase = dto.confirmation_phrase.unwrap_or_default();
        let approval = self
            .approval_service
            .approve(dto.request_id, &phrase, actor)
            .await?;
        Ok(approval_dto(&approval))
    }

    pub async fn reject(&self, actor: Actor, dto: ApprovalDecisionDto) -> Result<ApprovalDto> {
        let approval = self.approval_service.reject(dto.request_id, actor).await?;
        Ok(approval_dto(&approval))
    }

    pub async fn list_pending_approvals(&self, actor: Actor) -> Result<Vec<ApprovalDto>> {
        let approvals = self.approval_service.list_pending(actor).await?;
        Ok(approvals.iter().map(approval_dto).collect())
    }

    // ========================================================================
    // Recompute jobs
    // ========================================================================

    pub async fn recompute_mastery(
        &self,
        actor: Actor,
        user_id: Uuid,
        theme_ids: Option<Vec<i64>>,
    ) -> Result<Value> {
        actor.require_admin()?;
        self.pipeline
            .recompute_mastery_for_user(user_id, theme_ids.as_deref(), "api")
            .await
    }

    pub async fn recenter_ratings(&self, actor: Actor) -> Result<Value> {
        actor.require_admin()?;
        self.pipeline.recenter_item_ratings("api").await
    }
}

fn summary_of(session: &Session) -> SessionSummaryDto {
    SessionSummaryDto {
        id: session.id,
        status: session.status,
        mode: session.mode,
        total_questions: session.total_questions,
        started_at: session.started_at,
        expires_at: session.expires_at,
        submitted_at: session.submitted_at,
        score_correct: session.score_correct,
        score_total: session.score_total,
        score_pct: session.score_pct,
    }
}

fn approval_dto(approval: &medex_core::runtime::ApprovalRecord) -> ApprovalDto {
    ApprovalDto {
        request_id: approval.id,
        action_type: approval.action_type.as_str().to_string(),
        status: approval.status.as_str().to_string(),
        reason: approval.reason.clone(),
        requested_by: approval.requested_by,
        approver: approval.approver,
        created_at: approval.created_at,
        decided_at: approval.decided_at,
    }
}

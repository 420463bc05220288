/// Two-person approval workflow for high-risk runtime actions.
///
/// One admin files a request with the exact confirmation phrase for the
/// action; a different admin approves with their own phrase; only the
/// approval path executes the change, exactly once. Direct calls to the
/// underlying action are rejected while any PENDING or APPROVED request
/// exists for the action type.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Actor, EngineError, Result};
use crate::ports::{AuditEvent, AuditSink, RuntimeRepository};
use crate::runtime::{RuntimeControl, RuntimeProfile};

// ============================================================================
// ACTION TYPES
// ============================================================================

/// High-risk actions that require two-person approval in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    ProfileSwitchPrimary,
    ProfileSwitchFallback,
    IrtActivate,
    ElasticsearchEnable,
    Neo4jEnable,
    SnowflakeExportEnable,
}

impl ActionType {
    pub fn all() -> &'static [ActionType] {
        &[
            ActionType::ProfileSwitchPrimary,
            ActionType::ProfileSwitchFallback,
            ActionType::IrtActivate,
            ActionType::ElasticsearchEnable,
            ActionType::Neo4jEnable,
            ActionType::SnowflakeExportEnable,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ProfileSwitchPrimary => "PROFILE_SWITCH_PRIMARY",
            ActionType::ProfileSwitchFallback => "PROFILE_SWITCH_FALLBACK",
            ActionType::IrtActivate => "IRT_ACTIVATE",
            ActionType::ElasticsearchEnable => "ELASTICSEARCH_ENABLE",
            ActionType::Neo4jEnable => "NEO4J_ENABLE",
            ActionType::SnowflakeExportEnable => "SNOWFLAKE_EXPORT_ENABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROFILE_SWITCH_PRIMARY" => Some(ActionType::ProfileSwitchPrimary),
            "PROFILE_SWITCH_FALLBACK" => Some(ActionType::ProfileSwitchFallback),
            "IRT_ACTIVATE" => Some(ActionType::IrtActivate),
            "ELASTICSEARCH_ENABLE" => Some(ActionType::ElasticsearchEnable),
            "NEO4J_ENABLE" => Some(ActionType::Neo4jEnable),
            "SNOWFLAKE_EXPORT_ENABLE" => Some(ActionType::SnowflakeExportEnable),
            _ => None,
        }
    }

    /// Exact confirmation phrase both the requester and the approver must
    /// type for this action.
    pub fn confirmation_phrase(&self) -> &'static str {
        match self {
            ActionType::ProfileSwitchPrimary => "SWITCH TO V1_PRIMARY",
            ActionType::ProfileSwitchFallback => "SWITCH TO V0_FALLBACK",
            ActionType::IrtActivate => "ACTIVATE IRT",
            ActionType::ElasticsearchEnable => "ENABLE ELASTICSEARCH",
            ActionType::Neo4jEnable => "ENABLE NEO4J",
            ActionType::SnowflakeExportEnable => "ENABLE SNOWFLAKE EXPORT",
        }
    }

    /// Audit action emitted when the approved change executes.
    fn executed_audit_action(&self) -> &'static str {
        match self {
            ActionType::ProfileSwitchPrimary | ActionType::ProfileSwitchFallback => {
                "ALGO_MODE_SWITCH"
            }
            ActionType::IrtActivate => "IRT_ACTIVATED",
            ActionType::ElasticsearchEnable => "ELASTICSEARCH_ENABLED",
            ActionType::Neo4jEnable => "NEO4J_ENABLED",
            ActionType::SnowflakeExportEnable => "SNOWFLAKE_EXPORT_ENABLED",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// APPROVAL RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ApprovalStatus::Pending),
            "APPROVED" => Some(ApprovalStatus::Approved),
            "REJECTED" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub action_type: ActionType,
    pub payload: Value,
    pub reason: String,
    pub requested_by: Uuid,
    pub status: ApprovalStatus,
    pub approver: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn new(
        action_type: ActionType,
        payload: Value,
        reason: String,
        requested_by: Uuid,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            payload,
            reason,
            requested_by,
            status: ApprovalStatus::Pending,
            approver: None,
            decided_at: None,
            created_at,
        }
    }
}

// ============================================================================
// DIRECT-ACTION GATE
// ============================================================================

/// Reject a direct high-risk action call in production.
///
/// All three states block: no request filed, a PENDING request, or an
/// APPROVED request (the approval path already executed the change). The
/// approval workflow is the only executor.
pub async fn ensure_direct_action_allowed(
    repo: &dyn RuntimeRepository,
    action: ActionType,
) -> Result<()> {
    let blocking = repo
        .find_blocking_approval(action.as_str())
        .await
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    let message = match blocking {
        None => format!(
            "action {action} requires two-person approval in production; request approval first"
        ),
        Some(approval) if approval.status == ApprovalStatus::Pending => format!(
            "action {action} requires two-person approval in production; request {} is pending",
            approval.id
        ),
        Some(approval) => format!(
            "action {action} was already executed via approval workflow (request {})",
            approval.id
        ),
    };
    Err(EngineError::ApprovalRequired(message))
}

// ============================================================================
// APPROVAL SERVICE
// ============================================================================

pub struct ApprovalService {
    repo: Arc<dyn RuntimeRepository>,
    runtime: Arc<RuntimeControl>,
    audit: Arc<dyn AuditSink>,
}

impl ApprovalService {
    pub fn new(
        runtime: Arc<RuntimeControl>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            repo: runtime.repo(),
            runtime,
            audit,
        }
    }

    /// File an approval request. Enforces one PENDING request per action
    /// type and the requester's confirmation phrase.
    pub async fn request(
        &self,
        action_type: ActionType,
        payload: Value,
        reason: &str,
        confirmation_phrase: &str,
        actor: Actor,
    ) -> Result<ApprovalRecord> {
        actor.require_admin()?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation(
                "reason is required for approval requests".to_string(),
            ));
        }
        if confirmation_phrase != action_type.confirmation_phrase() {
            return Err(EngineError::InvalidConfirmation(format!(
                "expected exact phrase: {}",
                action_type.confirmation_phrase()
            )));
        }
        if !self.runtime.is_production() {
            return Err(EngineError::Validation(format!(
                "action {action_type} does not require approval outside production"
            )));
        }

        if let Some(pending) = self
            .repo
            .find_pending_approval(action_type.as_str())
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
        {
            return Err(EngineError::Conflict(format!(
                "pending approval already exists for {action_type} (request {})",
                pending.id
            )));
        }

        let approval = ApprovalRecord::new(
            action_type,
            payload,
            reason.to_string(),
            actor.user_id,
            Utc::now(),
        );
        self.repo
            .insert_approval(&approval)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        self.audit.emit(AuditEvent {
            action: "APPROVAL_REQUESTED".to_string(),
            actor: actor.user_id,
            role: actor.role,
            before: Value::Null,
            after: serde_json::json!({
                "action_type": action_type.as_str(),
                "status": "PENDING",
            }),
            reason: reason.to_string(),
            request_id: approval.id,
        });

        tracing::info!(
            action = action_type.as_str(),
            request_id = %approval.id,
            "approval requested"
        );
        Ok(approval)
    }

    pub async fn list_pending(&self, actor: Actor) -> Result<Vec<ApprovalRecord>> {
        actor.require_admin()?;
        self.repo
            .list_pending_approvals()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))
    }

    /// Approve a PENDING request and execute the approved action exactly
    /// once. The approver must differ from the requester and supply the
    /// action's confirmation phrase.
    pub async fn approve(
        &self,
        approval_id: Uuid,
        confirmation_phrase: &str,
        actor: Actor,
    ) -> Result<ApprovalRecord> {
        actor.require_admin()?;

        let mut approval = self
            .repo
            .get_approval(approval_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .ok_or_else(|| {
                EngineError::NotFound(format!("approval request {approval_id}"))
            })?;

        if approval.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "approval request {approval_id} is {}, not PENDING",
                approval.status.as_str()
            )));
        }
        if approval.requested_by == actor.user_id {
            return Err(EngineError::NotAuthorized(
                "self-approval is not allowed; a different admin must approve".to_string(),
            ));
        }
        if confirmation_phrase != approval.action_type.confirmation_phrase() {
            return Err(EngineError::InvalidConfirmation(format!(
                "expected exact phrase: {}",
                approval.action_type.confirmation_phrase()
            )));
        }

        approval.status = ApprovalStatus::Approved;
        approval.approver = Some(actor.user_id);
        approval.decided_at = Some(Utc::now());
        self.repo
            .update_approval(&approval)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        // Execute the approved action. This is the only path that executes
        // high-risk actions in production.
        self.execute_approved(&approval, actor).await?;

        self.audit.emit(AuditEvent {
            action: "APPROVAL_APPROVED".to_string(),
            actor: actor.user_id,
            role: actor.role,
            before: serde_json::json!({"status": "PENDING"}),
            after: serde_json::json!({
                "status": "APPROVED",
                "action_type": approval.action_type.as_str(),
            }),
            reason: approval.reason.clone(),
            request_id: approval.id,
        });

        Ok(approval)
    }

    /// Reject a PENDING request. Like approval, rejection must come from a
    /// different admin.
    pub async fn reject(&self, approval_id: Uuid, actor: Actor) -> Result<ApprovalRecord> {
        actor.require_admin()?;

        let mut approval = self
            .repo
            .get_approval(approval_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .ok_or_else(|| {
                EngineError::NotFound(format!("approval request {approval_id}"))
            })?;

        if approval.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "approval request {approval_id} is {}, not PENDING",
                approval.status.as_str()
            )));
        }
        if approval.requested_by == actor.user_id {
            return Err(EngineError::NotAuthorized(
                "requester cannot decide their own request".to_string(),
            ));
        }

        approval.status = ApprovalStatus::Rejected;
        approval.approver = Some(actor.user_id);
        approval.decided_at = Some(Utc::now());
        self.repo
            .update_approval(&approval)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        self.audit.emit(AuditEvent {
            action: "APPROVAL_REJECTED".to_string(),
            actor: actor.user_id,
            role: actor.role,
            before: serde_json::json!({"status": "PENDING"}),
            after: serde_json::json!({
                "status": "REJECTED",
                "action_type": approval.action_type.as_str(),
            }),
            reason: approval.reason.clone(),
            request_id: approval.id,
        });

        Ok(approval)
    }

    async fn execute_approved(&self, approval: &ApprovalRecord, approver: Actor) -> Result<()> {
        match approval.action_type {
            ActionType::ProfileSwitchPrimary | ActionType::ProfileSwitchFallback => {
                let target = match approval.action_type {
                    ActionType::ProfileSwitchPrimary => RuntimeProfile::V1Primary,
                    _ => RuntimeProfile::V0Fallback,
                };
                let overrides: BTreeMap<String, String> = approval
                    .payload
                    .get("overrides")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                self.runtime
                    .apply_profile_switch(target, overrides, &approval.reason, approver)
                    .await?;
            }
            ActionType::IrtActivate
            | ActionType::ElasticsearchEnable
            | ActionType::Neo4jEnable
            | ActionType::SnowflakeExportEnable => {
                // The integration behind the flag is an external collaborator;
                // execution here is the recorded activation itself.
                self.audit.emit(AuditEvent {
                    action: approval.action_type.executed_audit_action().to_string(),
                    actor: approver.user_id,
                    role: approver.role,
                    before: Value::Null,
                    after: approval.payload.clone(),
                    reason: approval.reason.clone(),
                    request_id: approval.id,
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MockRuntimeRepository, RecordingAuditSink};
    use crate::runtime::RuntimeConfigData;
    use std::sync::Mutex;

    fn service_with(
        repo: MockRuntimeRepository,
        production: bool,
    ) -> (ApprovalService, Arc<RecordingAuditSink>) {
        let audit = Arc::new(RecordingAuditSink::new());
        let runtime = Arc::new(RuntimeControl::new(
            Arc::new(repo),
            audit.clone(),
            production,
            false,
        ));
        (ApprovalService::new(runtime, audit.clone()), audit)
    }

    #[test]
    fn test_action_type_phrases() {
        assert_eq!(
            ActionType::ProfileSwitchFallback.confirmation_phrase(),
            "SWITCH TO V0_FALLBACK"
        );
        assert_eq!(ActionType::IrtActivate.confirmation_phrase(), "ACTIVATE IRT");
        assert_eq!(
            ActionType::SnowflakeExportEnable.confirmation_phrase(),
            "ENABLE SNOWFLAKE EXPORT"
        );
    }

    #[test]
    fn test_action_type_roundtrip() {
        for action in ActionType::all() {
            assert_eq!(ActionType::parse(action.as_str()), Some(*action));
        }
    }

    #[tokio::test]
    async fn test_request_rejects_wrong_phrase() {
        let repo = MockRuntimeRepository::new();
        let (service, _) = service_with(repo, true);

        let err = service
            .request(
                ActionType::IrtActivate,
                serde_json::json!({}),
                "enable irt",
                "ACTIVATE THE IRT",
                Actor::admin(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIRMATION");
    }

    #[tokio::test]
    async fn test_request_outside_production_is_validation_error() {
        let repo = MockRuntimeRepository::new();
        let (service, _) = service_with(repo, false);

        let err = service
            .request(
                ActionType::IrtActivate,
                serde_json::json!({}),
                "enable irt",
                "ACTIVATE IRT",
                Actor::admin(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_request_conflicts_with_existing_pending() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_find_pending_approval().returning(|_| {
            Ok(Some(ApprovalRecord::new(
                ActionType::IrtActivate,
                serde_json::json!({}),
                "r".to_string(),
                Uuid::new_v4(),
                Utc::now(),
            )))
        });
        let (service, _) = service_with(repo, true);

        let err = service
            .request(
                ActionType::IrtActivate,
                serde_json::json!({}),
                "enable irt",
                "ACTIVATE IRT",
                Actor::admin(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_self_approval_rejected() {
        let requester = Uuid::new_v4();
        let approval = ApprovalRecord::new(
            ActionType::ProfileSwitchFallback,
            serde_json::json!({}),
            "incident".to_string(),
            requester,
            Utc::now(),
        );
        let approval_id = approval.id;

        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_approval()
            .returning(move |_| Ok(Some(approval.clone())));
        let (service, _) = service_with(repo, true);

        let err = service
            .approve(approval_id, "SWITCH TO V0_FALLBACK", Actor::admin(requester))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
    }

    #[tokio::test]
    async fn test_approve_executes_profile_switch() {
        let requester = Uuid::new_v4();
        let approver = Uuid::new_v4();
        let approval = ApprovalRecord::new(
            ActionType::ProfileSwitchFallback,
            serde_json::json!({"overrides": {}}),
            "incident 99".to_string(),
            requester,
            Utc::now(),
        );
        let approval_id = approval.id;

        let saved = Arc::new(Mutex::new(None::<RuntimeConfigData>));
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_approval()
            .returning(move |_| Ok(Some(approval.clone())));
        repo.expect_update_approval().returning(|_| Ok(()));
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));
        let sink = Arc::clone(&saved);
        repo.expect_save_config().returning(move |c| {
            *sink.lock().unwrap() = Some(c.clone());
            Ok(())
        });
        repo.expect_append_switch_event().returning(|_| Ok(()));

        let (service, audit) = service_with(repo, true);
        let decided = service
            .approve(approval_id, "SWITCH TO V0_FALLBACK", Actor::admin(approver))
            .await
            .unwrap();

        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.approver, Some(approver));
        let stored = saved.lock().unwrap().clone().unwrap();
        assert_eq!(stored.active_profile, RuntimeProfile::V0Fallback);
        assert_eq!(audit.count_action("ALGO_MODE_SWITCH"), 1);
        assert_eq!(audit.count_action("APPROVAL_APPROVED"), 1);
    }

    #[tokio::test]
    async fn test_approve_non_pending_conflicts() {
        let mut approval = ApprovalRecord::new(
            ActionType::IrtActivate,
            serde_json::json!({}),
            "r".to_string(),
            Uuid::new_v4(),
            Utc::now(),
        );
        approval.status = ApprovalStatus::Rejected;
        let approval_id = approval.id;

        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_approval()
            .returning(move |_| Ok(Some(approval.clone())));
        let (service, _) = service_with(repo, true);

        let err = service
            .approve(approval_id, "ACTIVATE IRT", Actor::admin(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_reject_requires_different_admin() {
        let requester = Uuid::new_v4();
        let approval = ApprovalRecord::new(
            ActionType::Neo4jEnable,
            serde_json::json!({}),
            "r".to_string(),
            requester,
            Utc::now(),
        );
        let approval_id = approval.id;

        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_approval()
            .returning(move |_| Ok(Some(approval.clone())));
        let (service, _) = service_with(repo, true);

        let err = service
            .reject(approval_id, Actor::admin(requester))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
    }

    #[tokio::test]
    async fn test_feature_approval_emits_activation_audit() {
        let requester = Uuid::new_v4();
        let approval = ApprovalRecord::new(
            ActionType::ElasticsearchEnable,
            serde_json::json!({"cluster": "primary"}),
            "search rollout".to_string(),
            requester,
            Utc::now(),
        );
        let approval_id = approval.id;

        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_approval()
            .returning(move |_| Ok(Some(approval.clone())));
        repo.expect_update_approval().returning(|_| Ok(()));
        let (service, audit) = service_with(repo, true);

        service
            .approve(
                approval_id,
                "ENABLE ELASTICSEARCH",
                Actor::admin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(audit.count_action("ELASTICSEARCH_ENABLED"), 1);
    }
}

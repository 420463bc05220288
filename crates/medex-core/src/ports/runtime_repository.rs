use crate::registry::{AlgoParamsRecord, AlgoRunRecord, AlgoVersionRecord};
use crate::runtime::{ApprovalRecord, RuntimeConfigData, SwitchEvent};
use crate::selection::SelectionLogRecord;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence for the runtime control plane: the singleton config row,
/// switch events, two-person approvals, the algorithm registry, and run /
/// selection logs.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RuntimeRepository: Send + Sync {
    // ========================================================================
    // Singleton config + switch events
    // ========================================================================

    async fn get_config(&self) -> anyhow::Result<Option<RuntimeConfigData>>;

    /// Write the singleton config row (insert or replace).
    async fn save_config(&self, config: &RuntimeConfigData) -> anyhow::Result<()>;

    async fn append_switch_event(&self, event: &SwitchEvent) -> anyhow::Result<()>;

    async fn list_switch_events(&self, limit: i64) -> anyhow::Result<Vec<SwitchEvent>>;

    // ========================================================================
    // Two-person approvals
    // ========================================================================

    async fn insert_approval(&self, approval: &ApprovalRecord) -> anyhow::Result<()>;

    async fn get_approval(&self, approval_id: Uuid) -> anyhow::Result<Option<ApprovalRecord>>;

    /// Latest PENDING or APPROVED approval for an action type; both block
    /// direct calls to the action endpoint.
    async fn find_blocking_approval(
        &self,
        action_type: &str,
    ) -> anyhow::Result<Option<ApprovalRecord>>;

    async fn find_pending_approval(
        &self,
        action_type: &str,
    ) -> anyhow::Result<Option<ApprovalRecord>>;

    async fn list_pending_approvals(&self) -> anyhow::Result<Vec<ApprovalRecord>>;

    async fn update_approval(&self, approval: &ApprovalRecord) -> anyhow::Result<()>;

    // ========================================================================
    // Algorithm registry + run log
    // ========================================================================

    /// Active (version, params) pair for an algorithm key.
    async fn resolve_active(
        &self,
        algo_key: &str,
    ) -> anyhow::Result<Option<(AlgoVersionRecord, AlgoParamsRecord)>>;

    async fn insert_run(&self, run: &AlgoRunRecord) -> anyhow::Result<()>;

    async fn update_run(&self, run: &AlgoRunRecord) -> anyhow::Result<()>;

    async fn get_run(&self, run_id: Uuid) -> anyhow::Result<Option<AlgoRunRecord>>;

    async fn insert_selection_log(&self, log: &SelectionLogRecord) -> anyhow::Result<()>;
}

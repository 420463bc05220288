use async_trait::async_trait;
use sqlx::{query, query_as, FromRow, SqlitePool};
use uuid::Uuid;

use medex_core::registry::{
    AlgoParamsRecord, AlgoRunRecord, AlgoVersionRecord, RunStatus,
};
use medex_core::runtime::{
    ActionType, ApprovalRecord, ApprovalStatus, RuntimeConfigData, RuntimeProfile, SafeMode,
    SwitchEvent,
};
use medex_core::selection::SelectionLogRecord;
use medex_core::RuntimeRepository;

use crate::convert::{
    from_millis, opt_from_millis, opt_millis, opt_parse_uuid, parse_json, parse_uuid, to_millis,
};

#[derive(Debug, FromRow)]
struct ConfigRow {
    active_profile: String,
    active_since: i64,
    overrides_json: String,
    freeze_updates: i64,
    prefer_cache: i64,
    changed_by: Option<String>,
    reason: Option<String>,
}

impl ConfigRow {
    fn into_domain(self) -> anyhow::Result<RuntimeConfigData> {
        Ok(RuntimeConfigData {
            active_profile: RuntimeProfile::parse(&self.active_profile)
                .ok_or_else(|| anyhow::anyhow!("unknown profile {:?}", self.active_profile))?,
            active_since: from_millis(self.active_since),
            overrides: serde_json::from_str(&self.overrides_json).unwrap_or_default(),
            safe_mode: SafeMode {
                freeze_updates: self.freeze_updates != 0,
                prefer_cache: self.prefer_cache != 0,
            },
            changed_by: opt_parse_uuid(self.changed_by)?,
            reason: self.reason,
        })
    }
}

#[derive(Debug, FromRow)]
struct ApprovalRow {
    id: String,
    action_type: String,
    payload_json: String,
    reason: String,
    requested_by: String,
    status: String,
    approver: Option<String>,
    decided_at: Option<i64>,
    created_at: i64,
}

impl ApprovalRow {
    fn into_domain(self) -> anyhow::Result<ApprovalRecord> {
        Ok(ApprovalRecord {
            id: parse_uuid(&self.id)?,
            action_type: ActionType::parse(&self.action_type)
                .ok_or_else(|| anyhow::anyhow!("unknown action type {:?}", self.action_type))?,
            payload: parse_json(&self.payload_json),
            reason: self.reason,
            requested_by: parse_uuid(&self.requested_by)?,
            status: ApprovalStatus::parse(&self.status)
                .ok_or_else(|| anyhow::anyhow!("unknown approval status {:?}", self.status))?,
            approver: opt_parse_uuid(self.approver)?,
            decided_at: opt_from_millis(self.decided_at),
            created_at: from_millis(self.created_at),
        })
    }
}

const APPROVAL_COLUMNS: &str = "id, action_type, payload_json, reason, requested_by, \
     status, approver, decided_at, created_at";

pub struct SqliteRuntimeRepository {
    pool: SqlitePool,
}

impl SqliteRuntimeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register an algorithm version + params pair and mark both active.
    /// Used by seeding and the operator CLI.
    pub async fn register_algorithm(
        &self,
        algo_key: &str,
        version: &str,
        params: &serde_json::Value,
    ) -> anyhow::Result<(Uuid, Uuid)> {
        let version_id = Uuid::new_v4();
        let params_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        query("UPDATE algo_versions SET is_active = 0 WHERE algo_key = ?")
            .bind(algo_key)
            .execute(&mut *tx)
            .await?;
        query(
            "INSERT INTO algo_versions (id, algo_key, version, is_active)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(algo_key, version) DO UPDATE SET is_active = 1",
        )
        .bind(version_id.to_string())
        .bind(algo_key)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        let (actual_version_id,): (String,) =
            query_as("SELECT id FROM algo_versions WHERE algo_key = ? AND version = ?")
                .bind(algo_key)
                .bind(version)
                .fetch_one(&mut *tx)
                .await?;

        query("UPDATE algo_params SET is_active = 0 WHERE algo_version_id = ?")
            .bind(&actual_version_id)
            .execute(&mut *tx)
            .await?;
        query(
            "INSERT INTO algo_params (id, algo_version_id, params_json, is_active)
             VALUES (?, ?, ?, 1)",
        )
        .bind(params_id.to_string())
        .bind(&actual_version_id)
        .bind(serde_json::to_string(params)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((parse_uuid(&actual_version_id)?, params_id))
    }
}

#[async_trait]
impl RuntimeRepository for SqliteRuntimeRepository {
    // ========================================================================
    // Config + switch events
    // ========================================================================

    async fn get_config(&self) -> anyhow::Result<Option<RuntimeConfigData>> {
        let row = query_as::<_, ConfigRow>(
            "SELECT active_profile, active_since, overrides_json, freeze_updates,
                    prefer_cache, changed_by, reason
             FROM algo_runtime_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(ConfigRow::into_domain).transpose()
    }

    async fn save_config(&self, config: &RuntimeConfigData) -> anyhow::Result<()> {
        query(
            "INSERT INTO algo_runtime_config
             (id, active_profile, active_since, overrides_json, freeze_updates,
              prefer_cache, changed_by, reason)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                active_profile = excluded.active_profile,
                active_since = excluded.active_since,
                overrides_json = excluded.overrides_json,
                freeze_updates = excluded.freeze_updates,
                prefer_cache = excluded.prefer_cache,
                changed_by = excluded.changed_by,
                reason = excluded.reason",
        )
        .bind(config.active_profile.as_str())
        .bind(to_millis(config.active_since))
        .bind(serde_json::to_string(&config.overrides)?)
        .bind(config.safe_mode.freeze_updates as i64)
        .bind(config.safe_mode.prefer_cache as i64)
        .bind(config.changed_by.map(|id| id.to_string()))
        .bind(&config.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_switch_event(&self, event: &SwitchEvent) -> anyhow::Result<()> {
        query(
            "INSERT INTO algo_switch_events
             (id, previous_json, new_json, reason, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(serde_json::to_string(&event.previous_config)?)
        .bind(serde_json::to_string(&event.new_config)?)
        .bind(&event.reason)
        .bind(event.created_by.to_string())
        .bind(to_millis(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_switch_events(&self, limit: i64) -> anyhow::Result<Vec<SwitchEvent>> {
        #[derive(FromRow)]
        struct EventRow {
            id: String,
            previous_json: String,
            new_json: String,
            reason: String,
            created_by: String,
            created_at: i64,
        }

        let rows = query_as::<_, EventRow>(
            "SELECT id, previous_json, new_json, reason, created_by, created_at
             FROM algo_switch_events ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SwitchEvent {
                    id: parse_uuid(&row.id)?,
                    previous_config: parse_json(&row.previous_json),
                    new_config: parse_json(&row.new_json),
                    reason: row.reason,
                    created_by: parse_uuid(&row.created_by)?,
                    created_at: from_millis(row.created_at),
                })
            })
            .collect()
    }

    // ========================================================================
    // Approvals
    // ========================================================================

    async fn insert_approval(&self, approval: &ApprovalRecord) -> anyhow::Result<()> {
        query(
            "INSERT INTO approvals
             (id, action_type, payload_json, reason, requested_by, status,
              approver, decided_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(approval.id.to_string())
        .bind(approval.action_type.as_str())
        .bind(serde_json::to_string(&approval.payload)?)
        .bind(&approval.reason)
        .bind(approval.requested_by.to_string())
        .bind(approval.status.as_str())
        .bind(approval.approver.map(|id| id.to_string()))
        .bind(opt_millis(approval.decided_at))
        .bind(to_millis(approval.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_approval(&self, approval_id: Uuid) -> anyhow::Result<Option<ApprovalRecord>> {
        let row = query_as::<_, ApprovalRow>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?"
        ))
        .bind(approval_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApprovalRow::into_domain).transpose()
    }

    async fn find_blocking_approval(
        &self,
        action_type: &str,
    ) -> anyhow::Result<Option<ApprovalRecord>> {
        let row = query_as::<_, ApprovalRow>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE action_type = ? AND status IN ('PENDING', 'APPROVED')
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(action_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApprovalRow::into_domain).transpose()
    }

    async fn find_pending_approval(
        &self,
        action_type: &str,
    ) -> anyhow::Result<Option<ApprovalRecord>> {
        let row = query_as::<_, ApprovalRow>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE action_type = ? AND status = 'PENDING' LIMIT 1"
        ))
        .bind(action_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApprovalRow::into_domain).transpose()
    }

    async fn list_pending_approvals(&self) -> anyhow::Result<Vec<ApprovalRecord>> {
        let rows = query_as::<_, ApprovalRow>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE status = 'PENDING' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ApprovalRow::into_domain).collect()
    }

    async fn update_approval(&self, approval: &ApprovalRecord) -> anyhow::Result<()> {
        query(
            "UPDATE approvals
             SET status = ?, approver = ?, decided_at = ?
             WHERE id = ?",
        )
        .bind(approval.status.as_str())
        .bind(approval.approver.map(|id| id.to_string()))
        .bind(opt_millis(approval.decided_at))
        .bind(approval.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Registry + runs
    // ========================================================================

    async fn resolve_active(
        &self,
        algo_key: &str,
    ) -> anyhow::Result<Option<(AlgoVersionRecord, AlgoParamsRecord)>> {
        #[derive(FromRow)]
        struct ActiveRow {
            version_id: String,
            algo_key: String,
            version: String,
            params_id: String,
            params_json: String,
        }

        let row = query_as::<_, ActiveRow>(
            "SELECT v.id AS version_id, v.algo_key, v.version,
                    p.id AS params_id, p.params_json
             FROM algo_versions v
             JOIN algo_params p ON p.algo_version_id = v.id AND p.is_active = 1
             WHERE v.algo_key = ? AND v.is_active = 1
             LIMIT 1",
        )
        .bind(algo_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let version_id = parse_uuid(&row.version_id)?;
            Ok((
                AlgoVersionRecord {
                    id: version_id,
                    algo_key: row.algo_key,
                    version: row.version,
                    is_active: true,
                },
                AlgoParamsRecord {
                    id: parse_uuid(&row.params_id)?,
                    algo_version_id: version_id,
                    params: parse_json(&row.params_json),
                    is_active: true,
                },
            ))
        })
        .transpose()
    }

    async fn insert_run(&self, run: &AlgoRunRecord) -> anyhow::Result<()> {
        query(
            "INSERT INTO algo_runs
             (id, algo_key, algo_version_id, params_id, user_id, session_id,
              trigger_source, status, input_json, output_json, error,
              started_at, finished_at, duration_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(&run.algo_key)
        .bind(run.algo_version_id.map(|id| id.to_string()))
        .bind(run.params_id.map(|id| id.to_string()))
        .bind(run.user_id.map(|id| id.to_string()))
        .bind(run.session_id.map(|id| id.to_string()))
        .bind(&run.trigger)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.input_summary)?)
        .bind(
            run.output_summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&run.error)
        .bind(to_millis(run.started_at))
        .bind(opt_millis(run.finished_at))
        .bind(run.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &AlgoRunRecord) -> anyhow::Result<()> {
        query(
            "UPDATE algo_runs
             SET status = ?, output_json = ?, error = ?, finished_at = ?, duration_ms = ?
             WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(
            run.output_summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&run.error)
        .bind(opt_millis(run.finished_at))
        .bind(run.duration_ms)
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> anyhow::Result<Option<AlgoRunRecord>> {
        #[derive(FromRow)]
        struct RunRow {
            id: String,
            algo_key: String,
            algo_version_id: Option<String>,
            params_id: Option<String>,
            user_id: Option<String>,
            session_id: Option<String>,
            trigger_source: String,
            status: String,
            input_json: String,
            output_json: Option<String>,
            error: Option<String>,
            started_at: i64,
            finished_at: Option<i64>,
            duration_ms: Option<i64>,
        }

        let row = query_as::<_, RunRow>(
            "SELECT id, algo_key, algo_version_id, params_id, user_id, session_id,
                    trigger_source, status, input_json, output_json, error,
                    started_at, finished_at, duration_ms
             FROM algo_runs WHERE id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(AlgoRunRecord {
                id: parse_uuid(&row.id)?,
                algo_key: row.algo_key,
                algo_version_id: opt_parse_uuid(row.algo_version_id)?,
                params_id: opt_parse_uuid(row.params_id)?,
                user_id: opt_parse_uuid(row.user_id)?,
                session_id: opt_parse_uuid(row.session_id)?,
                trigger: row.trigger_source,
                status: RunStatus::parse(&row.status)
                    .ok_or_else(|| anyhow::anyhow!("unknown run status {:?}", row.status))?,
                input_summary: parse_json(&row.input_json),
                output_summary: row.output_json.as_deref().map(parse_json),
                error: row.error,
                started_at: from_millis(row.started_at),
                finished_at: opt_from_millis(row.finished_at),
                duration_ms: row.duration_ms,
            })
        })
        .transpose()
    }

    async fn insert_selection_log(&self, log: &SelectionLogRecord) -> anyhow::Result<()> {
        query(
            "INSERT INTO selection_logs
             (id, user_id, requested_at, mode, year, block_ids_json, theme_filter_json,
              count, seed, run_id, plan_json, item_ids_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.id.to_string())
        .bind(log.user_id.to_string())
        .bind(to_millis(log.requested_at))
        .bind(&log.mode)
        .bind(log.year)
        .bind(serde_json::to_string(&log.block_ids)?)
        .bind(
            log.theme_ids_filter
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(log.count)
        .bind(&log.seed)
        .bind(log.run_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&log.plan)?)
        .bind(serde_json::to_string(&log.item_ids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

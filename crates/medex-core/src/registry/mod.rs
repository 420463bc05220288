/// Algorithm registry and run log.
///
/// Every algorithmic module is registered with a key, a version, and a JSON
/// parameter set. Every recompute logs a run with input/output summaries so
/// a state write can always be traced back to the code and parameters that
/// produced it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::Provenance;
use crate::ports::RuntimeRepository;

// ============================================================================
// ALGORITHM KEYS
// ============================================================================

/// Registry key for an algorithmic module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoKey {
    Mastery,
    Revision,
    Difficulty,
    Adaptive,
}

impl AlgoKey {
    pub fn all() -> &'static [AlgoKey] {
        &[
            AlgoKey::Mastery,
            AlgoKey::Revision,
            AlgoKey::Difficulty,
            AlgoKey::Adaptive,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgoKey::Mastery => "mastery",
            AlgoKey::Revision => "revision",
            AlgoKey::Difficulty => "difficulty",
            AlgoKey::Adaptive => "adaptive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mastery" => Some(AlgoKey::Mastery),
            "revision" => Some(AlgoKey::Revision),
            "difficulty" => Some(AlgoKey::Difficulty),
            "adaptive" => Some(AlgoKey::Adaptive),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlgoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// REGISTRY RECORDS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoVersionRecord {
    pub id: Uuid,
    pub algo_key: String,
    pub version: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoParamsRecord {
    pub id: Uuid,
    pub algo_version_id: Uuid,
    pub params: Value,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One logged recompute run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoRunRecord {
    pub id: Uuid,
    pub algo_key: String,
    pub algo_version_id: Option<Uuid>,
    pub params_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub trigger: String,
    pub status: RunStatus,
    pub input_summary: Value,
    pub output_summary: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

// ============================================================================
// RUN LOGGER
// ============================================================================

/// Helper that resolves the active version/params for a key and writes the
/// RUNNING / SUCCESS / FAILED lifecycle of a run.
pub struct RunLogger {
    repo: Arc<dyn RuntimeRepository>,
}

impl RunLogger {
    pub fn new(repo: Arc<dyn RuntimeRepository>) -> Self {
        Self { repo }
    }

    /// Active (version, params) for a key, when registered.
    pub async fn resolve_active(
        &self,
        key: AlgoKey,
    ) -> anyhow::Result<Option<(AlgoVersionRecord, AlgoParamsRecord)>> {
        self.repo.resolve_active(key.as_str()).await
    }

    /// Start a run and return its record (status RUNNING).
    pub async fn start(
        &self,
        key: AlgoKey,
        provenance_ids: (Option<Uuid>, Option<Uuid>),
        user_id: Option<Uuid>,
        session_id: Option<Uuid>,
        trigger: &str,
        input_summary: Value,
        now: DateTime<Utc>,
    ) -> anyhow::Result<AlgoRunRecord> {
        let run = AlgoRunRecord {
            id: Uuid::new_v4(),
            algo_key: key.as_str().to_string(),
            algo_version_id: provenance_ids.0,
            params_id: provenance_ids.1,
            user_id,
            session_id,
            trigger: trigger.to_string(),
            status: RunStatus::Running,
            input_summary,
            output_summary: None,
            error: None,
            started_at: now,
            finished_at: None,
            duration_ms: None,
        };
        self.repo.insert_run(&run).await?;
        Ok(run)
    }

    /// Mark a run successful with its output summary.
    pub async fn success(
        &self,
        mut run: AlgoRunRecord,
        output_summary: Value,
        now: DateTime<Utc>,
    ) -> anyhow::Result<AlgoRunRecord> {
        run.status = RunStatus::Success;
        run.output_summary = Some(output_summary);
        run.finished_at = Some(now);
        run.duration_ms = Some((now - run.started_at).num_milliseconds());
        self.repo.update_run(&run).await?;
        Ok(run)
    }

    /// Mark a run failed with the error string.
    pub async fn failure(
        &self,
        mut run: AlgoRunRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<AlgoRunRecord> {
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.finished_at = Some(now);
        run.duration_ms = Some((now - run.started_at).num_milliseconds());
        self.repo.update_run(&run).await?;
        Ok(run)
    }
}

/// Provenance triple for a run against a resolved registry entry.
pub fn provenance_for(
    resolved: &Option<(AlgoVersionRecord, AlgoParamsRecord)>,
    run_id: Uuid,
) -> Provenance {
    Provenance {
        algo_version_id: resolved.as_ref().map(|(v, _)| v.id),
        params_id: resolved.as_ref().map(|(_, p)| p.id),
        run_id: Some(run_id),
    }
}

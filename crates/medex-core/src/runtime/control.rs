use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::{Actor, EngineError, Result, RuntimeSnapshot};
use crate::ports::{AuditEvent, AuditSink, RuntimeRepository};
use crate::runtime::approvals::{self, ActionType};
use crate::runtime::{
    AlgoModule, ModuleVersion, RuntimeConfigData, RuntimeProfile, SwitchEvent, POLICY_VERSION,
};

/// Maximum age of a cached config read. Every state-write path re-checks the
/// live row inside its transaction regardless.
pub const CONFIG_CACHE_TTL_SECONDS: i64 = 10;

#[derive(Debug, Clone)]
struct CachedConfig {
    config: RuntimeConfigData,
    fetched_at: DateTime<Utc>,
}

/// A validated profile-switch request.
#[derive(Debug, Clone)]
pub struct ProfileSwitch {
    pub target: RuntimeProfile,
    pub overrides: BTreeMap<String, String>,
    pub reason: String,
    pub confirmation_phrase: Option<String>,
}

/// Injected control-plane service over the singleton runtime config.
///
/// Reads go through a bounded-TTL cache; all mutations invalidate it and
/// append a switch event.
pub struct RuntimeControl {
    repo: Arc<dyn RuntimeRepository>,
    audit: Arc<dyn AuditSink>,
    production: bool,
    exam_mode: bool,
    cache: Mutex<Option<CachedConfig>>,
}

impl RuntimeControl {
    pub fn new(
        repo: Arc<dyn RuntimeRepository>,
        audit: Arc<dyn AuditSink>,
        production: bool,
        exam_mode: bool,
    ) -> Self {
        Self {
            repo,
            audit,
            production,
            exam_mode,
            cache: Mutex::new(None),
        }
    }

    pub fn is_production(&self) -> bool {
        self.production
    }

    pub fn repo(&self) -> Arc<dyn RuntimeRepository> {
        Arc::clone(&self.repo)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current config, served from the cache when fresh.
    pub async fn config(&self) -> Result<RuntimeConfigData> {
        let now = Utc::now();
        if let Ok(guard) = self.cache.lock() {
            if let Some(cached) = guard.as_ref() {
                let fresh =
                    now - cached.fetched_at < Duration::seconds(CONFIG_CACHE_TTL_SECONDS);
                if fresh && cached.config.safe_mode.prefer_cache {
                    return Ok(cached.config.clone());
                }
            }
        }
        self.config_live().await
    }

    /// Current config read from the store, creating the default singleton
    /// when missing. Refreshes the cache.
    pub async fn config_live(&self) -> Result<RuntimeConfigData> {
        let now = Utc::now();
        let config = match self
            .repo
            .get_config()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
        {
            Some(config) => config,
            None => {
                tracing::warn!("no runtime config found, creating default");
                let config = RuntimeConfigData::default_at(now);
                self.repo
                    .save_config(&config)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
                config
            }
        };

        if let Ok(mut guard) = self.cache.lock() {
            *guard = Some(CachedConfig {
                config: config.clone(),
                fetched_at: now,
            });
        }
        Ok(config)
    }

    fn invalidate_cache(&self) {
        if let Ok(mut guard) = self.cache.lock() {
            *guard = None;
        }
    }

    /// Effective version for a module under the current config.
    pub async fn effective_version(&self, module: AlgoModule) -> Result<ModuleVersion> {
        Ok(self.config().await?.effective_version(module))
    }

    /// Whether safe-mode freeze is on (cached read).
    pub async fn is_frozen(&self) -> Result<bool> {
        Ok(self.config().await?.safe_mode.freeze_updates)
    }

    /// Whether safe-mode freeze is on, read from the live row. Write paths
    /// must use this inside their transaction.
    pub async fn is_frozen_live(&self) -> Result<bool> {
        Ok(self.config_live().await?.safe_mode.freeze_updates)
    }

    /// Point-in-time snapshot persisted on a session at creation.
    pub async fn open_session_snapshot(&self) -> Result<RuntimeSnapshot> {
        let config = self.config_live().await?;
        Ok(RuntimeSnapshot {
            profile: config.active_profile.as_str().to_string(),
            overrides: config.overrides.clone(),
            policy_version: POLICY_VERSION.to_string(),
            exam_mode: self.exam_mode,
            freeze_updates: config.safe_mode.freeze_updates,
        })
    }

    /// Effective version for a module under a session snapshot. Session
    /// decisions must use this, not the live config.
    pub fn snapshot_version(snapshot: &RuntimeSnapshot, module: AlgoModule) -> ModuleVersion {
        if let Some(raw) = snapshot.overrides.get(module.as_str()) {
            if let Some(version) = ModuleVersion::parse(raw) {
                return version;
            }
        }
        RuntimeProfile::parse(&snapshot.profile)
            .unwrap_or(RuntimeProfile::V1Primary)
            .default_version()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Switch the active profile and/or replace module overrides.
    ///
    /// Validation order: admin role, non-empty reason, confirmation phrase,
    /// override names/versions, approval gate (in production, for profile
    /// changes). Profile changes in production never execute directly; they
    /// are routed through the approval workflow.
    pub async fn switch_profile(
        &self,
        request: ProfileSwitch,
        actor: Actor,
    ) -> Result<RuntimeConfigData> {
        actor.require_admin()?;
        let reason = require_reason(&request.reason)?;

        let current = self.config_live().await?;
        let has_profile_change = current.active_profile != request.target;

        let expected_phrase = if has_profile_change {
            format!("SWITCH TO {}", request.target.as_str())
        } else {
            "APPLY OVERRIDES".to_string()
        };
        check_confirmation(&expected_phrase, request.confirmation_phrase.as_deref())?;

        validate_overrides(&request.overrides)?;

        if has_profile_change && self.production {
            let action = match request.target {
                RuntimeProfile::V1Primary => ActionType::ProfileSwitchPrimary,
                RuntimeProfile::V0Fallback => ActionType::ProfileSwitchFallback,
            };
            approvals::ensure_direct_action_allowed(self.repo.as_ref(), action).await?;
        }

        self.apply_profile_switch(request.target, request.overrides, &reason, actor)
            .await
    }

    /// Execute a validated profile switch. Called directly by
    /// `switch_profile` and by the approval workflow after a second admin
    /// approves.
    pub(crate) async fn apply_profile_switch(
        &self,
        target: RuntimeProfile,
        overrides: BTreeMap<String, String>,
        reason: &str,
        actor: Actor,
    ) -> Result<RuntimeConfigData> {
        let now = Utc::now();
        let previous = self.config_live().await?;

        let mut next = previous.clone();
        next.active_profile = target;
        next.overrides = overrides;
        next.active_since = now;
        next.changed_by = Some(actor.user_id);
        next.reason = Some(reason.to_string());

        self.repo
            .save_config(&next)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let event = SwitchEvent {
            id: Uuid::new_v4(),
            previous_config: to_json(&previous),
            new_config: to_json(&next),
            reason: reason.to_string(),
            created_by: actor.user_id,
            created_at: now,
        };
        self.repo
            .append_switch_event(&event)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        self.invalidate_cache();

        self.audit.emit(AuditEvent {
            action: "ALGO_MODE_SWITCH".to_string(),
            actor: actor.user_id,
            role: actor.role,
            before: event.previous_config.clone(),
            after: event.new_config.clone(),
            reason: reason.to_string(),
            request_id: event.id,
        });

        tracing::info!(
            previous = previous.active_profile.as_str(),
            new = target.as_str(),
            reason,
            "algorithm profile switched"
        );

        Ok(next)
    }

    /// Toggle safe-mode freeze.
    pub async fn set_freeze(
        &self,
        freeze: bool,
        reason: &str,
        confirmation_phrase: Option<&str>,
        actor: Actor,
    ) -> Result<RuntimeConfigData> {
        actor.require_admin()?;
        let reason = require_reason(reason)?;

        let expected = if freeze {
            "FREEZE UPDATES"
        } else {
            "UNFREEZE UPDATES"
        };
        check_confirmation(expected, confirmation_phrase)?;

        let now = Utc::now();
        let previous = self.config_live().await?;
        if previous.safe_mode.freeze_updates == freeze {
            // No-op toggles still validate but change nothing.
            return Ok(previous);
        }

        let mut next = previous.clone();
        next.safe_mode.freeze_updates = freeze;
        next.changed_by = Some(actor.user_id);
        next.reason = Some(reason.clone());

        self.repo
            .save_config(&next)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let event = SwitchEvent {
            id: Uuid::new_v4(),
            previous_config: to_json(&previous),
            new_config: to_json(&next),
            reason: reason.clone(),
            created_by: actor.user_id,
            created_at: now,
        };
        self.repo
            .append_switch_event(&event)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        self.invalidate_cache();

        self.audit.emit(AuditEvent {
            action: if freeze {
                "ALGO_FREEZE_UPDATES".to_string()
            } else {
                "ALGO_UNFREEZE_UPDATES".to_string()
            },
            actor: actor.user_id,
            role: actor.role,
            before: event.previous_config.clone(),
            after: event.new_config.clone(),
            reason,
            request_id: event.id,
        });

        Ok(next)
    }
}

fn require_reason(reason: &str) -> Result<String> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(
            "reason is required for critical actions".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn check_confirmation(expected: &str, provided: Option<&str>) -> Result<()> {
    match provided {
        Some(phrase) if phrase == expected => Ok(()),
        _ => Err(EngineError::InvalidConfirmation(format!(
            "expected exact phrase: {expected}"
        ))),
    }
}

fn validate_overrides(overrides: &BTreeMap<String, String>) -> Result<()> {
    for (module, version) in overrides {
        if AlgoModule::parse(module).is_none() {
            return Err(EngineError::Validation(format!(
                "invalid module in overrides: {module}"
            )));
        }
        if ModuleVersion::parse(version).is_none() {
            return Err(EngineError::Validation(format!(
                "invalid version for {module}: {version}, must be v0, v1 or shadow"
            )));
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MockRuntimeRepository, RecordingAuditSink};
    use crate::runtime::{ApprovalRecord, ApprovalStatus};

    fn control_with(
        repo: MockRuntimeRepository,
        production: bool,
    ) -> (Arc<RuntimeControl>, Arc<RecordingAuditSink>) {
        let audit = Arc::new(RecordingAuditSink::new());
        let control = Arc::new(RuntimeControl::new(
            Arc::new(repo),
            audit.clone(),
            production,
            false,
        ));
        (control, audit)
    }

    fn admin() -> Actor {
        Actor::admin(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_missing_config_creates_default() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config().returning(|| Ok(None));
        repo.expect_save_config().returning(|_| Ok(()));

        let (control, _) = control_with(repo, false);
        let config = control.config().await.unwrap();
        assert_eq!(config.active_profile, RuntimeProfile::V1Primary);
        assert!(!config.safe_mode.freeze_updates);
        assert!(config.overrides.is_empty());
    }

    #[tokio::test]
    async fn test_config_cached_within_ttl() {
        let mut repo = MockRuntimeRepository::new();
        // Only one live fetch expected; the second read hits the cache.
        repo.expect_get_config()
            .times(1)
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));

        let (control, _) = control_with(repo, false);
        control.config().await.unwrap();
        control.config().await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_requires_reason() {
        let repo = MockRuntimeRepository::new();
        let (control, _) = control_with(repo, false);

        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "   ".to_string(),
                    confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
                },
                admin(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_switch_rejects_wrong_phrase() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));

        let (control, _) = control_with(repo, false);
        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "incident 42".to_string(),
                    confirmation_phrase: Some("".to_string()),
                },
                admin(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIRMATION");
    }

    #[tokio::test]
    async fn test_switch_rejects_student() {
        let repo = MockRuntimeRepository::new();
        let (control, _) = control_with(repo, false);
        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "r".to_string(),
                    confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
                },
                Actor::student(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
    }

    #[tokio::test]
    async fn test_switch_outside_production_succeeds_and_logs_event() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));
        repo.expect_save_config().times(1).returning(|_| Ok(()));
        repo.expect_append_switch_event()
            .times(1)
            .returning(|_| Ok(()));

        let (control, audit) = control_with(repo, false);
        let config = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "latency regression in v1".to_string(),
                    confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
                },
                admin(),
            )
            .await
            .unwrap();

        assert_eq!(config.active_profile, RuntimeProfile::V0Fallback);
        assert_eq!(audit.count_action("ALGO_MODE_SWITCH"), 1);
    }

    #[tokio::test]
    async fn test_empty_phrase_rejected_before_approval_gate() {
        // Even in production, a bad phrase reports INVALID_CONFIRMATION,
        // not APPROVAL_REQUIRED.
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));

        let (control, _) = control_with(repo, true);
        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "incident".to_string(),
                    confirmation_phrase: Some(String::new()),
                },
                admin(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIRMATION");
    }

    #[tokio::test]
    async fn test_switch_in_production_requires_approval() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));
        repo.expect_find_blocking_approval().returning(|_| Ok(None));

        let (control, _) = control_with(repo, true);
        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "incident".to_string(),
                    confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
                },
                admin(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "APPROVAL_REQUIRED");
    }

    #[tokio::test]
    async fn test_direct_switch_blocked_even_with_approved_request() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));
        repo.expect_find_blocking_approval().returning(|_| {
            let mut approval = ApprovalRecord::new(
                ActionType::ProfileSwitchFallback,
                serde_json::json!({}),
                "r".to_string(),
                Uuid::new_v4(),
                Utc::now(),
            );
            approval.status = ApprovalStatus::Approved;
            Ok(Some(approval))
        });

        let (control, _) = control_with(repo, true);
        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V0Fallback,
                    overrides: BTreeMap::new(),
                    reason: "incident".to_string(),
                    confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
                },
                admin(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "APPROVAL_REQUIRED");
    }

    #[tokio::test]
    async fn test_override_only_switch_uses_apply_overrides_phrase() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));
        repo.expect_save_config().returning(|_| Ok(()));
        repo.expect_append_switch_event().returning(|_| Ok(()));

        let (control, _) = control_with(repo, true);
        let mut overrides = BTreeMap::new();
        overrides.insert("mastery".to_string(), "v0".to_string());

        // Same profile, so no approval gate even in production.
        let config = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V1Primary,
                    overrides,
                    reason: "pin mastery to v0".to_string(),
                    confirmation_phrase: Some("APPLY OVERRIDES".to_string()),
                },
                admin(),
            )
            .await
            .unwrap();
        assert_eq!(config.overrides.get("mastery").map(String::as_str), Some("v0"));
    }

    #[tokio::test]
    async fn test_switch_rejects_unknown_module_override() {
        let mut repo = MockRuntimeRepository::new();
        repo.expect_get_config()
            .returning(|| Ok(Some(RuntimeConfigData::default_at(Utc::now()))));

        let (control, _) = control_with(repo, false);
        let mut overrides = BTreeMap::new();
        overrides.insert("telepathy".to_string(), "v1".to_string());

        let err = control
            .switch_profile(
                ProfileSwitch {
                    target: RuntimeProfile::V1Primary,
                    overrides,
                    reason: "r".to_string(),
                    confirmation_phrase: Some("APPLY OVERRIDES".to_string()),
                },
                admin(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_freeze_and_unfreeze() {
        let config = Arc::new(Mutex::new(RuntimeConfigData::default_at(Utc::now())));

        let mut repo = MockRuntimeRepository::new();
        let read = Arc::clone(&config);
        repo.expect_get_config()
            .returning(move || Ok(Some(read.lock().unwrap().clone())));
        let write = Arc::clone(&config);
        repo.expect_save_config().returning(move |c| {
            *write.lock().unwrap() = c.clone();
            Ok(())
        });
        repo.expect_append_switch_event().returning(|_| Ok(()));

        let (control, audit) = control_with(repo, false);

        let frozen = control
            .set_freeze(true, "drill", Some("FREEZE UPDATES"), admin())
            .await
            .unwrap();
        assert!(frozen.safe_mode.freeze_updates);
        assert!(control.is_frozen_live().await.unwrap());

        let thawed = control
            .set_freeze(false, "drill over", Some("UNFREEZE UPDATES"), admin())
            .await
            .unwrap();
        assert!(!thawed.safe_mode.freeze_updates);
        assert_eq!(audit.count_action("ALGO_FREEZE_UPDATES"), 1);
        assert_eq!(audit.count_action("ALGO_UNFREEZE_UPDATES"), 1);
    }

    #[test]
    fn test_snapshot_version_resolution() {
        let mut overrides = BTreeMap::new();
        overrides.insert("difficulty".to_string(), "shadow".to_string());
        let snapshot = RuntimeSnapshot {
            profile: "V0_FALLBACK".to_string(),
            overrides,
            policy_version: POLICY_VERSION.to_string(),
            exam_mode: false,
            freeze_updates: false,
        };

        assert_eq!(
            RuntimeControl::snapshot_version(&snapshot, AlgoModule::Difficulty),
            ModuleVersion::Shadow
        );
        assert_eq!(
            RuntimeControl::snapshot_version(&snapshot, AlgoModule::Mastery),
            ModuleVersion::V0
        );
    }
}

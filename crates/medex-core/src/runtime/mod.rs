/// Runtime control plane.
///
/// Single source of truth for "which algorithm version runs this decision,
/// right now, for this session": profile + per-module overrides + safe-mode
/// freeze, switch events, two-person approvals, and the per-session
/// snapshot.
pub mod approvals;
pub mod control;

pub use approvals::{ActionType, ApprovalRecord, ApprovalService, ApprovalStatus};
pub use control::{ProfileSwitch, RuntimeControl, CONFIG_CACHE_TTL_SECONDS};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Policy version stamped on session snapshots.
pub const POLICY_VERSION: &str = "ENGINE_POLICY_v1";

// ============================================================================
// MODULES
// ============================================================================

/// Algorithmic modules routed by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoModule {
    Mastery,
    Revision,
    Difficulty,
    Adaptive,
}

impl AlgoModule {
    pub fn all() -> &'static [AlgoModule] {
        &[
            AlgoModule::Mastery,
            AlgoModule::Revision,
            AlgoModule::Difficulty,
            AlgoModule::Adaptive,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgoModule::Mastery => "mastery",
            AlgoModule::Revision => "revision",
            AlgoModule::Difficulty => "difficulty",
            AlgoModule::Adaptive => "adaptive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mastery" => Some(AlgoModule::Mastery),
            "revision" => Some(AlgoModule::Revision),
            "difficulty" => Some(AlgoModule::Difficulty),
            "adaptive" => Some(AlgoModule::Adaptive),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlgoModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved version for a module decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleVersion {
    V0,
    V1,
    /// Compute but never affect learner-visible outputs.
    Shadow,
}

impl ModuleVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleVersion::V0 => "v0",
            ModuleVersion::V1 => "v1",
            ModuleVersion::Shadow => "shadow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v0" => Some(ModuleVersion::V0),
            "v1" => Some(ModuleVersion::V1),
            "shadow" => Some(ModuleVersion::Shadow),
            _ => None,
        }
    }
}

// ============================================================================
// PROFILE & CONFIG
// ============================================================================

/// Active runtime profile. `V0_FALLBACK` is the kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeProfile {
    #[serde(rename = "V1_PRIMARY")]
    V1Primary,
    #[serde(rename = "V0_FALLBACK")]
    V0Fallback,
}

impl RuntimeProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeProfile::V1Primary => "V1_PRIMARY",
            RuntimeProfile::V0Fallback => "V0_FALLBACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "V1_PRIMARY" => Some(RuntimeProfile::V1Primary),
            "V0_FALLBACK" => Some(RuntimeProfile::V0Fallback),
            _ => None,
        }
    }

    /// Module version implied by the profile when no override applies.
    pub fn default_version(&self) -> ModuleVersion {
        match self {
            RuntimeProfile::V1Primary => ModuleVersion::V1,
            RuntimeProfile::V0Fallback => ModuleVersion::V0,
        }
    }
}

impl std::fmt::Display for RuntimeProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Safe-mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeMode {
    /// When true, every state-mutating path short-circuits without writing.
    pub freeze_updates: bool,
    /// Prefer cached config reads within the TTL.
    pub prefer_cache: bool,
}

impl Default for SafeMode {
    fn default() -> Self {
        Self {
            freeze_updates: false,
            prefer_cache: true,
        }
    }
}

/// The singleton runtime configuration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfigData {
    pub active_profile: RuntimeProfile,
    pub active_since: DateTime<Utc>,
    /// module name -> "v0" | "v1" | "shadow"
    pub overrides: BTreeMap<String, String>,
    pub safe_mode: SafeMode,
    pub changed_by: Option<Uuid>,
    pub reason: Option<String>,
}

impl RuntimeConfigData {
    pub fn default_at(now: DateTime<Utc>) -> Self {
        Self {
            active_profile: RuntimeProfile::V1Primary,
            active_since: now,
            overrides: BTreeMap::new(),
            safe_mode: SafeMode::default(),
            changed_by: None,
            reason: None,
        }
    }

    /// Resolve the effective version for a module: a valid override wins,
    /// otherwise the profile default. Invalid stored overrides fall back to
    /// the profile default.
    pub fn effective_version(&self, module: AlgoModule) -> ModuleVersion {
        if let Some(raw) = self.overrides.get(module.as_str()) {
            match ModuleVersion::parse(raw) {
                Some(version) => return version,
                None => {
                    tracing::warn!(
                        module = module.as_str(),
                        override_value = raw.as_str(),
                        "invalid module override, using profile default"
                    );
                }
            }
        }
        self.active_profile.default_version()
    }
}

/// Append-only record of a runtime config change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchEvent {
    pub id: Uuid,
    pub previous_config: Value,
    pub new_config: Value,
    pub reason: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_roundtrip() {
        for profile in [RuntimeProfile::V1Primary, RuntimeProfile::V0Fallback] {
            assert_eq!(RuntimeProfile::parse(profile.as_str()), Some(profile));
        }
        assert_eq!(RuntimeProfile::parse("V2_TURBO"), None);
    }

    #[test]
    fn test_profile_default_version() {
        assert_eq!(
            RuntimeProfile::V1Primary.default_version(),
            ModuleVersion::V1
        );
        assert_eq!(
            RuntimeProfile::V0Fallback.default_version(),
            ModuleVersion::V0
        );
    }

    #[test]
    fn test_override_wins_over_profile() {
        let mut config = RuntimeConfigData::default_at(Utc::now());
        assert_eq!(
            config.effective_version(AlgoModule::Mastery),
            ModuleVersion::V1
        );

        config
            .overrides
            .insert("mastery".to_string(), "v0".to_string());
        assert_eq!(
            config.effective_version(AlgoModule::Mastery),
            ModuleVersion::V0
        );
        // Other modules keep the profile default
        assert_eq!(
            config.effective_version(AlgoModule::Revision),
            ModuleVersion::V1
        );
    }

    #[test]
    fn test_invalid_override_falls_back_to_profile() {
        let mut config = RuntimeConfigData::default_at(Utc::now());
        config
            .overrides
            .insert("adaptive".to_string(), "v9".to_string());
        assert_eq!(
            config.effective_version(AlgoModule::Adaptive),
            ModuleVersion::V1
        );
    }

    #[test]
    fn test_shadow_override() {
        let mut config = RuntimeConfigData::default_at(Utc::now());
        config
            .overrides
            .insert("difficulty".to_string(), "shadow".to_string());
        assert_eq!(
            config.effective_version(AlgoModule::Difficulty),
            ModuleVersion::Shadow
        );
    }
}

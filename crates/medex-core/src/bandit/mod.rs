/// Thompson-sampling bandit over themes.
///
/// Each (learner, theme) arm keeps a Beta posterior over "a session on this
/// theme produces learning". Selection samples the posteriors; the reward —
/// the normalized mastery gain of the session — is applied only at submit.
use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::BanditThemeState;

const REWARD_EPS: f64 = 1e-6;

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditParams {
    pub prior_alpha: f64,
    pub prior_beta: f64,
    /// Themes with fewer attempts in the session get no reward update.
    pub reward_min_attempts: i64,
}

impl Default for BanditParams {
    fn default() -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            reward_min_attempts: 3,
        }
    }
}

impl BanditParams {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

// ============================================================================
// ARM STATE
// ============================================================================

/// Fresh arm with the uninformed prior.
pub fn new_arm(user_id: Uuid, theme_id: i64, params: &BanditParams) -> BanditThemeState {
    BanditThemeState {
        user_id,
        theme_id,
        alpha: params.prior_alpha,
        beta: params.prior_beta,
        n_sessions: 0,
        last_selected_at: None,
        last_reward: None,
    }
}

/// Sample from the arm's Beta posterior.
pub fn sample_arm<R: Rng>(state: &BanditThemeState, rng: &mut R) -> f64 {
    let beta = Beta::new(state.alpha.max(REWARD_EPS), state.beta.max(REWARD_EPS))
        .expect("Beta distribution parameters must be positive");
    beta.sample(rng)
}

/// Mark an arm selected for a session (posterior untouched).
pub fn mark_selected(state: &mut BanditThemeState, now: DateTime<Utc>) {
    state.last_selected_at = Some(now);
    state.n_sessions += 1;
}

/// Normalized mastery-gain reward:
/// `r = clamp(max(0, (post − pre) / (1 − pre + ε)), 0, 1)`.
pub fn compute_mastery_delta_reward(pre_mastery: f64, post_mastery: f64) -> f64 {
    let gain = (post_mastery - pre_mastery) / (1.0 - pre_mastery + REWARD_EPS);
    gain.max(0.0).clamp(0.0, 1.0)
}

/// Apply a reward to the Beta posterior: `α += r`, `β += 1 − r`.
pub fn apply_reward(state: &mut BanditThemeState, reward: f64, now: DateTime<Utc>) {
    let reward = reward.clamp(0.0, 1.0);
    state.alpha += reward;
    state.beta += 1.0 - reward;
    state.last_reward = Some(reward);
    if state.last_selected_at.is_none() {
        state.last_selected_at = Some(now);
    }
}

// ============================================================================
// TESTS
// ============================================================================

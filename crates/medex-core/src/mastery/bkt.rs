/// Mastery v1: Bayesian Knowledge Tracing.
///
/// Standard two-state BKT with parameters (L0, T, S, G) fitted offline per
/// concept. Fitting itself is out of scope; this module validates fitted
/// parameters against the identifiability constraints and applies the
/// per-attempt posterior update.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{EngineError, Result};

/// Probability clamp to keep posteriors away from the degenerate endpoints.
const EPS: f64 = 1e-6;

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BktParams {
    /// Initial probability the concept is already learned.
    pub l0: f64,
    /// Probability of learning on each opportunity.
    pub t: f64,
    /// Slip: wrong answer despite knowing.
    pub s: f64,
    /// Guess: correct answer without knowing.
    pub g: f64,
}

impl Default for BktParams {
    fn default() -> Self {
        Self {
            l0: 0.20,
            t: 0.15,
            s: 0.10,
            g: 0.20,
        }
    }
}

impl BktParams {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Validate the fitted-parameter constraints:
    /// `0 < L0 < 0.5`, `0 < T < 0.5`, `0 < S < 0.4`, `0 < G < 0.4`,
    /// `S + G < 1`, `(1 - S) > G` (non-degeneracy).
    pub fn validate(&self) -> Result<()> {
        if !(self.l0 > 0.0 && self.l0 < 0.5) {
            return Err(EngineError::Integrity(format!(
                "BKT L0 out of range: {}",
                self.l0
            )));
        }
        if !(self.t > 0.0 && self.t < 0.5) {
            return Err(EngineError::Integrity(format!(
                "BKT T out of range: {}",
                self.t
            )));
        }
        if !(self.s > 0.0 && self.s < 0.4) {
            return Err(EngineError::Integrity(format!(
                "BKT slip out of range: {}",
                self.s
            )));
        }
        if !(self.g > 0.0 && self.g < 0.4) {
            return Err(EngineError::Integrity(format!(
                "BKT guess out of range: {}",
                self.g
            )));
        }
        if self.s + self.g >= 1.0 {
            return Err(EngineError::Integrity(format!(
                "BKT slip + guess must be < 1: {} + {}",
                self.s, self.g
            )));
        }
        if (1.0 - self.s) <= self.g {
            return Err(EngineError::Integrity(format!(
                "BKT degenerate: (1 - slip) must exceed guess, got {} <= {}",
                1.0 - self.s,
                self.g
            )));
        }
        Ok(())
    }
}

// ============================================================================
// UPDATE MATH
// ============================================================================

pub fn clamp_probability(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

/// P(correct | current mastery) = L·(1−S) + (1−L)·G
pub fn predict_correct(p_l: f64, params: &BktParams) -> f64 {
    let p_l = clamp_probability(p_l);
    p_l * (1.0 - params.s) + (1.0 - p_l) * params.g
}

/// Posterior P(learned | correct observation).
pub fn posterior_given_correct(p_l: f64, params: &BktParams) -> f64 {
    let p_l = clamp_probability(p_l);
    let numerator = p_l * (1.0 - params.s);
    let denominator = numerator + (1.0 - p_l) * params.g;
    clamp_probability(numerator / denominator.max(EPS))
}

/// Posterior P(learned | wrong observation).
pub fn posterior_given_wrong(p_l: f64, params: &BktParams) -> f64 {
    let p_l = clamp_probability(p_l);
    let numerator = p_l * params.s;
    let denominator = numerator + (1.0 - p_l) * (1.0 - params.g);
    clamp_probability(numerator / denominator.max(EPS))
}

/// Apply the learning transition after the observation posterior.
pub fn apply_learning_transition(p_l_given_obs: f64, params: &BktParams) -> f64 {
    clamp_probability(p_l_given_obs + (1.0 - p_l_given_obs) * params.t)
}

/// One full BKT step: observation posterior, then learning transition.
pub fn update_mastery(p_l: f64, correct: bool, params: &BktParams) -> f64 {
    let posterior = if correct {
        posterior_given_correct(p_l, params)
    } else {
        posterior_given_wrong(p_l, params)
    };
    apply_learning_transition(posterior, params)
}

// ============================================================================
// STATE BLOB
// ============================================================================

/// Persisted BKT posterior, stored as the mastery record's opaque blob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BktState {
    pub p_l: f64,
    pub n_observations: i64,
}

impl BktState {
    pub fn initial(params: &BktParams) -> Self {
        Self {
            p_l: params.l0,
            n_observations: 0,
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn observe(&self, correct: bool, params: &BktParams) -> Self {
        Self {
            p_l: update_mastery(self.p_l, correct, params),
            n_observations: self.n_observations + 1,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

/// Online Elo-style difficulty calibration.
///
/// Learner ability and item difficulty move toward each other after every
/// attempt: `p = g + (1-g)·σ((θ-b)/s)`, `δ = outcome − p`, `θ += k_u·δ`,
/// `b -= k_q·δ`. Step sizes scale with the mover's own uncertainty, which
/// decays with evidence and grows with staleness. A periodic recenter keeps
/// item ratings around zero without moving any `θ − b` gap.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{EloRating, EloScope, EngineError, Result};

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EloParams {
    /// MCQ guess floor (five options, but distractor quality varies).
    pub guess_floor: f64,
    /// Logistic scale.
    pub scale: f64,
    pub k_user: f64,
    pub k_item: f64,
    pub unc_init_user: f64,
    pub unc_init_item: f64,
    pub unc_floor: f64,
    /// Multiplicative uncertainty decay per attempt.
    pub unc_decay: f64,
    /// Linear uncertainty growth per idle day beyond the grace window.
    pub unc_staleness_per_day: f64,
    pub staleness_grace_days: i64,
    /// Recenter runs when |mean(item ratings)| exceeds this.
    pub recenter_threshold: f64,
}

impl Default for EloParams {
    fn default() -> Self {
        Self {
            guess_floor: 0.20,
            scale: 400.0,
            k_user: 32.0,
            k_item: 16.0,
            unc_init_user: 350.0,
            unc_init_item: 300.0,
            unc_floor: 50.0,
            unc_decay: 0.97,
            unc_staleness_per_day: 1.0,
            staleness_grace_days: 30,
            recenter_threshold: 25.0,
        }
    }
}

impl EloParams {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn unc_init(&self, scope: EloScope) -> f64 {
        match scope {
            EloScope::User => self.unc_init_user,
            EloScope::Item => self.unc_init_item,
        }
    }
}

// ============================================================================
// CORE MATH
// ============================================================================

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `p = g + (1 - g)·σ((θ - b)/s)`, always in `[g, 1]` and strictly
/// increasing in `θ - b`.
pub fn p_correct(theta: f64, b: f64, params: &EloParams) -> f64 {
    params.guess_floor + (1.0 - params.guess_floor) * sigmoid((theta - b) / params.scale)
}

pub fn compute_delta(correct: bool, p: f64) -> f64 {
    let outcome = if correct { 1.0 } else { 0.0 };
    outcome - p
}

/// Normalized uncertainty in `[0, 1]` relative to the scope's floor/init.
pub fn normalize_uncertainty(uncertainty: f64, init: f64, floor: f64) -> f64 {
    if init <= floor {
        return 0.0;
    }
    ((uncertainty - floor) / (init - floor)).clamp(0.0, 1.0)
}

/// Step size scaled by the mover's own normalized uncertainty:
/// `k = base_k · (0.5 + unc_norm)`, so fresh ratings move up to 3x faster
/// than settled ones.
pub fn dynamic_k(base_k: f64, uncertainty: f64, init: f64, floor: f64) -> f64 {
    base_k * (0.5 + normalize_uncertainty(uncertainty, init, floor))
}

/// Grow uncertainty with staleness, then decay it for the new evidence.
/// The result always lands in `[floor, init]`.
pub fn update_uncertainty(
    uncertainty: f64,
    scope: EloScope,
    last_seen_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    params: &EloParams,
) -> f64 {
    let init = params.unc_init(scope);

    let stale_days = last_seen_at
        .map(|seen| ((now - seen).num_days() - params.staleness_grace_days).max(0))
        .unwrap_or(0);
    let grown = (uncertainty + stale_days as f64 * params.unc_staleness_per_day).min(init);

    (grown * params.unc_decay).clamp(params.unc_floor, init)
}

pub fn validate_rating_finite(value: f64, context: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(EngineError::Integrity(format!(
            "non-finite rating detected in {context}: {value}"
        )));
    }
    Ok(())
}

// ============================================================================
// RATING CONSTRUCTION & UPDATE
// ============================================================================

pub fn default_user_rating(user_id: Uuid, params: &EloParams) -> EloRating {
    EloRating {
        scope: EloScope::User,
        user_id: Some(user_id),
        item_id: None,
        rating: 0.0,
        uncertainty: params.unc_init_user,
        n_attempts: 0,
        last_seen_at: None,
    }
}

pub fn default_item_rating(item_id: Uuid, params: &EloParams) -> EloRating {
    EloRating {
        scope: EloScope::Item,
        user_id: None,
        item_id: Some(item_id),
        rating: 0.0,
        uncertainty: params.unc_init_item,
        n_attempts: 0,
        last_seen_at: None,
    }
}

/// Outcome detail for the update log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EloUpdateOutcome {
    pub p_before: f64,
    pub delta: f64,
    pub k_user: f64,
    pub k_item: f64,
}

/// Apply one attempt to the (learner, item) rating pair.
///
/// Both ratings move in opposite directions by their own dynamic step; both
/// uncertainties decay; all outputs are checked finite before they are
/// returned for persistence.
pub fn apply_update(
    user: &EloRating,
    item: &EloRating,
    correct: bool,
    now: DateTime<Utc>,
    params: &EloParams,
) -> Result<(EloRating, EloRating, EloUpdateOutcome)> {
    let p = p_correct(user.rating, item.rating, params);
    let delta = compute_delta(correct, p);

    let k_u = dynamic_k(
        params.k_user,
        user.uncertainty,
        params.unc_init_user,
        params.unc_floor,
    );
    let k_q = dynamic_k(
        params.k_item,
        item.uncertainty,
        params.unc_init_item,
        params.unc_floor,
    );

    let new_theta = user.rating + k_u * delta;
    let new_b = item.rating - k_q * delta;
    validate_rating_finite(new_theta, "user update")?;
    validate_rating_finite(new_b, "item update")?;

    let mut new_user = user.clone();
    new_user.rating = new_theta;
    new_user.uncertainty =
        update_uncertainty(user.uncertainty, EloScope::User, user.last_seen_at, now, params);
    new_user.n_attempts += 1;
    new_user.last_seen_at = Some(now);

    let mut new_item = item.clone();
    new_item.rating = new_b;
    new_item.uncertainty =
        update_uncertainty(item.uncertainty, EloScope::Item, item.last_seen_at, now, params);
    new_item.n_attempts += 1;
    new_item.last_seen_at = Some(now);

    Ok((
        new_user,
        new_item,
        EloUpdateOutcome {
            p_before: p,
            delta,
            k_user: k_u,
            k_item: k_q,
        },
    ))
}

// ============================================================================
// RECENTER
// ============================================================================

/// Shift every item rating so their mean lands on zero, and every learner
/// rating by the same constant. Preserves each `θ − b` exactly.
///
/// Returns the applied shift (the previous item mean), or None when the
/// mean is already within the threshold.
pub fn recenter(
    items: &mut [EloRating],
    users: &mut [EloRating],
    params: &EloParams,
) -> Result<Option<f64>> {
    if items.is_empty() {
        return Ok(None);
    }

    let mean: f64 = items.iter().map(|r| r.rating).sum::<f64>() / items.len() as f64;
    validate_rating_finite(mean, "recenter mean")?;
    if mean.abs() <= params.recenter_threshold {
        return Ok(None);
    }

    for item in items.iter_mut() {
        item.rating -= mean;
        validate_rating_finite(item.rating, "recentered item")?;
    }
    for user in users.iter_mut() {
        user.rating -= mean;
        validate_rating_finite(user.rating, "recentered user")?;
    }
    Ok(Some(mean))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> EloParams {
        EloParams::default()
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_p_correct_equal_ratings() {
        let p = p_correct(0.0, 0.0, &params());
        // g + (1-g) * 0.5 = 0.2 + 0.4
        assert!((p - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_p_correct_strictly_increasing_in_gap() {
        let p = params();
        let low = p_correct(-200.0, 0.0, &p);
        let mid = p_correct(0.0, 0.0, &p);
        let high = p_correct(200.0, 0.0, &p);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn test_delta_sign() {
        assert!(compute_delta(true, 0.6) > 0.0);
        assert!(compute_delta(false, 0.6) < 0.0);
    }

    #[test]
    fn test_dynamic_k_grows_with_uncertainty() {
        let p = params();
        let settled = dynamic_k(p.k_user, p.unc_floor, p.unc_init_user, p.unc_floor);
        let fresh = dynamic_k(p.k_user, p.unc_init_user, p.unc_init_user, p.unc_floor);
        assert!(fresh > settled);
        assert!((settled - p.k_user * 0.5).abs() < 1e-9);
        assert!((fresh - p.k_user * 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_uncertainty_decays_toward_floor() {
        let p = params();
        let now = Utc::now();
        let mut unc = p.unc_init_user;
        for _ in 0..500 {
            unc = update_uncertainty(unc, EloScope::User, Some(now), now, &p);
        }
        assert!((unc - p.unc_floor).abs() < 1e-6);
    }

    #[test]
    fn test_uncertainty_grows_with_staleness() {
        let p = params();
        let now = Utc::now();
        let long_ago = now - chrono::Duration::days(120);
        let fresh = update_uncertainty(100.0, EloScope::User, Some(now), now, &p);
        let stale = update_uncertainty(100.0, EloScope::User, Some(long_ago), now, &p);
        assert!(stale > fresh);
        assert!(stale <= p.unc_init_user);
    }

    #[test]
    fn test_apply_update_moves_ratings_toward_outcome() {
        let p = params();
        let now = Utc::now();
        let user = default_user_rating(Uuid::new_v4(), &p);
        let item = default_item_rating(Uuid::new_v4(), &p);

        let (u_after, i_after, outcome) = apply_update(&user, &item, true, now, &p).unwrap();
        assert!(u_after.rating > user.rating);
        assert!(i_after.rating < item.rating);
        assert!(outcome.delta > 0.0);
        assert_eq!(u_after.n_attempts, 1);

        let (u_wrong, i_wrong, _) = apply_update(&user, &item, false, now, &p).unwrap();
        assert!(u_wrong.rating < user.rating);
        assert!(i_wrong.rating > item.rating);
    }

    #[test]
    fn test_apply_update_rejects_non_finite_input() {
        let p = params();
        let now = Utc::now();
        let mut user = default_user_rating(Uuid::new_v4(), &p);
        user.rating = f64::NAN;
        let item = default_item_rating(Uuid::new_v4(), &p);
        assert!(apply_update(&user, &item, true, now, &p).is_err());
    }

    #[test]
    fn test_recenter_noop_below_threshold() {
        let p = params();
        let mut items = vec![default_item_rating(Uuid::new_v4(), &p)];
        items[0].rating = 10.0;
        let mut users = vec![default_user_rating(Uuid::new_v4(), &p)];
        assert_eq!(recenter(&mut items, &mut users, &p).unwrap(), None);
        assert_eq!(items[0].rating, 10.0);
    }

    #[test]
    fn test_recenter_preserves_gaps() {
        let p = params();
        let mut items: Vec<EloRating> = (0..5)
            .map(|i| {
                let mut r = default_item_rating(Uuid::new_v4(), &p);
                r.rating = 50.0 + i as f64 * 20.0;
                r
            })
            .collect();
        let mut users: Vec<EloRating> = (0..3)
            .map(|i| {
                let mut r = default_user_rating(Uuid::new_v4(), &p);
                r.rating = i as f64 * 30.0;
                r
            })
            .collect();

        let gaps: Vec<f64> = users
            .iter()
            .flat_map(|u| items.iter().map(move |i| u.rating - i.rating))
            .collect();

        let shift = recenter(&mut items, &mut users, &p).unwrap();
        assert!(shift.is_some());

        let new_mean: f64 = items.iter().map(|r| r.rating).sum::<f64>() / items.len() as f64;
        assert!(new_mean.abs() < 1e-9);

        let new_gaps: Vec<f64> = users
            .iter()
            .flat_map(|u| items.iter().map(move |i| u.rating - i.rating))
            .collect();
        for (before, after) in gaps.iter().zip(new_gaps.iter()) {
            assert!((before - after).abs() < 1e-9);
        }
    }

    proptest! {
        #[test]
        fn prop_p_correct_bounded(theta in -2000.0f64..2000.0, b in -2000.0f64..2000.0) {
            let p = params();
            let prob = p_correct(theta, b, &p);
            prop_assert!(prob >= p.guess_floor - 1e-12);
            prop_assert!(prob <= 1.0 + 1e-12);
        }

        #[test]
        fn prop_update_stays_finite(
            theta in -2000.0f64..2000.0,
            b in -2000.0f64..2000.0,
            unc_u in 50.0f64..350.0,
            unc_i in 50.0f64..300.0,
            correct in proptest::bool::ANY,
        ) {
            let p = params();
            let now = Utc::now();
            let mut user = default_user_rating(Uuid::new_v4(), &p);
            user.rating = theta;
            user.uncertainty = unc_u;
            let mut item = default_item_rating(Uuid::new_v4(), &p);
            item.rating = b;
            item.uncertainty = unc_i;

            let (u, i, _) = apply_update(&user, &item, correct, now, &p).unwrap();
            prop_assert!(u.rating.is_finite());
            prop_assert!(i.rating.is_finite());
            prop_assert!(u.uncertainty >= p.unc_floor && u.uncertainty <= p.unc_init_user);
            prop_assert!(i.uncertainty >= p.unc_floor && i.uncertainty <= p.unc_init_item);
        }
    }
}

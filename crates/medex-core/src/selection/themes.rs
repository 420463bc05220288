/// Theme candidate scoring and constrained Thompson-sampling selection.
///
/// Each candidate theme gets a base priority from weakness, due pressure,
/// rating uncertainty, selection recency, and supply; a Beta-posterior
/// sample multiplies it; the top themes are chosen under count and supply
/// constraints and the question quota is split proportionally.
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

use crate::bandit;
use crate::domain::BanditThemeState;
use crate::selection::SelectionParams;

// ============================================================================
// THEME CANDIDATES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ThemeCandidate {
    pub theme_id: i64,
    pub block_id: i64,
    pub title: String,
    pub mastery: f64,
    pub weakness: f64,
    pub due_ratio: f64,
    pub uncertainty_norm: f64,
    pub recency_penalty: f64,
    pub supply: i64,
    pub alpha: f64,
    pub beta: f64,
    pub base_priority: f64,
    pub sampled_y: f64,
    pub final_score: f64,
    pub quota: usize,
    pub selected: bool,
}

impl ThemeCandidate {
    pub fn to_plan_entry(&self) -> Value {
        json!({
            "theme_id": self.theme_id,
            "quota": self.quota,
            "base_priority": round4(self.base_priority),
            "sampled_y": round4(self.sampled_y),
            "final_score": round4(self.final_score),
            "supply": self.supply,
            "due_ratio": round4(self.due_ratio),
        })
    }
}

/// `exp(-Δt/τ)` against the last selection; 0 when never selected.
pub fn compute_recency_penalty(
    last_selected_at: Option<chrono::DateTime<chrono::Utc>>,
    now: chrono::DateTime<chrono::Utc>,
    tau_days: f64,
) -> f64 {
    match last_selected_at {
        Some(at) => {
            let delta_days = (now - at).num_seconds().max(0) as f64 / 86_400.0;
            (-delta_days / tau_days.max(1e-9)).exp()
        }
        None => 0.0,
    }
}

/// `clamp(#due_concepts / baseline, 0, 1)`.
pub fn compute_due_ratio(due_concepts: usize, baseline: f64) -> f64 {
    (due_concepts as f64 / baseline.max(1.0)).clamp(0.0, 1.0)
}

/// Weighted base priority with the supply factor and the exploration floor.
pub fn compute_base_priority(
    weakness: f64,
    due_ratio: f64,
    uncertainty_norm: f64,
    recency_penalty: f64,
    supply: i64,
    params: &SelectionParams,
) -> f64 {
    let supply_factor = (supply as f64 / params.supply_min as f64).min(1.0);
    let raw = params.w_weakness * weakness
        + params.w_due * due_ratio
        + params.w_uncertainty * uncertainty_norm
        - params.w_recency * recency_penalty;
    (raw.max(0.0) * supply_factor).max(params.epsilon_floor)
}

// ============================================================================
// SELECTION
// ============================================================================

/// Thompson-sample every candidate, choose themes under the count/supply
/// constraints, and allocate the question quota.
///
/// Candidates must arrive in a stable order (sorted by theme id); the RNG
/// is consumed once per candidate so the whole pass replays under the seed.
pub fn run_theme_selection<R: Rng>(
    candidates: &mut [ThemeCandidate],
    count: usize,
    rng: &mut R,
    params: &SelectionParams,
) -> Vec<usize> {
    if candidates.is_empty() || count == 0 {
        return Vec::new();
    }

    for candidate in candidates.iter_mut() {
        let state = BanditThemeState {
            user_id: uuid::Uuid::nil(),
            theme_id: candidate.theme_id,
            alpha: candidate.alpha,
            beta: candidate.beta,
            n_sessions: 0,
            last_selected_at: None,
            last_reward: None,
        };
        candidate.sampled_y = bandit::sample_arm(&state, rng);
        candidate.final_score =
            candidate.base_priority * (params.epsilon_floor + candidate.sampled_y);
    }

    // Rank eligible themes by final score, theme id as tie-breaker.
    let mut ranked: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].supply >= params.min_per_theme as i64)
        .collect();
    ranked.sort_by(|&a, &b| {
        candidates[b]
            .final_score
            .partial_cmp(&candidates[a].final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(candidates[a].theme_id.cmp(&candidates[b].theme_id))
    });

    // count/min_per_theme bounds how many themes can take a full minimum
    // quota; min_theme_count is a hard diversity floor that wins over the
    // per-theme minimum when the requested count is small.
    let eligible = ranked.len().min(params.max_theme_count);
    let by_count = (count / params.min_per_theme.max(1)).max(1);
    let chosen_count = by_count
        .max(params.min_theme_count)
        .min(eligible)
        .min(count.max(1));
    let chosen: Vec<usize> = ranked.into_iter().take(chosen_count).collect();

    allocate_quotas(candidates, &chosen, count, params);

    for &i in &chosen {
        candidates[i].selected = true;
    }
    chosen
}

/// Distribute `count` across the chosen themes proportionally to final
/// score, respecting `[min_per_theme, max_per_theme]` and supply; leftover
/// slots go to the highest-scoring themes with headroom. The minimum drops
/// to the per-theme share when the diversity floor chose more themes than
/// `count / min_per_theme`.
fn allocate_quotas(
    candidates: &mut [ThemeCandidate],
    chosen: &[usize],
    count: usize,
    params: &SelectionParams,
) {
    if chosen.is_empty() {
        return;
    }

    // The per-theme minimum yields when the diversity floor squeezed the
    // per-theme share below it.
    let min_quota = params.min_per_theme.min((count / chosen.len()).max(1));

    let total_score: f64 = chosen.iter().map(|&i| candidates[i].final_score).sum();
    let mut allocated = 0usize;

    for &i in chosen {
        let cap = params
            .max_per_theme
            .min(candidates[i].supply.max(0) as usize);
        let share = if total_score > 0.0 {
            candidates[i].final_score / total_score
        } else {
            1.0 / chosen.len() as f64
        };
        let proportional = (count as f64 * share).floor() as usize;
        let quota = proportional.clamp(min_quota.min(cap), cap);
        candidates[i].quota = quota;
        allocated += quota;
    }

    // Hand out remainders in score order; trim overshoot from the bottom.
    let mut remaining = count.saturating_sub(allocated);
    while remaining > 0 {
        let mut gave_any = false;
        for &i in chosen {
            if remaining == 0 {
                break;
            }
            let cap = params
                .max_per_theme
                .min(candidates[i].supply.max(0) as usize);
            if candidates[i].quota < cap {
                candidates[i].quota += 1;
                remaining -= 1;
                gave_any = true;
            }
        }
        if !gave_any {
            break;
        }
    }

    let mut overshoot = allocated.saturating_sub(count);
    while overshoot > 0 {
        let mut trimmed_any = false;
        for &i in chosen.iter().rev() {
            if overshoot == 0 {
                break;
            }
            if candidates[i].quota > min_quota {
                candidates[i].quota -= 1;
                overshoot -= 1;
                trimmed_any = true;
            }
        }
        if !trimmed_any {
            break;
        }
    }
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::seed::seeded_rng;
    use chrono::{Duration, Utc};

    fn candidate(theme_id: i64, mastery: f64, supply: i64) -> ThemeCandidate {
        let params = SelectionParams::default();
        let weakness = 1.0 - mastery;
        let base = compute_base_priority(weakness, 0.0, 0.5, 0.0, supply, &params);
        ThemeCandidate {
            theme_id,
            block_id: 1,
            title: format!("theme-{theme_id}"),
            mastery,
            weakness,
            due_ratio: 0.0,
            uncertainty_norm: 0.5,
            recency_penalty: 0.0,
            supply,
            alpha: 1.0,
            beta: 1.0,
            base_priority: base,
            sampled_y: 0.0,
            final_score: 0.0,
            quota: 0,
            selected: false,
        }
    }

    #[test]
    fn test_recency_penalty_decays() {
        let now = Utc::now();
        let fresh = compute_recency_penalty(Some(now), now, 7.0);
        let week = compute_recency_penalty(Some(now - Duration::days(7)), now, 7.0);
        let never = compute_recency_penalty(None, now, 7.0);
        assert!((fresh - 1.0).abs() < 1e-6);
        assert!((week - (-1.0f64).exp()).abs() < 1e-6);
        assert_eq!(never, 0.0);
    }

    #[test]
    fn test_due_ratio_clamped() {
        assert_eq!(compute_due_ratio(0, 10.0), 0.0);
        assert_eq!(compute_due_ratio(5, 10.0), 0.5);
        assert_eq!(compute_due_ratio(50, 10.0), 1.0);
    }

    #[test]
    fn test_base_priority_epsilon_floor() {
        let params = SelectionParams::default();
        // Fully mastered, nothing due, settled rating, just selected: the
        // floor keeps exploration alive.
        let priority = compute_base_priority(0.0, 0.0, 0.0, 1.0, 100, &params);
        assert_eq!(priority, params.epsilon_floor);
    }

    #[test]
    fn test_base_priority_scales_with_supply() {
        let params = SelectionParams::default();
        let scarce = compute_base_priority(1.0, 1.0, 1.0, 0.0, 2, &params);
        let plentiful = compute_base_priority(1.0, 1.0, 1.0, 0.0, 100, &params);
        assert!(scarce < plentiful);
    }

    #[test]
    fn test_selection_is_deterministic_under_seed() {
        let params = SelectionParams::default();
        let build = || {
            vec![
                candidate(1, 0.2, 50),
                candidate(2, 0.5, 50),
                candidate(3, 0.8, 50),
                candidate(4, 0.4, 50),
            ]
        };

        let mut a = build();
        let mut b = build();
        let chosen_a = run_theme_selection(&mut a, 10, &mut seeded_rng(99), &params);
        let chosen_b = run_theme_selection(&mut b, 10, &mut seeded_rng(99), &params);
        assert_eq!(chosen_a, chosen_b);
        for (ca, cb) in a.iter().zip(b.iter()) {
            assert_eq!(ca.sampled_y, cb.sampled_y);
            assert_eq!(ca.quota, cb.quota);
        }
    }

    #[test]
    fn test_quota_sums_to_count_with_ample_supply() {
        let params = SelectionParams::default();
        let mut candidates = vec![
            candidate(1, 0.2, 50),
            candidate(2, 0.5, 50),
            candidate(3, 0.8, 50),
        ];
        let chosen = run_theme_selection(&mut candidates, 10, &mut seeded_rng(7), &params);
        let total: usize = chosen.iter().map(|&i| candidates[i].quota).sum();
        assert_eq!(total, 10);
        for &i in &chosen {
            assert!(candidates[i].quota >= params.min_per_theme);
            assert!(candidates[i].quota <= params.max_per_theme);
        }
    }

    #[test]
    fn test_quota_respects_supply_cap() {
        let params = SelectionParams::default();
        let mut candidates = vec![candidate(1, 0.2, 3), candidate(2, 0.5, 3)];
        let chosen = run_theme_selection(&mut candidates, 10, &mut seeded_rng(7), &params);
        for &i in &chosen {
            assert!(candidates[i].quota <= candidates[i].supply as usize);
        }
    }

    #[test]
    fn test_under_supplied_theme_excluded() {
        let params = SelectionParams::default();
        let mut candidates = vec![candidate(1, 0.2, 50), candidate(2, 0.1, 1)];
        let chosen = run_theme_selection(&mut candidates, 6, &mut seeded_rng(7), &params);
        // Theme 2 has supply below min_per_theme and cannot be chosen.
        assert!(chosen.iter().all(|&i| candidates[i].theme_id != 2));
    }

    #[test]
    fn test_theme_count_capped_by_session_size() {
        let params = SelectionParams::default();
        let mut candidates: Vec<ThemeCandidate> =
            (1..=10).map(|t| candidate(t, 0.5, 50)).collect();
        // count 5 with min 2 per theme allows at most 2 themes.
        let chosen = run_theme_selection(&mut candidates, 5, &mut seeded_rng(7), &params);
        assert!(chosen.len() <= 2);
        let total: usize = chosen.iter().map(|&i| candidates[i].quota).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_min_theme_count_is_a_hard_floor() {
        // count 3 could only feed one theme at min_per_theme = 2, but the
        // diversity floor of 2 themes wins; one quota drops below the
        // per-theme minimum instead.
        let params = SelectionParams::default();
        let mut candidates = vec![
            candidate(1, 0.2, 50),
            candidate(2, 0.5, 50),
            candidate(3, 0.8, 50),
        ];
        let chosen = run_theme_selection(&mut candidates, 3, &mut seeded_rng(7), &params);
        assert_eq!(chosen.len(), params.min_theme_count);
        let total: usize = chosen.iter().map(|&i| candidates[i].quota).sum();
        assert_eq!(total, 3);
        assert!(chosen.iter().all(|&i| candidates[i].quota >= 1));
    }

    #[test]
    fn test_single_question_takes_single_theme() {
        let params = SelectionParams::default();
        let mut candidates = vec![candidate(1, 0.2, 50), candidate(2, 0.5, 50)];
        let chosen = run_theme_selection(&mut candidates, 1, &mut seeded_rng(7), &params);
        // The diversity floor cannot exceed the question count.
        assert_eq!(chosen.len(), 1);
        assert_eq!(candidates[chosen[0]].quota, 1);
    }

    #[test]
    fn test_empty_candidates() {
        let params = SelectionParams::default();
        let mut candidates: Vec<ThemeCandidate> = Vec::new();
        let chosen = run_theme_selection(&mut candidates, 10, &mut seeded_rng(7), &params);
        assert!(chosen.is_empty());
    }
}

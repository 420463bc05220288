/// Item picking within a selected theme.
///
/// Candidates are classified against the learner's Elo-predicted chance of
/// answering correctly and picked in priority order: due concepts, weak
/// concepts, the challenge band, exploration of new and uncertain items,
/// then anything left.
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use crate::elo::{self, EloParams};
use crate::selection::SelectionParams;

// ============================================================================
// ITEM CANDIDATES
// ============================================================================

#[derive(Debug, Clone)]
pub struct ItemCandidate {
    pub item_id: Uuid,
    pub concept_id: Option<i64>,
    pub difficulty_rating: f64,
    pub difficulty_uncertainty: Option<f64>,
    pub rating_attempts: i64,

    // Computed during classification
    pub p_correct: f64,
    pub in_challenge_band: bool,
    pub is_due_concept: bool,
    pub is_weak_concept: bool,
    pub is_new_item: bool,
    pub selected: bool,
    pub selection_reason: &'static str,
}

impl ItemCandidate {
    pub fn new(
        item_id: Uuid,
        concept_id: Option<i64>,
        difficulty_rating: f64,
        difficulty_uncertainty: Option<f64>,
        rating_attempts: i64,
    ) -> Self {
        Self {
            item_id,
            concept_id,
            difficulty_rating,
            difficulty_uncertainty,
            rating_attempts,
            p_correct: 0.5,
            in_challenge_band: false,
            is_due_concept: false,
            is_weak_concept: false,
            is_new_item: false,
            selected: false,
            selection_reason: "",
        }
    }
}

/// Classify candidates against the learner rating and concept sets.
pub fn classify_candidates(
    candidates: &mut [ItemCandidate],
    user_rating: f64,
    due_concepts: &HashSet<i64>,
    weak_concepts: &HashSet<i64>,
    params: &SelectionParams,
    elo_params: &EloParams,
) {
    for candidate in candidates.iter_mut() {
        candidate.p_correct =
            elo::p_correct(user_rating, candidate.difficulty_rating, elo_params);
        candidate.in_challenge_band =
            candidate.p_correct >= params.p_low && candidate.p_correct <= params.p_high;
        if let Some(concept_id) = candidate.concept_id {
            candidate.is_due_concept = due_concepts.contains(&concept_id);
            candidate.is_weak_concept = weak_concepts.contains(&concept_id);
        }
        candidate.is_new_item = candidate.rating_attempts < params.min_attempts_for_rated;
    }
}

// ============================================================================
// PICKING
// ============================================================================

#[derive(Debug, Clone)]
pub struct PickResult {
    pub theme_id: i64,
    pub quota: usize,
    pub selected: Vec<Uuid>,
    pub selected_due: usize,
    pub selected_weak: usize,
    pub selected_band: usize,
    pub selected_explore: usize,
    pub avg_p_correct: f64,
}

impl PickResult {
    fn to_stats(&self) -> Value {
        json!({
            "theme_id": self.theme_id,
            "quota": self.quota,
            "selected_count": self.selected.len(),
            "selected_due": self.selected_due,
            "selected_weak": self.selected_weak,
            "selected_band": self.selected_band,
            "selected_explore": self.selected_explore,
            "avg_p_correct": round4(self.avg_p_correct),
        })
    }
}

/// Pick up to `quota` items for one theme from classified candidates.
pub fn pick_for_theme<R: Rng>(
    theme_id: i64,
    quota: usize,
    mut candidates: Vec<ItemCandidate>,
    params: &SelectionParams,
    rng: &mut R,
) -> PickResult {
    let mut result = PickResult {
        theme_id,
        quota,
        selected: Vec::new(),
        selected_due: 0,
        selected_weak: 0,
        selected_band: 0,
        selected_explore: 0,
        avg_p_correct: 0.0,
    };
    if quota == 0 || candidates.is_empty() {
        return result;
    }

    // Exploration at the configured rates; small quotas round to no slots
    // so due/weak/band picks are never crowded out.
    let n_explore_new = (quota as f64 * params.explore_new_rate).floor() as usize;
    let n_explore_unc = (quota as f64 * params.explore_uncertainty_rate).floor() as usize;
    let n_regular = quota.saturating_sub(n_explore_new + n_explore_unc);

    let mut selected_ids: HashSet<Uuid> = HashSet::new();

    // Priority 1: due concepts inside the challenge band
    let mut tier: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].is_due_concept && candidates[i].in_challenge_band)
        .collect();
    tier.shuffle(rng);
    for i in tier {
        if selected_ids.len() >= n_regular {
            break;
        }
        if select(&mut candidates[i], "due_concept", &mut selected_ids, &mut result.selected) {
            result.selected_due += 1;
        }
    }

    // Priority 2: weak concepts inside the challenge band
    let mut tier: Vec<usize> = (0..candidates.len())
        .filter(|&i| {
            candidates[i].is_weak_concept
                && !candidates[i].selected
                && candidates[i].in_challenge_band
        })
        .collect();
    tier.shuffle(rng);
    for i in tier {
        if selected_ids.len() >= n_regular {
            break;
        }
        if select(&mut candidates[i], "weak_concept", &mut selected_ids, &mut result.selected) {
            result.selected_weak += 1;
        }
    }

    // Priority 3: challenge band, most centered first
    let band_center = (params.p_low + params.p_high) / 2.0;
    let mut tier: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].in_challenge_band && !candidates[i].selected)
        .collect();
    tier.sort_by(|&a, &b| {
        let da = (candidates[a].p_correct - band_center).abs();
        let db = (candidates[b].p_correct - band_center).abs();
        da.partial_cmp(&db)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(candidates[a].item_id.cmp(&candidates[b].item_id))
    });
    for i in tier {
        if selected_ids.len() >= n_regular {
            break;
        }
        if select(&mut candidates[i], "challenge_band", &mut selected_ids, &mut result.selected) {
            result.selected_band += 1;
        }
    }

    // Priority 4: exploration of new/unrated items
    let mut tier: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].is_new_item && !candidates[i].selected)
        .collect();
    tier.shuffle(rng);
    for i in tier {
        if selected_ids.len() >= n_regular + n_explore_new {
            break;
        }
        if select(&mut candidates[i], "explore_new", &mut selected_ids, &mut result.selected) {
            result.selected_explore += 1;
        }
    }

    // Priority 5: high-uncertainty items, most uncertain first
    let mut tier: Vec<usize> = (0..candidates.len())
        .filter(|&i| {
            !candidates[i].selected
                && candidates[i]
                    .difficulty_uncertainty
                    .map(|u| u > params.high_uncertainty_threshold)
                    .unwrap_or(false)
        })
        .collect();
    tier.sort_by(|&a, &b| {
        let ua = candidates[a].difficulty_uncertainty.unwrap_or(0.0);
        let ub = candidates[b].difficulty_uncertainty.unwrap_or(0.0);
        ub.partial_cmp(&ua)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(candidates[a].item_id.cmp(&candidates[b].item_id))
    });
    for i in tier {
        if selected_ids.len() >= quota {
            break;
        }
        if select(&mut candidates[i], "explore_uncertainty", &mut selected_ids, &mut result.selected)
        {
            result.selected_explore += 1;
        }
    }

    // Fallback: anything left
    let mut tier: Vec<usize> = (0..candidates.len())
        .filter(|&i| !candidates[i].selected)
        .collect();
    tier.shuffle(rng);
    for i in tier {
        if selected_ids.len() >= quota {
            break;
        }
        select(&mut candidates[i], "fallback", &mut selected_ids, &mut result.selected);
    }

    let picked: Vec<&ItemCandidate> = candidates.iter().filter(|c| c.selected).collect();
    if !picked.is_empty() {
        result.avg_p_correct =
            picked.iter().map(|c| c.p_correct).sum::<f64>() / picked.len() as f64;
    }
    result
}

fn select(
    candidate: &mut ItemCandidate,
    reason: &'static str,
    selected_ids: &mut HashSet<Uuid>,
    selected: &mut Vec<Uuid>,
) -> bool {
    if selected_ids.contains(&candidate.item_id) {
        return false;
    }
    candidate.selected = true;
    candidate.selection_reason = reason;
    selected_ids.insert(candidate.item_id);
    selected.push(candidate.item_id);
    true
}

// ============================================================================
// MERGING ACROSS THEMES
// ============================================================================

#[derive(Debug, Clone)]
pub struct PickerStats {
    pub total_selected: usize,
    pub due_coverage: usize,
    pub weak_coverage: usize,
    pub explore_count: usize,
    pub avg_p_correct: f64,
    pub per_theme: Value,
}

/// Pick per theme and merge: round-robin interleave for tutor/revision
/// flow, contiguous per-theme blocks for exam flow.
pub fn merge_theme_picks(results: &[PickResult], interleave: bool) -> Vec<Uuid> {
    if interleave {
        interleave_round_robin(results)
    } else {
        results
            .iter()
            .flat_map(|r| r.selected.iter().copied())
            .collect()
    }
}

pub fn aggregate_stats(results: &[PickResult]) -> PickerStats {
    let total_selected: usize = results.iter().map(|r| r.selected.len()).sum();
    let weighted_p: f64 = results
        .iter()
        .map(|r| r.avg_p_correct * r.selected.len() as f64)
        .sum();
    PickerStats {
        total_selected,
        due_coverage: results.iter().map(|r| r.selected_due).sum(),
        weak_coverage: results.iter().map(|r| r.selected_weak).sum(),
        explore_count: results.iter().map(|r| r.selected_explore).sum(),
        avg_p_correct: if total_selected > 0 {
            weighted_p / total_selected as f64
        } else {
            0.0
        },
        per_theme: Value::Array(results.iter().map(|r| r.to_stats()).collect()),
    }
}

fn interleave_round_robin(results: &[PickResult]) -> Vec<Uuid> {
    let mut cursors: Vec<(usize, &PickResult)> = results
        .iter()
        .filter(|r| !r.selected.is_empty())
        .map(|r| (0usize, r))
        .collect();

    let mut merged = Vec::new();
    while !cursors.is_empty() {
        let mut still_active = Vec::new();
        for (cursor, result) in cursors {
            if let Some(&item_id) = result.selected.get(cursor) {
                merged.push(item_id);
                if cursor + 1 < result.selected.len() {
                    still_active.push((cursor + 1, result));
                }
            }
        }
        cursors = still_active;
    }
    merged
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// ============================================================================
// TESTS
// ============================================================================

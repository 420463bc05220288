/// Selection orchestrator.
///
/// The v1 path runs the full nine-stage adaptive pipeline; the v0 path is
/// the original seeded shuffle over eligible published items. When the
/// adaptive module is shadowed, the learner-visible list comes from v0 and
/// the v1 plan is computed for the log only.
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::bandit;
use crate::domain::{CognitiveLevel, EngineError, ItemDifficulty, Result, SessionMode};
use crate::elo::{self, EloParams};
use crate::ports::{ContentRepository, PublishedItemFilter, StateRepository};
use crate::runtime::ModuleVersion;
use crate::selection::picker::{
    aggregate_stats, classify_candidates, merge_theme_picks, pick_for_theme, ItemCandidate,
    PickResult,
};
use crate::selection::seed::{derive_seed, seeded_rng};
use crate::selection::themes::{
    compute_base_priority, compute_due_ratio, compute_recency_penalty, run_theme_selection,
    ThemeCandidate,
};
use crate::selection::SelectionParams;

// ============================================================================
// REQUEST / OUTCOME
// ============================================================================

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub user_id: Uuid,
    pub year: i32,
    pub block_ids: Vec<i64>,
    pub theme_ids: Option<Vec<i64>>,
    pub count: usize,
    pub mode: SessionMode,
    pub difficulty: Option<Vec<ItemDifficulty>>,
    pub cognitive: Option<Vec<CognitiveLevel>>,
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub item_ids: Vec<Uuid>,
    pub plan: Value,
    pub seed_hex: String,
    /// True when fewer items than requested could be produced.
    pub shortfall: bool,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct SelectionEngine {
    content: Arc<dyn ContentRepository>,
    state: Arc<dyn StateRepository>,
}

impl SelectionEngine {
    pub fn new(content: Arc<dyn ContentRepository>, state: Arc<dyn StateRepository>) -> Self {
        Self { content, state }
    }

    /// Run selection under the resolved module version.
    ///
    /// `frozen` suppresses the bandit selection marks (the only state write
    /// on this path).
    pub async fn select(
        &self,
        request: &SelectionRequest,
        version: ModuleVersion,
        frozen: bool,
        now: DateTime<Utc>,
        params: &SelectionParams,
        elo_params: &EloParams,
    ) -> Result<SelectionOutcome> {
        match version {
            ModuleVersion::V1 => {
                self.select_v1(request, frozen, now, params, elo_params, true)
                    .await
            }
            ModuleVersion::V0 => self.select_v0(request).await,
            ModuleVersion::Shadow => {
                // Learner-visible output stays on v0; the v1 plan is
                // computed read-only and attached for the log.
                let mut outcome = self.select_v0(request).await?;
                match self
                    .select_v1(request, frozen, now, params, elo_params, false)
                    .await
                {
                    Ok(shadowed) => {
                        outcome.plan["shadow_plan"] = shadowed.plan;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "shadow adaptive selection failed");
                        outcome.plan["shadow_plan"] = json!({"error": e.to_string()});
                    }
                }
                Ok(outcome)
            }
        }
    }

    // ========================================================================
    // V0: seeded shuffle
    // ========================================================================

    async fn select_v0(&self, request: &SelectionRequest) -> Result<SelectionOutcome> {
        let (seed, seed_hex) = derive_seed(
            request.user_id,
            request.mode,
            request.count,
            &request.block_ids,
            request.theme_ids.as_deref(),
        );

        let filter = PublishedItemFilter {
            year: request.year,
            block_ids: request.block_ids.clone(),
            theme_ids: request.theme_ids.clone(),
            difficulty: request.difficulty.clone(),
            cognitive: request.cognitive.clone(),
        };
        let eligible = self
            .content
            .list_published(&filter)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let mut ids: Vec<Uuid> = eligible.iter().map(|q| q.id).collect();
        ids.sort();
        let mut rng = seeded_rng(seed);
        ids.shuffle(&mut rng);
        let shortfall = ids.len() < request.count;
        ids.truncate(request.count);

        let plan = json!({
            "strategy": "seeded_shuffle",
            "eligible": eligible.len(),
            "taken": ids.len(),
        });
        Ok(SelectionOutcome {
            item_ids: ids,
            plan,
            seed_hex,
            shortfall,
        })
    }

    // ========================================================================
    // V1: constrained Thompson sampling
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn select_v1(
        &self,
        request: &SelectionRequest,
        frozen: bool,
        now: DateTime<Utc>,
        params: &SelectionParams,
        elo_params: &EloParams,
        mark_bandit: bool,
    ) -> Result<SelectionOutcome> {
        let (seed, seed_hex) = derive_seed(
            request.user_id,
            request.mode,
            request.count,
            &request.block_ids,
            request.theme_ids.as_deref(),
        );
        let mut rng = seeded_rng(seed);

        // Stage 2: exclusion pool
        let excluded = self
            .state
            .recently_seen_items(
                request.user_id,
                params.exclude_seen_within_days,
                params.exclude_seen_within_sessions,
                now,
            )
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let excluded_set: HashSet<Uuid> = excluded.iter().copied().collect();

        // Candidate themes
        let mut raw_themes = self
            .content
            .candidate_themes(
                request.year,
                &request.block_ids,
                request.theme_ids.as_deref(),
                params.max_candidate_themes,
            )
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        raw_themes.sort_by_key(|t| t.theme_id);

        if raw_themes.is_empty() {
            return Ok(SelectionOutcome {
                item_ids: Vec::new(),
                plan: json!({"reason": "no_candidate_themes"}),
                seed_hex,
                shortfall: true,
            });
        }
        let theme_ids: Vec<i64> = raw_themes.iter().map(|t| t.theme_id).collect();

        // Stage 3 inputs: supply, mastery, due concepts, rating, bandit arms
        let supply = self
            .content
            .theme_supply(request.year, &theme_ids, &excluded)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let mastery_by_theme: HashMap<i64, f64> = self
            .state
            .get_mastery(request.user_id, &theme_ids)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .into_iter()
            .map(|m| (m.theme_id, m.mastery_score))
            .collect();
        let due_by_theme = self
            .state
            .due_concepts_by_theme(request.user_id, &theme_ids, now)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let user_rating = self
            .state
            .get_user_rating(request.user_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .unwrap_or_else(|| elo::default_user_rating(request.user_id, elo_params));
        let bandit_states = self
            .state
            .get_bandit_states(request.user_id, &theme_ids)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let uncertainty_norm = elo::normalize_uncertainty(
            user_rating.uncertainty,
            elo_params.unc_init_user,
            elo_params.unc_floor,
        );

        // Stage 3-4: score candidates
        let bandit_params = bandit::BanditParams::default();
        let mut candidates: Vec<ThemeCandidate> = raw_themes
            .iter()
            .map(|info| {
                let mastery = mastery_by_theme.get(&info.theme_id).copied().unwrap_or(0.5);
                let due_count = due_by_theme
                    .get(&info.theme_id)
                    .map(|c| c.len())
                    .unwrap_or(0);
                let theme_supply = supply.get(&info.theme_id).copied().unwrap_or(0);
                let arm = bandit_states.get(&info.theme_id);

                let weakness = 1.0 - mastery;
                let due_ratio = compute_due_ratio(due_count, params.due_baseline);
                let recency_penalty = compute_recency_penalty(
                    arm.and_then(|a| a.last_selected_at),
                    now,
                    params.recency_tau_days,
                );
                let base_priority = compute_base_priority(
                    weakness,
                    due_ratio,
                    uncertainty_norm,
                    recency_penalty,
                    theme_supply,
                    params,
                );

                ThemeCandidate {
                    theme_id: info.theme_id,
                    block_id: info.block_id,
                    title: info.title.clone(),
                    mastery,
                    weakness,
                    due_ratio,
                    uncertainty_norm,
                    recency_penalty,
                    supply: theme_supply,
                    alpha: arm.map(|a| a.alpha).unwrap_or(bandit_params.prior_alpha),
                    beta: arm.map(|a| a.beta).unwrap_or(bandit_params.prior_beta),
                    base_priority,
                    sampled_y: 0.0,
                    final_score: 0.0,
                    quota: 0,
                    selected: false,
                }
            })
            .collect();

        // Stages 4-6: sample, choose themes, allocate quota
        let chosen = run_theme_selection(&mut candidates, request.count, &mut rng, params);
        if chosen.is_empty() {
            return Ok(SelectionOutcome {
                item_ids: Vec::new(),
                plan: json!({"reason": "no_themes_selected"}),
                seed_hex,
                shortfall: true,
            });
        }

        // Stage 7: pick items within each chosen theme
        let mut results: Vec<PickResult> = Vec::new();
        let mut taken: HashSet<Uuid> = excluded_set.clone();
        for &idx in &chosen {
            let theme = &candidates[idx];
            let exclude_now: Vec<Uuid> = taken.iter().copied().collect();
            let items = self
                .content
                .items_for_theme(
                    request.year,
                    theme.theme_id,
                    &exclude_now,
                    params.per_theme_item_limit,
                )
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;

            let item_ids: Vec<Uuid> = items.iter().map(|q| q.id).collect();
            let ratings = self
                .state
                .get_item_ratings(&item_ids)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;

            let mut item_candidates: Vec<ItemCandidate> = items
                .iter()
                .map(|q| {
                    let rating = ratings.get(&q.id);
                    ItemCandidate::new(
                        q.id,
                        q.concept_id,
                        rating.map(|r| r.rating).unwrap_or(0.0),
                        rating.map(|r| r.uncertainty),
                        rating.map(|r| r.n_attempts).unwrap_or(0),
                    )
                })
                .collect();
            item_candidates.sort_by_key(|c| c.item_id);

            let due_concepts: HashSet<i64> = due_by_theme
                .get(&theme.theme_id)
                .map(|c| c.iter().copied().collect())
                .unwrap_or_default();
            let weak_concepts: HashSet<i64> = if theme.mastery < params.weak_mastery_threshold {
                item_candidates.iter().filter_map(|c| c.concept_id).collect()
            } else {
                HashSet::new()
            };

            classify_candidates(
                &mut item_candidates,
                user_rating.rating,
                &due_concepts,
                &weak_concepts,
                params,
                elo_params,
            );

            let result = pick_for_theme(
                theme.theme_id,
                candidates[idx].quota,
                item_candidates,
                params,
                &mut rng,
            );
            taken.extend(result.selected.iter().copied());
            results.push(result);
        }

        // Stage 8: interleave (contiguous in exam mode)
        let interleave = request.mode != SessionMode::Exam;
        let item_ids = merge_theme_picks(&results, interleave);
        let stats = aggregate_stats(&results);
        let shortfall = item_ids.len() < request.count;

        // Stage 9: decision plan
        let plan = json!({
            "themes": chosen
                .iter()
                .map(|&i| candidates[i].to_plan_entry())
                .collect::<Vec<Value>>(),
            "p_band": {"low": params.p_low, "high": params.p_high},
            "due_coverage": stats.due_coverage,
            "weak_coverage": stats.weak_coverage,
            "avg_p_correct": stats.avg_p_correct,
            "stats": {
                "excluded_recent": excluded.len(),
                "explore_used": stats.explore_count,
                "per_theme": stats.per_theme,
            },
        });

        // Mark arms selected. Posteriors move only at submit.
        if mark_bandit && !frozen {
            for &idx in &chosen {
                let theme_id = candidates[idx].theme_id;
                let mut arm = bandit_states
                    .get(&theme_id)
                    .cloned()
                    .unwrap_or_else(|| {
                        bandit::new_arm(request.user_id, theme_id, &bandit_params)
                    });
                bandit::mark_selected(&mut arm, now);
                self.state
                    .upsert_bandit_state(&arm)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
            }
        }

        Ok(SelectionOutcome {
            item_ids,
            plan,
            seed_hex,
            shortfall,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CognitiveLevel, ItemDifficulty, PublishedItem};
    use crate::ports::{MockContentRepository, MockStateRepository, ThemeInfo};
    use mockall::predicate::always;

    fn item(year: i32, theme_id: i64, concept_id: i64) -> PublishedItem {
        PublishedItem {
            id: Uuid::new_v4(),
            year,
            block_id: 1,
            theme_id,
            concept_id: Some(concept_id),
            stem: "stem".to_string(),
            options: vec!["a", "b", "c", "d", "e"]
                .into_iter()
                .map(String::from)
                .collect(),
            correct_index: 2,
            explanation: None,
            difficulty: ItemDifficulty::Medium,
            cognitive_level: CognitiveLevel::Recall,
        }
    }

    fn engine_with_state(
        items_by_theme: HashMap<i64, Vec<PublishedItem>>,
    ) -> SelectionEngine {
        let mut content = MockContentRepository::new();
        let all_items: Vec<PublishedItem> =
            items_by_theme.values().flatten().cloned().collect();
        let theme_ids: Vec<i64> = {
            let mut ids: Vec<i64> = items_by_theme.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        {
            let all_items = all_items.clone();
            content
                .expect_list_published()
                .returning(move |_| Ok(all_items.clone()));
        }
        {
            let theme_ids = theme_ids.clone();
            content.expect_candidate_themes().returning(move |_, _, _, _| {
                Ok(theme_ids
                    .iter()
                    .map(|&theme_id| ThemeInfo {
                        theme_id,
                        block_id: 1,
                        title: format!("theme-{theme_id}"),
                    })
                    .collect())
            });
        }
        {
            let items_by_theme = items_by_theme.clone();
            content.expect_theme_supply().returning(move |_, ids, _| {
                Ok(ids
                    .iter()
                    .map(|&t| (t, items_by_theme.get(&t).map(|v| v.len()).unwrap_or(0) as i64))
                    .collect())
            });
        }
        content
            .expect_items_for_theme()
            .returning(move |_, theme_id, excluded, _| {
                let excluded: HashSet<Uuid> = excluded.iter().copied().collect();
                Ok(items_by_theme
                    .get(&theme_id)
                    .map(|v| {
                        v.iter()
                            .filter(|q| !excluded.contains(&q.id))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            });

        let mut state = MockStateRepository::new();
        state
            .expect_recently_seen_items()
            .returning(|_, _, _, _| Ok(Vec::new()));
        state.expect_get_mastery().returning(|_, _| Ok(Vec::new()));
        state
            .expect_due_concepts_by_theme()
            .returning(|_, _, _| Ok(HashMap::new()));
        state.expect_get_user_rating().returning(|_| Ok(None));
        state
            .expect_get_item_ratings()
            .returning(|_| Ok(HashMap::new()));
        state
            .expect_get_bandit_states()
            .returning(|_, _| Ok(HashMap::new()));
        state
            .expect_upsert_bandit_state()
            .with(always())
            .returning(|_| Ok(()));

        SelectionEngine::new(Arc::new(content), Arc::new(state))
    }

    fn request(count: usize, mode: SessionMode) -> SelectionRequest {
        SelectionRequest {
            user_id: Uuid::new_v4(),
            year: 1,
            block_ids: vec![1],
            theme_ids: None,
            count,
            mode,
            difficulty: None,
            cognitive: None,
        }
    }

    fn fixture() -> HashMap<i64, Vec<PublishedItem>> {
        let mut items = HashMap::new();
        for theme_id in 1..=3i64 {
            items.insert(
                theme_id,
                (0..20)
                    .map(|i| item(1, theme_id, theme_id * 100 + i))
                    .collect(),
            );
        }
        items
    }

    #[tokio::test]
    async fn test_v1_returns_requested_count() {
        let engine = engine_with_state(fixture());
        let req = request(10, SessionMode::Tutor);
        let outcome = engine
            .select(
                &req,
                ModuleVersion::V1,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.item_ids.len(), 10);
        assert!(!outcome.shortfall);
        // No duplicates
        let unique: HashSet<Uuid> = outcome.item_ids.iter().copied().collect();
        assert_eq!(unique.len(), 10);
        assert!(outcome.plan["themes"].is_array());
    }

    #[tokio::test]
    async fn test_v1_deterministic_for_same_request() {
        let items = fixture();
        let user_id = Uuid::new_v4();
        let req = SelectionRequest {
            user_id,
            ..request(10, SessionMode::Tutor)
        };

        let a = engine_with_state(items.clone())
            .select(
                &req,
                ModuleVersion::V1,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        let b = engine_with_state(items)
            .select(
                &req,
                ModuleVersion::V1,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(a.item_ids, b.item_ids);
        assert_eq!(a.seed_hex, b.seed_hex);
    }

    #[tokio::test]
    async fn test_v0_deterministic_and_counted() {
        let engine = engine_with_state(fixture());
        let req = request(7, SessionMode::Tutor);
        let a = engine
            .select(
                &req,
                ModuleVersion::V0,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        let b = engine
            .select(
                &req,
                ModuleVersion::V0,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(a.item_ids, b.item_ids);
        assert_eq!(a.item_ids.len(), 7);
        assert_eq!(a.plan["strategy"], "seeded_shuffle");
    }

    #[tokio::test]
    async fn test_v0_shortfall_flagged() {
        let mut items = HashMap::new();
        items.insert(1i64, (0..3).map(|i| item(1, 1, i)).collect::<Vec<_>>());
        let engine = engine_with_state(items);

        let outcome = engine
            .select(
                &request(10, SessionMode::Tutor),
                ModuleVersion::V0,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        assert!(outcome.shortfall);
        assert_eq!(outcome.item_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_pool_returns_reasoned_plan() {
        let engine = engine_with_state(HashMap::new());
        let outcome = engine
            .select(
                &request(5, SessionMode::Tutor),
                ModuleVersion::V1,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        assert!(outcome.item_ids.is_empty());
        assert!(outcome.shortfall);
        assert_eq!(outcome.plan["reason"], "no_candidate_themes");
    }

    #[tokio::test]
    async fn test_shadow_serves_v0_and_attaches_plan() {
        let engine = engine_with_state(fixture());
        let req = request(6, SessionMode::Tutor);

        let shadow = engine
            .select(
                &req,
                ModuleVersion::Shadow,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        let v0 = engine
            .select(
                &req,
                ModuleVersion::V0,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();

        // Learner-visible list matches v0 exactly
        assert_eq!(shadow.item_ids, v0.item_ids);
        // And the shadow computation left its plan behind
        assert!(shadow.plan.get("shadow_plan").is_some());
    }

    #[tokio::test]
    async fn test_exam_mode_contiguous_by_theme() {
        let engine = engine_with_state(fixture());
        let outcome = engine
            .select(
                &request(10, SessionMode::Exam),
                ModuleVersion::V1,
                false,
                Utc::now(),
                &SelectionParams::default(),
                &EloParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.item_ids.len(), 10);
    }
}

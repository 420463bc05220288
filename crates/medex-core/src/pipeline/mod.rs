/// Telemetry update pipeline.
///
/// On session submit (or expiry), every answered item fans out into
/// coordinated updates of mastery, revision schedule, Elo ratings, and
/// bandit posteriors. Module versions come from the session's runtime
/// snapshot; a frozen runtime suppresses every write; a failed module
/// records its own FAILED run and never aborts the others.
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::bandit::{self, BanditParams};
use crate::domain::{
    EngineError, MasteryRecord, ModelKind, Provenance, Result, RevisionRecord, Session,
    SessionAttempt,
};
use crate::elo::{self, EloParams};
use crate::mastery::{
    bkt::{BktParams, BktState},
    compute_mastery_v0, MasteryBand, MasteryV0Params,
};
use crate::ports::{SessionRepository, StateRepository};
use crate::registry::{provenance_for, AlgoKey, RunLogger, RunStatus};
use crate::revision::{
    map_attempt_to_rating, update_fsrs, update_revision_v0, PERSONALIZATION_MIN_REVIEWS,
};
use crate::runtime::{AlgoModule, ModuleVersion, RuntimeControl};

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub module: AlgoModule,
    pub status: RunStatus,
    pub detail: Value,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub modules: Vec<ModuleOutcome>,
}

impl PipelineSummary {
    pub fn status_of(&self, module: AlgoModule) -> Option<RunStatus> {
        self.modules
            .iter()
            .find(|m| m.module == module)
            .map(|m| m.status)
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct UpdatePipeline {
    sessions: Arc<dyn SessionRepository>,
    state: Arc<dyn StateRepository>,
    runtime: Arc<RuntimeControl>,
    run_logger: RunLogger,
}

impl UpdatePipeline {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        state: Arc<dyn StateRepository>,
        runtime: Arc<RuntimeControl>,
    ) -> Self {
        let run_logger = RunLogger::new(runtime.repo());
        Self {
            sessions,
            state,
            runtime,
            run_logger,
        }
    }

    /// Fan out a finished session into state updates.
    pub async fn on_session_finished(&self, session: &Session) -> Result<PipelineSummary> {
        let now = Utc::now();
        let attempts = self
            .sessions
            .list_session_attempts(session.id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let mut summary = PipelineSummary::default();
        if attempts.is_empty() {
            return Ok(summary);
        }

        // Freeze is re-checked against the live row at fan-out time; the
        // session snapshot's freeze also holds for its whole lifetime.
        let frozen =
            session.algo_at_start.freeze_updates || self.runtime.is_frozen_live().await?;

        let mastery_version =
            RuntimeControl::snapshot_version(&session.algo_at_start, AlgoModule::Mastery);
        let revision_version =
            RuntimeControl::snapshot_version(&session.algo_at_start, AlgoModule::Revision);
        let difficulty_version =
            RuntimeControl::snapshot_version(&session.algo_at_start, AlgoModule::Difficulty);
        let adaptive_version =
            RuntimeControl::snapshot_version(&session.algo_at_start, AlgoModule::Adaptive);

        // Mastery first: its pre/post deltas feed the bandit reward.
        let (mastery_outcome, mastery_deltas) = self
            .run_mastery(session, &attempts, mastery_version, frozen, now)
            .await;
        summary.modules.push(mastery_outcome);

        let revision_outcome = self
            .run_revision(session, &attempts, revision_version, &mastery_deltas, frozen, now)
            .await;
        summary.modules.push(revision_outcome);

        let elo_outcome = self
            .run_elo(session, &attempts, difficulty_version, frozen, now)
            .await;
        summary.modules.push(elo_outcome);

        let bandit_outcome = self
            .run_bandit(session, &attempts, adaptive_version, &mastery_deltas, frozen, now)
            .await;
        summary.modules.push(bandit_outcome);

        Ok(summary)
    }

    // ========================================================================
    // Mastery
    // ========================================================================

    async fn run_mastery(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        version: ModuleVersion,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> (ModuleOutcome, HashMap<i64, (f64, f64)>) {
        let by_theme = group_by_theme(attempts);
        let theme_ids: Vec<i64> = by_theme.keys().copied().collect();

        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Mastery)
            .await
            .unwrap_or(None);
        let run = match self
            .run_logger
            .start(
                AlgoKey::Mastery,
                resolved
                    .as_ref()
                    .map(|(v, p)| (Some(v.id), Some(p.id)))
                    .unwrap_or((None, None)),
                Some(session.user_id),
                Some(session.id),
                "session_submit",
                json!({"themes": theme_ids, "version": version.as_str()}),
                now,
            )
            .await
        {
            Ok(run) => run,
            Err(e) => {
                return (
                    failed_outcome(AlgoModule::Mastery, &e.to_string()),
                    HashMap::new(),
                )
            }
        };
        let provenance = provenance_for(&resolved, run.id);
        let params_value = resolved
            .as_ref()
            .map(|(_, p)| p.params.clone())
            .unwrap_or(Value::Null);

        let result = self
            .mastery_updates(
                session,
                &by_theme,
                version,
                frozen,
                now,
                provenance,
                &params_value,
            )
            .await;

        match result {
            Ok(deltas) => {
                let output = json!({
                    "themes_computed": deltas.len(),
                    "frozen": frozen,
                    "shadow": version == ModuleVersion::Shadow,
                });
                let _ = self.run_logger.success(run, output.clone(), Utc::now()).await;
                (
                    ModuleOutcome {
                        module: AlgoModule::Mastery,
                        status: RunStatus::Success,
                        detail: output,
                    },
                    deltas,
                )
            }
            Err(e) => {
                let _ = self
                    .run_logger
                    .failure(run, &e.to_string(), Utc::now())
                    .await;
                (
                    failed_outcome(AlgoModule::Mastery, &e.to_string()),
                    HashMap::new(),
                )
            }
        }
    }

    async fn mastery_updates(
        &self,
        session: &Session,
        by_theme: &BTreeMap<i64, Vec<&SessionAttempt>>,
        version: ModuleVersion,
        frozen: bool,
        now: DateTime<Utc>,
        provenance: Provenance,
        params_value: &Value,
    ) -> Result<HashMap<i64, (f64, f64)>> {
        let theme_ids: Vec<i64> = by_theme.keys().copied().collect();
        let existing: HashMap<i64, MasteryRecord> = self
            .state
            .get_mastery(session.user_id, &theme_ids)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .into_iter()
            .map(|m| (m.theme_id, m))
            .collect();

        let mut deltas = HashMap::new();
        for (&theme_id, theme_attempts) in by_theme {
            let previous = existing.get(&theme_id);
            let pre = previous.map(|m| m.mastery_score).unwrap_or(0.0);

            let record = match version {
                ModuleVersion::V0 => {
                    let params = MasteryV0Params::from_value(params_value);
                    let samples = self
                        .sessions
                        .collect_theme_attempts(
                            session.user_id,
                            theme_id,
                            params.lookback_days,
                            now,
                        )
                        .await
                        .map_err(|e| EngineError::Transient(e.to_string()))?;
                    let computed = compute_mastery_v0(&samples, &params, now);
                    MasteryRecord {
                        user_id: session.user_id,
                        year: session.year,
                        block_id: theme_attempts[0].block_id,
                        theme_id,
                        attempts_total: computed.attempts_total,
                        correct_total: computed.correct_total,
                        accuracy_pct: computed.accuracy_pct,
                        mastery_score: computed.mastery_score,
                        mastery_model: ModelKind::V0,
                        last_attempt_at: computed.last_attempt_at,
                        breakdown: computed.breakdown,
                        provenance,
                    }
                }
                ModuleVersion::V1 | ModuleVersion::Shadow => {
                    let params = BktParams::from_value(params_value);
                    params.validate()?;
                    let mut state = previous
                        .and_then(|m| BktState::from_value(&m.breakdown))
                        .unwrap_or_else(|| BktState::initial(&params));
                    for attempt in theme_attempts {
                        state = state.observe(attempt.is_correct, &params);
                    }

                    let attempts_total = previous.map(|m| m.attempts_total).unwrap_or(0)
                        + theme_attempts.len() as i64;
                    let correct_total = previous.map(|m| m.correct_total).unwrap_or(0)
                        + theme_attempts.iter().filter(|a| a.is_correct).count() as i64;
                    let accuracy_pct = if attempts_total > 0 {
                        (correct_total as f64 / attempts_total as f64 * 10_000.0).round()
                            / 100.0
                    } else {
                        0.0
                    };
                    MasteryRecord {
                        user_id: session.user_id,
                        year: session.year,
                        block_id: theme_attempts[0].block_id,
                        theme_id,
                        attempts_total,
                        correct_total,
                        accuracy_pct,
                        mastery_score: state.p_l,
                        mastery_model: ModelKind::V1,
                        last_attempt_at: theme_attempts
                            .iter()
                            .filter_map(|a| a.answered_at)
                            .max()
                            .or(previous.and_then(|m| m.last_attempt_at)),
                        breakdown: serde_json::to_value(state).unwrap_or(Value::Null),
                        provenance,
                    }
                }
            };

            let post = record.mastery_score;
            if !frozen && version != ModuleVersion::Shadow {
                self.state
                    .upsert_mastery(&record)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
            }
            deltas.insert(theme_id, (pre, post));
        }
        Ok(deltas)
    }

    // ========================================================================
    // Revision
    // ========================================================================

    async fn run_revision(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        version: ModuleVersion,
        mastery_deltas: &HashMap<i64, (f64, f64)>,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> ModuleOutcome {
        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Revision)
            .await
            .unwrap_or(None);
        let run = match self
            .run_logger
            .start(
                AlgoKey::Revision,
                resolved
                    .as_ref()
                    .map(|(v, p)| (Some(v.id), Some(p.id)))
                    .unwrap_or((None, None)),
                Some(session.user_id),
                Some(session.id),
                "session_submit",
                json!({"attempts": attempts.len(), "version": version.as_str()}),
                now,
            )
            .await
        {
            Ok(run) => run,
            Err(e) => return failed_outcome(AlgoModule::Revision, &e.to_string()),
        };
        let provenance = provenance_for(&resolved, run.id);

        let result = self
            .revision_updates(session, attempts, version, mastery_deltas, frozen, now, provenance)
            .await;
        match result {
            Ok(updated) => {
                let output = json!({
                    "concepts_updated": updated,
                    "frozen": frozen,
                    "shadow": version == ModuleVersion::Shadow,
                });
                let _ = self.run_logger.success(run, output.clone(), Utc::now()).await;
                ModuleOutcome {
                    module: AlgoModule::Revision,
                    status: RunStatus::Success,
                    detail: output,
                }
            }
            Err(e) => {
                let _ = self
                    .run_logger
                    .failure(run, &e.to_string(), Utc::now())
                    .await;
                failed_outcome(AlgoModule::Revision, &e.to_string())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn revision_updates(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        version: ModuleVersion,
        mastery_deltas: &HashMap<i64, (f64, f64)>,
        frozen: bool,
        now: DateTime<Utc>,
        provenance: Provenance,
    ) -> Result<usize> {
        let suppress = frozen || version == ModuleVersion::Shadow;
        let weights = if version != ModuleVersion::V0 {
            let review_count = self
                .state
                .review_log_count(session.user_id)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            if review_count >= PERSONALIZATION_MIN_REVIEWS {
                self.state
                    .fsrs_weights(session.user_id)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?
            } else {
                None
            }
        } else {
            None
        };

        let mut updated = 0usize;
        for attempt in attempts {
            let Some(concept_id) = attempt.concept_id else {
                continue;
            };
            let occurred_at = attempt.answered_at.unwrap_or(now);
            let previous = self
                .state
                .get_revision_state(session.user_id, concept_id)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;

            let record = match version {
                ModuleVersion::V0 => {
                    let post_mastery = mastery_deltas
                        .get(&attempt.theme_id)
                        .map(|(_, post)| *post)
                        .unwrap_or(0.0);
                    update_revision_v0(
                        previous.as_ref(),
                        session.user_id,
                        attempt.theme_id,
                        concept_id,
                        MasteryBand::from_score(post_mastery),
                        attempt.is_correct,
                        occurred_at,
                        provenance,
                    )
                }
                ModuleVersion::V1 | ModuleVersion::Shadow => {
                    let rating = map_attempt_to_rating(
                        attempt.is_correct,
                        attempt.time_spent_ms,
                        Some(attempt.change_count),
                        attempt.marked_for_review,
                    );
                    let delta_days = previous
                        .as_ref()
                        .map(|p| {
                            (occurred_at - p.last_review_at).num_seconds().max(0) as f64
                                / 86_400.0
                        })
                        .unwrap_or(0.0);
                    let current = previous
                        .as_ref()
                        .and_then(|p| p.stability.zip(p.difficulty));
                    let outcome = update_fsrs(
                        current,
                        rating,
                        delta_days,
                        weights.as_deref(),
                        occurred_at,
                    )?;

                    if !suppress {
                        self.state
                            .append_review_log(
                                session.user_id,
                                concept_id,
                                rating.as_i32(),
                                attempt.is_correct,
                                delta_days,
                                occurred_at,
                            )
                            .await
                            .map_err(|e| EngineError::Transient(e.to_string()))?;
                    }

                    RevisionRecord {
                        user_id: session.user_id,
                        theme_id: attempt.theme_id,
                        concept_id,
                        due_at: outcome.due_at,
                        last_review_at: occurred_at,
                        model: ModelKind::V1,
                        stability: Some(outcome.stability),
                        difficulty: Some(outcome.difficulty),
                        retrievability: Some(outcome.retrievability),
                        interval_days: Some(outcome.interval_days),
                        stage: None,
                        provenance,
                    }
                }
            };

            if !suppress {
                self.state
                    .upsert_revision(&record)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
            }
            updated += 1;
        }
        Ok(updated)
    }

    // ========================================================================
    // Elo
    // ========================================================================

    async fn run_elo(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        version: ModuleVersion,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> ModuleOutcome {
        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Difficulty)
            .await
            .unwrap_or(None);
        let run = match self
            .run_logger
            .start(
                AlgoKey::Difficulty,
                resolved
                    .as_ref()
                    .map(|(v, p)| (Some(v.id), Some(p.id)))
                    .unwrap_or((None, None)),
                Some(session.user_id),
                Some(session.id),
                "session_submit",
                json!({"attempts": attempts.len(), "version": version.as_str()}),
                now,
            )
            .await
        {
            Ok(run) => run,
            Err(e) => return failed_outcome(AlgoModule::Difficulty, &e.to_string()),
        };

        let params = resolved
            .as_ref()
            .map(|(_, p)| EloParams::from_value(&p.params))
            .unwrap_or_default();
        let suppress = frozen || version == ModuleVersion::Shadow;

        let result = self
            .elo_updates(session, attempts, &params, suppress, now)
            .await;
        match result {
            Ok((applied, duplicates)) => {
                let output = json!({
                    "attempts_applied": applied,
                    "duplicates": duplicates,
                    "frozen": frozen,
                    "shadow": version == ModuleVersion::Shadow,
                });
                let _ = self.run_logger.success(run, output.clone(), Utc::now()).await;
                ModuleOutcome {
                    module: AlgoModule::Difficulty,
                    status: RunStatus::Success,
                    detail: output,
                }
            }
            Err(e) => {
                let _ = self
                    .run_logger
                    .failure(run, &e.to_string(), Utc::now())
                    .await;
                failed_outcome(AlgoModule::Difficulty, &e.to_string())
            }
        }
    }

    async fn elo_updates(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        params: &EloParams,
        suppress: bool,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let mut applied = 0usize;
        let mut duplicates = 0usize;
        if suppress {
            return Ok((0, 0));
        }

        for attempt in attempts {
            // Idempotent by attempt id: later writers observe the claim.
            let claimed = self
                .state
                .try_claim_attempt(attempt.attempt_id)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            if !claimed {
                duplicates += 1;
                continue;
            }

            let user_rating = self
                .state
                .get_user_rating(session.user_id)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?
                .unwrap_or_else(|| elo::default_user_rating(session.user_id, params));
            let item_rating = self
                .state
                .get_item_ratings(&[attempt.item_id])
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?
                .remove(&attempt.item_id)
                .unwrap_or_else(|| elo::default_item_rating(attempt.item_id, params));

            let (new_user, new_item, _) =
                elo::apply_update(&user_rating, &item_rating, attempt.is_correct, now, params)?;
            self.state
                .upsert_rating(&new_user)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            self.state
                .upsert_rating(&new_item)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            applied += 1;
        }
        Ok((applied, duplicates))
    }

    // ========================================================================
    // Bandit
    // ========================================================================

    async fn run_bandit(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        version: ModuleVersion,
        mastery_deltas: &HashMap<i64, (f64, f64)>,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> ModuleOutcome {
        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Adaptive)
            .await
            .unwrap_or(None);
        let run = match self
            .run_logger
            .start(
                AlgoKey::Adaptive,
                resolved
                    .as_ref()
                    .map(|(v, p)| (Some(v.id), Some(p.id)))
                    .unwrap_or((None, None)),
                Some(session.user_id),
                Some(session.id),
                "session_submit",
                json!({"themes": mastery_deltas.len(), "version": version.as_str()}),
                now,
            )
            .await
        {
            Ok(run) => run,
            Err(e) => return failed_outcome(AlgoModule::Adaptive, &e.to_string()),
        };

        let params = resolved
            .as_ref()
            .map(|(_, p)| BanditParams::from_value(&p.params))
            .unwrap_or_default();
        let suppress = frozen || version == ModuleVersion::Shadow;

        let result = self
            .bandit_updates(session, attempts, &params, mastery_deltas, suppress, now)
            .await;
        match result {
            Ok(themes_updated) => {
                let output = json!({
                    "themes_updated": themes_updated,
                    "frozen": frozen,
                    "shadow": version == ModuleVersion::Shadow,
                });
                let _ = self.run_logger.success(run, output.clone(), Utc::now()).await;
                ModuleOutcome {
                    module: AlgoModule::Adaptive,
                    status: RunStatus::Success,
                    detail: output,
                }
            }
            Err(e) => {
                let _ = self
                    .run_logger
                    .failure(run, &e.to_string(), Utc::now())
                    .await;
                failed_outcome(AlgoModule::Adaptive, &e.to_string())
            }
        }
    }

    async fn bandit_updates(
        &self,
        session: &Session,
        attempts: &[SessionAttempt],
        params: &BanditParams,
        mastery_deltas: &HashMap<i64, (f64, f64)>,
        suppress: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if suppress {
            return Ok(0);
        }

        let by_theme = group_by_theme(attempts);
        let theme_ids: Vec<i64> = by_theme.keys().copied().collect();
        let mut states = self
            .state
            .get_bandit_states(session.user_id, &theme_ids)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let mut updated = 0usize;
        for (&theme_id, theme_attempts) in &by_theme {
            if (theme_attempts.len() as i64) < params.reward_min_attempts {
                continue;
            }
            let Some(&(pre, post)) = mastery_deltas.get(&theme_id) else {
                continue;
            };
            let reward = bandit::compute_mastery_delta_reward(pre, post);

            let mut arm = states
                .remove(&theme_id)
                .unwrap_or_else(|| bandit::new_arm(session.user_id, theme_id, params));
            bandit::apply_reward(&mut arm, reward, now);
            self.state
                .upsert_bandit_state(&arm)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            updated += 1;
        }
        Ok(updated)
    }

    // ========================================================================
    // Recompute jobs
    // ========================================================================

    /// Admin-triggered mastery recompute (v0 history scan) for one learner.
    pub async fn recompute_mastery_for_user(
        &self,
        user_id: Uuid,
        theme_filter: Option<&[i64]>,
        trigger: &str,
    ) -> Result<Value> {
        let now = Utc::now();
        if self.runtime.is_frozen_live().await? {
            return Ok(json!({"skipped": "freeze_updates"}));
        }

        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Mastery)
            .await
            .unwrap_or(None);
        let params_value = resolved
            .as_ref()
            .map(|(_, p)| p.params.clone())
            .unwrap_or(Value::Null);
        let params = MasteryV0Params::from_value(&params_value);

        let run = self
            .run_logger
            .start(
                AlgoKey::Mastery,
                resolved
                    .as_ref()
                    .map(|(v, p)| (Some(v.id), Some(p.id)))
                    .unwrap_or((None, None)),
                Some(user_id),
                None,
                trigger,
                json!({"theme_filter": theme_filter, "lookback_days": params.lookback_days}),
                now,
            )
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let provenance = provenance_for(&resolved, run.id);

        let result: Result<usize> = async {
            let triples = self
                .sessions
                .attempted_triples(user_id, params.lookback_days, now)
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;

            let mut upserted = 0usize;
            for triple in triples {
                if let Some(filter) = theme_filter {
                    if !filter.contains(&triple.theme_id) {
                        continue;
                    }
                }
                let samples = self
                    .sessions
                    .collect_theme_attempts(user_id, triple.theme_id, params.lookback_days, now)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
                let computed = compute_mastery_v0(&samples, &params, now);
                let record = MasteryRecord {
                    user_id,
                    year: triple.year,
                    block_id: triple.block_id,
                    theme_id: triple.theme_id,
                    attempts_total: computed.attempts_total,
                    correct_total: computed.correct_total,
                    accuracy_pct: computed.accuracy_pct,
                    mastery_score: computed.mastery_score,
                    mastery_model: ModelKind::V0,
                    last_attempt_at: computed.last_attempt_at,
                    breakdown: computed.breakdown,
                    provenance,
                };
                self.state
                    .upsert_mastery(&record)
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
                upserted += 1;
            }
            Ok(upserted)
        }
        .await;

        match result {
            Ok(upserted) => {
                let output = json!({"themes_computed": upserted});
                let _ = self.run_logger.success(run, output.clone(), Utc::now()).await;
                Ok(output)
            }
            Err(e) => {
                let _ = self
                    .run_logger
                    .failure(run, &e.to_string(), Utc::now())
                    .await;
                Err(e)
            }
        }
    }

    /// Periodic Elo recenter. Holds the (job_kind, scope) advisory lock and
    /// shifts nothing unless |mean(item ratings)| exceeds the threshold.
    pub async fn recenter_item_ratings(&self, trigger: &str) -> Result<Value> {
        let now = Utc::now();
        if self.runtime.is_frozen_live().await? {
            return Ok(json!({"skipped": "freeze_updates"}));
        }

        let acquired = self
            .state
            .try_acquire_job_lock("elo_recenter", "global")
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        if !acquired {
            return Ok(json!({"skipped": "already_running"}));
        }

        let result = self.recenter_inner(trigger, now).await;
        let _ = self.state.release_job_lock("elo_recenter", "global").await;
        result
    }

    async fn recenter_inner(&self, trigger: &str, now: DateTime<Utc>) -> Result<Value> {
        let resolved = self
            .run_logger
            .resolve_active(AlgoKey::Difficulty)
            .await
            .unwrap_or(None);
        let params = resolved
            .as_ref()
            .map(|(_, p)| EloParams::from_value(&p.params))
            .unwrap_or_default();

        let run = self
            .run_logger
            .start(
                AlgoKey::Difficulty,
                resolved
                    .as_ref()
                    .map(|(v, p)| (Some(v.id), Some(p.id)))
                    .unwrap_or((None, None)),
                None,
                None,
                trigger,
                json!({"job": "recenter"}),
                now,
            )
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let result: Result<Value> = async {
            let mut items = self
                .state
                .all_item_ratings()
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            let mut users = self
                .state
                .all_user_ratings()
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;

            let shift = elo::recenter(&mut items, &mut users, &params)?;
            if let Some(shift) = shift {
                for rating in items.iter().chain(users.iter()) {
                    self.state
                        .upsert_rating(rating)
                        .await
                        .map_err(|e| EngineError::Transient(e.to_string()))?;
                }
                Ok(json!({
                    "shift": shift,
                    "items": items.len(),
                    "users": users.len(),
                }))
            } else {
                Ok(json!({"shift": 0.0, "skipped": "below_threshold"}))
            }
        }
        .await;

        match result {
            Ok(output) => {
                let _ = self.run_logger.success(run, output.clone(), Utc::now()).await;
                Ok(output)
            }
            Err(e) => {
                let _ = self
                    .run_logger
                    .failure(run, &e.to_string(), Utc::now())
                    .await;
                Err(e)
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn group_by_theme(attempts: &[SessionAttempt]) -> BTreeMap<i64, Vec<&SessionAttempt>> {
    let mut by_theme: BTreeMap<i64, Vec<&SessionAttempt>> = BTreeMap::new();
    for attempt in attempts {
        by_theme.entry(attempt.theme_id).or_default().push(attempt);
    }
    by_theme
}

fn failed_outcome(module: AlgoModule, error: &str) -> ModuleOutcome {
    tracing::error!(module = module.as_str(), error, "pipeline module failed");
    ModuleOutcome {
        module,
        status: RunStatus::Failed,
        detail: json!({"error": error}),
    }
}

// ============================================================================
// TESTS
// ============================================================================

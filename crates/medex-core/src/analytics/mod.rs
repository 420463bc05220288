/// Aggregated read-side views over the knowledge state.
///
/// Read-only: no freeze interaction, no writes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{EngineError, Result};
use crate::mastery::MasteryBand;
use crate::ports::StateRepository;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeAnalytics {
    pub theme_id: i64,
    pub block_id: i64,
    pub mastery_score: f64,
    pub band: MasteryBand,
    pub accuracy_pct: f64,
    pub attempts_total: i64,
    pub due_concepts: usize,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerOverview {
    pub themes_tracked: usize,
    pub attempts_total: i64,
    pub correct_total: i64,
    pub accuracy_pct: f64,
    pub mean_mastery: f64,
    pub weak_theme_count: usize,
    pub due_concepts: usize,
    pub rating: Option<f64>,
    pub rating_percentile: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAnalytics {
    pub block_id: i64,
    pub themes: Vec<ThemeAnalytics>,
    pub mean_mastery: f64,
}

pub struct AnalyticsService {
    state: Arc<dyn StateRepository>,
}

impl AnalyticsService {
    pub fn new(state: Arc<dyn StateRepository>) -> Self {
        Self { state }
    }

    pub async fn overview(&self, user_id: Uuid) -> Result<LearnerOverview> {
        let now = Utc::now();
        let mastery = self
            .state
            .get_mastery(user_id, &[])
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let due = self
            .state
            .due_concepts_by_theme(user_id, &[], now)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let attempts_total: i64 = mastery.iter().map(|m| m.attempts_total).sum();
        let correct_total: i64 = mastery.iter().map(|m| m.correct_total).sum();
        let mean_mastery = if mastery.is_empty() {
            0.0
        } else {
            mastery.iter().map(|m| m.mastery_score).sum::<f64>() / mastery.len() as f64
        };
        let weak_theme_count = mastery
            .iter()
            .filter(|m| MasteryBand::from_score(m.mastery_score) == MasteryBand::Weak)
            .count();

        let rating = self
            .state
            .get_user_rating(user_id)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let rating_percentile = match &rating {
            Some(own) => {
                let all = self
                    .state
                    .all_user_ratings()
                    .await
                    .map_err(|e| EngineError::Transient(e.to_string()))?;
                percentile(own.rating, &all.iter().map(|r| r.rating).collect::<Vec<_>>())
            }
            None => None,
        };

        Ok(LearnerOverview {
            themes_tracked: mastery.len(),
            attempts_total,
            correct_total,
            accuracy_pct: if attempts_total > 0 {
                (correct_total as f64 / attempts_total as f64 * 10_000.0).round() / 100.0
            } else {
                0.0
            },
            mean_mastery,
            weak_theme_count,
            due_concepts: due.values().map(|c| c.len()).sum(),
            rating: rating.map(|r| r.rating),
            rating_percentile,
        })
    }

    pub async fn block(&self, user_id: Uuid, block_id: i64) -> Result<BlockAnalytics> {
        let themes = self.themes_for(user_id, |m| m.block_id == block_id).await?;
        let mean_mastery = if themes.is_empty() {
            0.0
        } else {
            themes.iter().map(|t| t.mastery_score).sum::<f64>() / themes.len() as f64
        };
        Ok(BlockAnalytics {
            block_id,
            themes,
            mean_mastery,
        })
    }

    pub async fn theme(&self, user_id: Uuid, theme_id: i64) -> Result<Option<ThemeAnalytics>> {
        let mut themes = self.themes_for(user_id, |m| m.theme_id == theme_id).await?;
        Ok(themes.pop())
    }

    async fn themes_for(
        &self,
        user_id: Uuid,
        keep: impl Fn(&crate::domain::MasteryRecord) -> bool,
    ) -> Result<Vec<ThemeAnalytics>> {
        let now = Utc::now();
        let mastery = self
            .state
            .get_mastery(user_id, &[])
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let due = self
            .state
            .due_concepts_by_theme(user_id, &[], now)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        Ok(mastery
            .into_iter()
            .filter(|m| keep(m))
            .map(|m| ThemeAnalytics {
                theme_id: m.theme_id,
                block_id: m.block_id,
                mastery_score: m.mastery_score,
                band: MasteryBand::from_score(m.mastery_score),
                accuracy_pct: m.accuracy_pct,
                attempts_total: m.attempts_total,
                due_concepts: due.get(&m.theme_id).map(|c| c.len()).unwrap_or(0),
                last_attempt_at: m.last_attempt_at,
            })
            .collect())
    }
}

fn percentile(own: f64, all: &[f64]) -> Option<f64> {
    if all.is_empty() {
        return None;
    }
    let below = all.iter().filter(|&&r| r < own).count();
    Some((below as f64 / all.len() as f64 * 10_000.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MasteryRecord, ModelKind, Provenance};
    use crate::ports::MockStateRepository;
    use std::collections::HashMap;

    fn mastery(theme_id: i64, block_id: i64, score: f64) -> MasteryRecord {
        MasteryRecord {
            user_id: Uuid::nil(),
            year: 1,
            block_id,
            theme_id,
            attempts_total: 10,
            correct_total: 7,
            accuracy_pct: 70.0,
            mastery_score: score,
            mastery_model: ModelKind::V0,
            last_attempt_at: None,
            breakdown: serde_json::Value::Null,
            provenance: Provenance::default(),
        }
    }

    #[tokio::test]
    async fn test_overview_aggregates() {
        let mut state = MockStateRepository::new();
        state.expect_get_mastery().returning(|_, _| {
            Ok(vec![mastery(1, 1, 0.2), mastery(2, 1, 0.8), mastery(3, 2, 0.5)])
        });
        state.expect_due_concepts_by_theme().returning(|_, _, _| {
            let mut due = HashMap::new();
            due.insert(1i64, vec![100, 101]);
            Ok(due)
        });
        state.expect_get_user_rating().returning(|_| Ok(None));

        let service = AnalyticsService::new(Arc::new(state));
        let overview = service.overview(Uuid::new_v4()).await.unwrap();
        assert_eq!(overview.themes_tracked, 3);
        assert_eq!(overview.attempts_total, 30);
        assert_eq!(overview.weak_theme_count, 1);
        assert_eq!(overview.due_concepts, 2);
        assert!((overview.mean_mastery - 0.5).abs() < 1e-9);
        assert_eq!(overview.rating, None);
    }

    #[tokio::test]
    async fn test_block_filters_themes() {
        let mut state = MockStateRepository::new();
        state.expect_get_mastery().returning(|_, _| {
            Ok(vec![mastery(1, 1, 0.2), mastery(2, 1, 0.6), mastery(3, 2, 0.9)])
        });
        state
            .expect_due_concepts_by_theme()
            .returning(|_, _, _| Ok(HashMap::new()));

        let service = AnalyticsService::new(Arc::new(state));
        let block = service.block(Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(block.themes.len(), 2);
        assert!((block.mean_mastery - 0.4).abs() < 1e-9);
        assert_eq!(block.themes[0].band, MasteryBand::Weak);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(5.0, &[1.0, 2.0, 5.0, 10.0]), Some(50.0));
        assert_eq!(percentile(0.0, &[]), None);
    }
}

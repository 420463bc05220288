use crate::domain::{CognitiveLevel, FrozenItem, ItemDifficulty, PublishedItem};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Filter over the published-items view, as supplied at session creation.
#[derive(Debug, Clone, Default)]
pub struct PublishedItemFilter {
    pub year: i32,
    pub block_ids: Vec<i64>,
    pub theme_ids: Option<Vec<i64>>,
    pub difficulty: Option<Vec<ItemDifficulty>>,
    pub cognitive: Option<Vec<CognitiveLevel>>,
}

/// Candidate theme row with its syllabus placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeInfo {
    pub theme_id: i64,
    pub block_id: i64,
    pub title: String,
}

/// Read-only view of published question content plus the append-only item
/// version log written at freeze time.
///
/// The CMS that authors and publishes items is an external collaborator;
/// this port is the engine's entire contract with it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// List published items matching the filter.
    async fn list_published(
        &self,
        filter: &PublishedItemFilter,
    ) -> anyhow::Result<Vec<PublishedItem>>;

    /// Fetch a single published item.
    async fn get_published(&self, item_id: Uuid) -> anyhow::Result<Option<PublishedItem>>;

    /// Append a version snapshot for an item and return the version number.
    async fn record_item_version(
        &self,
        item_id: Uuid,
        snapshot: &FrozenItem,
    ) -> anyhow::Result<i64>;

    /// Candidate themes for a (year, blocks) scope, optionally restricted to
    /// an explicit theme filter.
    async fn candidate_themes<'a>(
        &self,
        year: i32,
        block_ids: &[i64],
        theme_filter: Option<&'a [i64]>,
        limit: i64,
    ) -> anyhow::Result<Vec<ThemeInfo>>;

    /// Published-item counts per theme, excluding the given item ids.
    async fn theme_supply(
        &self,
        year: i32,
        theme_ids: &[i64],
        excluded: &[Uuid],
    ) -> anyhow::Result<HashMap<i64, i64>>;

    /// Published items of one theme, excluding the given item ids.
    async fn items_for_theme(
        &self,
        year: i32,
        theme_id: i64,
        excluded: &[Uuid],
        limit: i64,
    ) -> anyhow::Result<Vec<PublishedItem>>;
}

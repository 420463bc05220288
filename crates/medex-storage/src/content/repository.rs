use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, FromRow, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use medex_core::domain::{CognitiveLevel, FrozenItem, ItemDifficulty, PublishedItem};
use medex_core::ports::{ContentRepository, PublishedItemFilter, ThemeInfo};

use crate::convert::{parse_uuid, placeholders, to_millis};

#[derive(Debug, FromRow)]
struct ItemRow {
    id: String,
    year: i32,
    block_id: i64,
    theme_id: i64,
    concept_id: Option<i64>,
    stem: String,
    options_json: String,
    correct_index: i32,
    explanation: Option<String>,
    difficulty: String,
    cognitive_level: String,
}

impl ItemRow {
    fn into_domain(self) -> anyhow::Result<PublishedItem> {
        Ok(PublishedItem {
            id: parse_uuid(&self.id)?,
            year: self.year,
            block_id: self.block_id,
            theme_id: self.theme_id,
            concept_id: self.concept_id,
            stem: self.stem,
            options: serde_json::from_str(&self.options_json)?,
            correct_index: self.correct_index,
            explanation: self.explanation,
            difficulty: ItemDifficulty::parse(&self.difficulty)
                .ok_or_else(|| anyhow::anyhow!("unknown difficulty {:?}", self.difficulty))?,
            cognitive_level: CognitiveLevel::parse(&self.cognitive_level)
                .ok_or_else(|| {
                    anyhow::anyhow!("unknown cognitive level {:?}", self.cognitive_level)
                })?,
        })
    }
}

const ITEM_COLUMNS: &str = "id, year, block_id, theme_id, concept_id, stem, options_json, \
     correct_index, explanation, difficulty, cognitive_level";

pub struct SqliteContentRepository {
    pool: SqlitePool,
}

impl SqliteContentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Seed one published item into the view. The CMS that authors items is
    /// external; this entry point exists for imports and tests.
    pub async fn insert_published(&self, item: &PublishedItem) -> anyhow::Result<()> {
        item.validate()?;
        query(
            "INSERT INTO items
             (id, year, block_id, theme_id, concept_id, stem, options_json,
              correct_index, explanation, difficulty, cognitive_level, is_published)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT(id) DO UPDATE SET
                year = excluded.year,
                block_id = excluded.block_id,
                theme_id = excluded.theme_id,
                concept_id = excluded.concept_id,
                stem = excluded.stem,
                options_json = excluded.options_json,
                correct_index = excluded.correct_index,
                explanation = excluded.explanation,
                difficulty = excluded.difficulty,
                cognitive_level = excluded.cognitive_level",
        )
        .bind(item.id.to_string())
        .bind(item.year)
        .bind(item.block_id)
        .bind(item.theme_id)
        .bind(item.concept_id)
        .bind(&item.stem)
        .bind(serde_json::to_string(&item.options)?)
        .bind(item.correct_index)
        .bind(&item.explanation)
        .bind(item.difficulty.as_str())
        .bind(item.cognitive_level.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContentRepository for SqliteContentRepository {
    async fn list_published(
        &self,
        filter: &PublishedItemFilter,
    ) -> anyhow::Result<Vec<PublishedItem>> {
        let mut sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE is_published = 1 AND year = ?"
        );
        if !filter.block_ids.is_empty() {
            sql.push_str(&format!(
                " AND block_id IN ({})",
                placeholders(filter.block_ids.len())
            ));
        }
        if let Some(themes) = &filter.theme_ids {
            sql.push_str(&format!(" AND theme_id IN ({})", placeholders(themes.len())));
        }
        if let Some(difficulty) = &filter.difficulty {
            sql.push_str(&format!(
                " AND difficulty IN ({})",
                placeholders(difficulty.len())
            ));
        }
        if let Some(cognitive) = &filter.cognitive {
            sql.push_str(&format!(
                " AND cognitive_level IN ({})",
                placeholders(cognitive.len())
            ));
        }
        sql.push_str(" ORDER BY id");

        let mut q = query_as::<_, ItemRow>(&sql).bind(filter.year);
        for block_id in &filter.block_ids {
            q = q.bind(block_id);
        }
        if let Some(themes) = &filter.theme_ids {
            for theme_id in themes {
                q = q.bind(theme_id);
            }
        }
        if let Some(difficulty) = &filter.difficulty {
            for d in difficulty {
                q = q.bind(d.as_str());
            }
        }
        if let Some(cognitive) = &filter.cognitive {
            for c in cognitive {
                q = q.bind(c.as_str());
            }
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(ItemRow::into_domain).collect()
    }

    async fn get_published(&self, item_id: Uuid) -> anyhow::Result<Option<PublishedItem>> {
        let row = query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = ? AND is_published = 1"
        ))
        .bind(item_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ItemRow::into_domain).transpose()
    }

    async fn record_item_version(
        &self,
        item_id: Uuid,
        snapshot: &FrozenItem,
    ) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await?;
        let (next_version,): (i64,) = query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM item_versions WHERE item_id = ?",
        )
        .bind(item_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        query(
            "INSERT INTO item_versions (item_id, version, snapshot_json, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(item_id.to_string())
        .bind(next_version)
        .bind(serde_json::to_string(snapshot)?)
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(next_version)
    }

    async fn candidate_themes<'a>(
        &self,
        year: i32,
        block_ids: &[i64],
        theme_filter: Option<&'a [i64]>,
        limit: i64,
    ) -> anyhow::Result<Vec<ThemeInfo>> {
        let mut sql = String::from(
            "SELECT DISTINCT theme_id, block_id FROM items WHERE is_published = 1 AND year = ?",
        );
        if !block_ids.is_empty() {
            sql.push_str(&format!(" AND block_id IN ({})", placeholders(block_ids.len())));
        }
        if let Some(themes) = theme_filter {
            if !themes.is_empty() {
                sql.push_str(&format!(" AND theme_id IN ({})", placeholders(themes.len())));
            }
        }
        sql.push_str(" ORDER BY theme_id LIMIT ?");

        let mut q = query_as::<_, (i64, i64)>(&sql).bind(year);
        for block_id in block_ids {
            q = q.bind(block_id);
        }
        if let Some(themes) = theme_filter {
            for theme_id in themes {
                q = q.bind(theme_id);
            }
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(theme_id, block_id)| ThemeInfo {
                theme_id,
                block_id,
                title: format!("theme-{theme_id}"),
            })
            .collect())
    }

    async fn theme_supply(
        &self,
        year: i32,
        theme_ids: &[i64],
        excluded: &[Uuid],
    ) -> anyhow::Result<HashMap<i64, i64>> {
        if theme_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut sql = format!(
            "SELECT theme_id, COUNT(*) FROM items
             WHERE is_published = 1 AND year = ? AND theme_id IN ({})",
            placeholders(theme_ids.len())
        );
        if !excluded.is_empty() {
            sql.push_str(&format!(" AND id NOT IN ({})", placeholders(excluded.len())));
        }
        sql.push_str(" GROUP BY theme_id");

        let mut q = query_as::<_, (i64, i64)>(&sql).bind(year);
        for theme_id in theme_ids {
            q = q.bind(theme_id);
        }
        for item_id in excluded {
            q = q.bind(item_id.to_string());
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    async fn items_for_theme(
        &self,
        year: i32,
        theme_id: i64,
        excluded: &[Uuid],
        limit: i64,
    ) -> anyhow::Result<Vec<PublishedItem>> {
        let mut sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE is_published = 1 AND year = ? AND theme_id = ?"
        );
        if !excluded.is_empty() {
            sql.push_str(&format!(" AND id NOT IN ({})", placeholders(excluded.len())));
        }
        sql.push_str(" ORDER BY id LIMIT ?");

        let mut q = query_as::<_, ItemRow>(&sql).bind(year).bind(theme_id);
        for item_id in excluded {
            q = q.bind(item_id.to_string());
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(ItemRow::into_domain).collect()
    }
}

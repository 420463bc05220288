//! Demo content seeding for development databases.

use anyhow::Result;
use uuid::Uuid;

use medex_api::AppState;
use medex_core::domain::{CognitiveLevel, ItemDifficulty, PublishedItem};

const DEMO_THEMES: [(i64, i64); 6] = [
    // (block_id, theme_id)
    (1, 101),
    (1, 102),
    (1, 103),
    (2, 201),
    (2, 202),
    (2, 203),
];

/// Insert a year-1 demo bank across six themes. Returns the item count.
pub async fn seed_demo_bank(app: &AppState, per_theme: usize) -> Result<usize> {
    let difficulties = [
        ItemDifficulty::Easy,
        ItemDifficulty::Medium,
        ItemDifficulty::Hard,
    ];
    let levels = [
        CognitiveLevel::Recall,
        CognitiveLevel::Application,
        CognitiveLevel::Analysis,
    ];

    let mut seeded = 0usize;
    for (block_id, theme_id) in DEMO_THEMES {
        for index in 0..per_theme {
            let item = PublishedItem {
                id: Uuid::new_v4(),
                year: 1,
                block_id,
                theme_id,
                concept_id: Some(theme_id * 10 + (index % 5) as i64),
                stem: format!("Demo question {index} for theme {theme_id}"),
                options: (0..5).map(|i| format!("Option {i}")).collect(),
                correct_index: (index % 5) as i32,
                explanation: Some(format!(
                    "Option {} is correct in this demo item.",
                    index % 5
                )),
                difficulty: difficulties[index % difficulties.len()],
                cognitive_level: levels[index % levels.len()],
            };
            app.content_repo.insert_published(&item).await?;
            seeded += 1;
        }
    }

    tracing::info!(seeded, "demo bank ready");
    Ok(seeded)
}

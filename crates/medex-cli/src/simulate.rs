//! End-to-end session simulation against a live database.
//!
//! Creates a session, answers every question with a configurable accuracy,
//! submits, and prints the score plus the resulting analytics overview.

use anyhow::Result;
use rand::Rng;

use medex_api::types::{AnswerDto, CreateSessionDto};
use medex_api::AppState;
use medex_core::domain::{Actor, FrozenItem};

pub async fn run_session(
    app: &AppState,
    learner: Actor,
    request: CreateSessionDto,
    accuracy: f64,
) -> Result<()> {
    let state = app.create_session(learner, request).await?;
    let session_id = state.session.id;
    println!(
        "session {session_id}: {} questions",
        state.session.total_questions
    );

    let mut rng = rand::thread_rng();
    for view in &state.items {
        let correct_index = frozen_correct_index(app, session_id, view.position).await?;
        let selected = if rng.gen_bool(accuracy.clamp(0.0, 1.0)) {
            correct_index
        } else {
            // A wrong option, uniformly
            let mut pick = rng.gen_range(0..4);
            if pick >= correct_index {
                pick += 1;
            }
            pick
        };

        let response = app
            .submit_answer(
                learner,
                session_id,
                AnswerDto {
                    question_id: view.item_id,
                    selected_index: Some(selected),
                    marked_for_review: None,
                },
            )
            .await?;
        println!(
            "  answered position {} -> selected {selected} ({} answered)",
            view.position, response.progress.answered_count
        );
    }

    let summary = app.submit_session(learner, session_id).await?;
    println!(
        "submitted: {}/{} ({}%)",
        summary.score_correct.unwrap_or(0),
        summary.score_total.unwrap_or(0),
        summary.score_pct.unwrap_or(0.0)
    );

    let overview = app.analytics_overview(learner).await?;
    println!("{}", serde_json::to_string_pretty(&overview)?);
    Ok(())
}

/// The learner view hides the key; the simulator reads the frozen snapshot
/// directly to hit the requested accuracy.
async fn frozen_correct_index(
    app: &AppState,
    session_id: uuid::Uuid,
    position: i32,
) -> Result<i32> {
    let (snapshot_json,): (String,) = sqlx::query_as(
        "SELECT snapshot_json FROM session_items WHERE session_id = ? AND position = ?",
    )
    .bind(session_id.to_string())
    .bind(position)
    .fetch_one(&app.pool)
    .await?;
    let frozen: FrozenItem = serde_json::from_str(&snapshot_json)?;
    Ok(frozen.correct_index)
}

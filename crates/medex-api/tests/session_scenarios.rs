//! End-to-end scenarios over the full facade: SQLite storage, real services,
//! real pipeline.

use serde_json::json;
use uuid::Uuid;

use medex_api::types::{
    AnswerDto, ApprovalDecisionDto, ApprovalRequestDto, AttemptEventDto, CreateSessionDto,
    FreezeDto, SwitchProfileDto,
};
use medex_api::AppState;
use medex_core::domain::{
    Actor, CognitiveLevel, ItemDifficulty, PublishedItem, SessionStatus,
};
use medex_core::ports::{RuntimeRepository, StateRepository};

async fn engine() -> AppState {
    AppState::connect("sqlite::memory:", false, false)
        .await
        .expect("engine init")
}

async fn production_engine() -> AppState {
    AppState::connect("sqlite::memory:", true, false)
        .await
        .expect("engine init")
}

fn item(year: i32, block_id: i64, theme_id: i64, correct_index: i32) -> PublishedItem {
    PublishedItem {
        id: Uuid::new_v4(),
        year,
        block_id,
        theme_id,
        concept_id: Some(theme_id * 100),
        stem: "Which of the following is most likely?".to_string(),
        options: vec!["A", "B", "C", "D", "E"].into_iter().map(String::from).collect(),
        correct_index,
        explanation: Some("See the relevant guideline.".to_string()),
        difficulty: ItemDifficulty::Medium,
        cognitive_level: CognitiveLevel::Recall,
    }
}

/// Seed a bank of year-1 items over two themes with correct_index = 2.
async fn seed_bank(app: &AppState, per_theme: usize) {
    for theme_id in [10i64, 11] {
        for _ in 0..per_theme {
            app.content_repo
                .insert_published(&item(1, 1, theme_id, 2))
                .await
                .unwrap();
        }
    }
}

fn tutor_request(count: usize) -> CreateSessionDto {
    CreateSessionDto {
        mode: "TUTOR".to_string(),
        year: 1,
        blocks: vec![1],
        themes: None,
        count,
        duration_seconds: None,
        difficulty: None,
        cognitive: None,
    }
}

// ============================================================================
// S1: create + immediate re-read
// ============================================================================

#[tokio::test]
async fn s1_create_session_and_reread() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    assert_eq!(state.session.status, SessionStatus::Active);
    assert_eq!(state.session.total_questions, 5);
    assert_eq!(state.items.len(), 5);
    assert_eq!(state.progress.answered_count, 0);
    assert_eq!(state.progress.current_position, 1);
    // Learner-facing items carry no answer key
    assert_eq!(state.items[0].options.len(), 5);

    let reread = app.get_session(learner, state.session.id).await.unwrap();
    assert_eq!(reread.session.status, SessionStatus::Active);
    assert_eq!(reread.progress.answered_count, 0);
    assert_eq!(reread.progress.current_position, 1);
    assert_eq!(
        reread.items.iter().map(|i| i.item_id).collect::<Vec<_>>(),
        state.items.iter().map(|i| i.item_id).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn s1b_insufficient_supply_fails() {
    let app = engine().await;
    seed_bank(&app, 1).await; // only 2 items total
    let learner = Actor::student(Uuid::new_v4());

    let err = app
        .create_session(learner, tutor_request(10))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_ENOUGH_QUESTIONS");
}

// ============================================================================
// S2: answers graded against frozen content, final score
// ============================================================================

#[tokio::test]
async fn s2_scoring_from_frozen_content() {
    let app = engine().await;
    seed_bank(&app, 10).await; // every correct_index is 2
    let learner = Actor::student(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    let session_id = state.session.id;

    // Position 1 answered correctly, positions 2 and 3 wrong.
    let answers = [(0usize, 2), (1, 0), (2, 1)];
    for (idx, selected) in answers {
        let response = app
            .submit_answer(
                learner,
                session_id,
                AnswerDto {
                    question_id: state.items[idx].item_id,
                    selected_index: Some(selected),
                    marked_for_review: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.selected_index, Some(selected));
    }

    let current = app.get_session(learner, session_id).await.unwrap();
    assert_eq!(current.progress.answered_count, 3);
    assert_eq!(current.progress.current_position, 4);

    let summary = app.submit_session(learner, session_id).await.unwrap();
    assert_eq!(summary.status, SessionStatus::Submitted);
    assert_eq!(summary.score_correct, Some(1));
    assert_eq!(summary.score_total, Some(5));
    assert_eq!(summary.score_pct, Some(20.0));
}

// ============================================================================
// S3: idempotent submit
// ============================================================================

#[tokio::test]
async fn s3_double_submit_is_noop() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    let session_id = state.session.id;

    for item in state.items.iter().take(3) {
        app.submit_answer(
            learner,
            session_id,
            AnswerDto {
                question_id: item.item_id,
                selected_index: Some(2),
                marked_for_review: None,
            },
        )
        .await
        .unwrap();
    }

    let first = app.submit_session(learner, session_id).await.unwrap();
    let second = app.submit_session(learner, session_id).await.unwrap();
    assert_eq!(first.score_correct, Some(3));
    assert_eq!(second.score_correct, Some(3));
    assert_eq!(second.score_pct, first.score_pct);
    assert_eq!(second.status, SessionStatus::Submitted);

    // The fan-out ran once: each answered attempt claimed exactly once.
    let user_rating = app
        .state_repo
        .get_user_rating(learner.user_id)
        .await
        .unwrap()
        .expect("user rating written by first submit");
    assert_eq!(user_rating.n_attempts, 3);

    // Answering after submit is rejected.
    let err = app
        .submit_answer(
            learner,
            session_id,
            AnswerDto {
                question_id: state.items[4].item_id,
                selected_index: Some(2),
                marked_for_review: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

// ============================================================================
// S4: lazy expiry
// ============================================================================

#[tokio::test]
async fn s4_expired_session_rejects_answers() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());

    let mut request = tutor_request(5);
    request.duration_seconds = Some(3600);
    let state = app.create_session(learner, request).await.unwrap();
    let session_id = state.session.id;
    assert!(state.session.expires_at.is_some());

    // Move the deadline into the past.
    sqlx::query("UPDATE sessions SET expires_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp_millis() - 10_000)
        .bind(session_id.to_string())
        .execute(&app.pool)
        .await
        .unwrap();

    let read = app.get_session(learner, session_id).await.unwrap();
    assert_eq!(read.session.status, SessionStatus::Expired);
    assert_eq!(read.session.score_total, Some(5));
    assert_eq!(read.session.score_correct, Some(0));

    let err = app
        .submit_answer(
            learner,
            session_id,
            AnswerDto {
                question_id: state.items[0].item_id,
                selected_index: Some(1),
                marked_for_review: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    // Submit after expiry returns the expired state unchanged.
    let summary = app.submit_session(learner, session_id).await.unwrap();
    assert_eq!(summary.status, SessionStatus::Expired);
}

// ============================================================================
// S5: concurrent answers for the same (session, item)
// ============================================================================

#[tokio::test]
async fn s5_concurrent_answers_one_row() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    let session_id = state.session.id;
    let question_id = state.items[0].item_id;

    let (a, b) = tokio::join!(
        app.submit_answer(
            learner,
            session_id,
            AnswerDto {
                question_id,
                selected_index: Some(1),
                marked_for_review: None,
            },
        ),
        app.submit_answer(
            learner,
            session_id,
            AnswerDto {
                question_id,
                selected_index: Some(2),
                marked_for_review: None,
            },
        ),
    );
    a.unwrap();
    b.unwrap();

    let read = app.get_session(learner, session_id).await.unwrap();
    assert_eq!(read.progress.answered_count, 1);

    // Exactly one row; grading matches the committed selection.
    let rows: Vec<(Option<i32>, Option<i64>)> = sqlx::query_as(
        "SELECT selected_index, is_correct FROM session_answers
         WHERE session_id = ? AND item_id = ?",
    )
    .bind(session_id.to_string())
    .bind(question_id.to_string())
    .fetch_all(&app.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    let (selected, is_correct) = rows[0];
    // Frozen correct_index is 2 for every seeded item
    assert_eq!(is_correct, Some((selected == Some(2)) as i64));
}

// ============================================================================
// S6: kill switch — confirmation, approval gate, two-person flow
// ============================================================================

#[tokio::test]
async fn s6_switch_validation_and_two_person_flow() {
    let app = production_engine().await;
    let admin_one = Actor::admin(Uuid::new_v4());
    let admin_two = Actor::admin(Uuid::new_v4());

    // Empty confirmation phrase
    let err = app
        .switch_profile(
            admin_one,
            SwitchProfileDto {
                profile: "V0_FALLBACK".to_string(),
                overrides: None,
                reason: "latency regression".to_string(),
                confirmation_phrase: Some(String::new()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_CONFIRMATION");

    // Correct phrase, but no approval in production
    let err = app
        .switch_profile(
            admin_one,
            SwitchProfileDto {
                profile: "V0_FALLBACK".to_string(),
                overrides: None,
                reason: "latency regression".to_string(),
                confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "APPROVAL_REQUIRED");

    // Two-person flow: request, then a different admin approves and the
    // switch executes through the approval path.
    let approval = app
        .request_approval(
            admin_one,
            ApprovalRequestDto {
                action_type: "PROFILE_SWITCH_FALLBACK".to_string(),
                payload: Some(json!({"overrides": {}})),
                reason: "latency regression".to_string(),
                confirmation_phrase: "SWITCH TO V0_FALLBACK".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(approval.status, "PENDING");

    // Self-approval rejected
    let err = app
        .approve(
            admin_one,
            ApprovalDecisionDto {
                request_id: approval.request_id,
                confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_AUTHORIZED");

    let decided = app
        .approve(
            admin_two,
            ApprovalDecisionDto {
                request_id: approval.request_id,
                confirmation_phrase: Some("SWITCH TO V0_FALLBACK".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(decided.status, "APPROVED");
    assert_eq!(decided.approver, Some(admin_two.user_id));

    let status = app.runtime_status(admin_one).await.unwrap();
    assert_eq!(status.active_profile, "V0_FALLBACK");

    // A switch event was appended
    let events = app.runtime_repo.list_switch_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "latency regression");

    // Direct calls remain blocked even after approval executed
    let err = app
        .switch_profile(
            admin_one,
            SwitchProfileDto {
                profile: "V1_PRIMARY".to_string(),
                overrides: None,
                reason: "roll forward".to_string(),
                confirmation_phrase: Some("SWITCH TO V1_PRIMARY".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "APPROVAL_REQUIRED");

    // Audit trail captured the whole exchange
    assert_eq!(app.audit.count_action("APPROVAL_REQUESTED"), 1);
    assert_eq!(app.audit.count_action("APPROVAL_APPROVED"), 1);
    assert_eq!(app.audit.count_action("ALGO_MODE_SWITCH"), 1);
}

// ============================================================================
// S7: deterministic selection
// ============================================================================

#[tokio::test]
async fn s7_identical_requests_identical_order() {
    // Two engines seeded with the same content and the same learner produce
    // byte-identical orderings for the same request.
    let user_id = Uuid::new_v4();
    let learner = Actor::student(user_id);

    let mut order_a = Vec::new();
    let mut order_b = Vec::new();
    for order in [&mut order_a, &mut order_b] {
        let app = engine().await;
        // Deterministic item ids so the two banks are identical
        for theme_id in [10i64, 11] {
            for i in 0..10u128 {
                let mut fixed = item(1, 1, theme_id, 2);
                fixed.id = Uuid::from_u128((theme_id as u128) << 64 | i);
                app.content_repo.insert_published(&fixed).await.unwrap();
            }
        }
        let state = app
            .create_session(learner, tutor_request(8))
            .await
            .unwrap();
        *order = state.items.iter().map(|i| i.item_id).collect();
    }
    assert_eq!(order_a, order_b);
}

// ============================================================================
// Freeze: no knowledge-state writes while frozen
// ============================================================================

#[tokio::test]
async fn freeze_suppresses_pipeline_writes() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());
    let admin = Actor::admin(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    for item in state.items.iter().take(3) {
        app.submit_answer(
            learner,
            state.session.id,
            AnswerDto {
                question_id: item.item_id,
                selected_index: Some(2),
                marked_for_review: None,
            },
        )
        .await
        .unwrap();
    }

    app.freeze_updates(
        admin,
        FreezeDto {
            reason: "incident drill".to_string(),
            confirmation_phrase: Some("FREEZE UPDATES".to_string()),
        },
    )
    .await
    .unwrap();

    let summary = app.submit_session(learner, state.session.id).await.unwrap();
    assert_eq!(summary.status, SessionStatus::Submitted);
    assert_eq!(summary.score_correct, Some(3));

    // Scoring happened, but no mastery/elo/bandit row was written.
    assert!(app
        .state_repo
        .get_user_rating(learner.user_id)
        .await
        .unwrap()
        .is_none());
    assert!(app
        .state_repo
        .get_mastery(learner.user_id, &[])
        .await
        .unwrap()
        .is_empty());

    // After unfreezing, later sessions update state again.
    app.unfreeze_updates(
        admin,
        FreezeDto {
            reason: "drill over".to_string(),
            confirmation_phrase: Some("UNFREEZE UPDATES".to_string()),
        },
    )
    .await
    .unwrap();

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    for item in state.items.iter().take(3) {
        app.submit_answer(
            learner,
            state.session.id,
            AnswerDto {
                question_id: item.item_id,
                selected_index: Some(2),
                marked_for_review: None,
            },
        )
        .await
        .unwrap();
    }
    app.submit_session(learner, state.session.id).await.unwrap();
    assert!(app
        .state_repo
        .get_user_rating(learner.user_id)
        .await
        .unwrap()
        .is_some());
}

// ============================================================================
// Review surface
// ============================================================================

#[tokio::test]
async fn review_only_after_completion() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    let session_id = state.session.id;

    let err = app.review_session(learner, session_id).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    app.submit_answer(
        learner,
        session_id,
        AnswerDto {
            question_id: state.items[0].item_id,
            selected_index: Some(2),
            marked_for_review: Some(true),
        },
    )
    .await
    .unwrap();
    app.submit_session(learner, session_id).await.unwrap();

    let review = app.review_session(learner, session_id).await.unwrap();
    assert_eq!(review.items.len(), 5);
    assert_eq!(review.items[0].correct_index, 2);
    assert_eq!(review.items[0].selected_index, Some(2));
    assert_eq!(review.items[0].is_correct, Some(true));
    assert!(review.items[0].marked_for_review);
    assert!(review.items[0].explanation.is_some());
}

// ============================================================================
// Attempt event stream
// ============================================================================

#[tokio::test]
async fn attempt_events_get_monotonic_sequence() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let learner = Actor::student(Uuid::new_v4());

    let state = app
        .create_session(learner, tutor_request(5))
        .await
        .unwrap();
    let session_id = state.session.id;

    let recorded = app
        .record_events(
            learner,
            session_id,
            vec![
                AttemptEventDto {
                    question_id: state.items[0].item_id,
                    kind: "QUESTION_VIEWED".to_string(),
                    client_ts: Some(chrono::Utc::now()),
                },
                AttemptEventDto {
                    question_id: state.items[0].item_id,
                    kind: "BLUR".to_string(),
                    client_ts: None,
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(recorded, 2);

    // Answering appends its own events after the client ones
    app.submit_answer(
        learner,
        session_id,
        AnswerDto {
            question_id: state.items[0].item_id,
            selected_index: Some(2),
            marked_for_review: None,
        },
    )
    .await
    .unwrap();

    let seqs: Vec<(i64, String)> = sqlx::query_as(
        "SELECT seq, kind FROM attempt_events WHERE session_id = ? ORDER BY seq",
    )
    .bind(session_id.to_string())
    .fetch_all(&app.pool)
    .await
    .unwrap();
    assert!(seqs.len() >= 3);
    for (index, (seq, _)) in seqs.iter().enumerate() {
        assert_eq!(*seq, index as i64 + 1);
    }
    assert_eq!(seqs[0].1, "QUESTION_VIEWED");

    let err = app
        .record_events(
            learner,
            session_id,
            vec![AttemptEventDto {
                question_id: state.items[0].item_id,
                kind: "TELEPATHY".to_string(),
                client_ts: None,
            }],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

// ============================================================================
// Other learners cannot touch a session
// ============================================================================

#[tokio::test]
async fn foreign_session_is_not_found() {
    let app = engine().await;
    seed_bank(&app, 10).await;
    let owner = Actor::student(Uuid::new_v4());
    let stranger = Actor::student(Uuid::new_v4());

    let state = app.create_session(owner, tutor_request(5)).await.unwrap();
    let err = app
        .get_session(stranger, state.session.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

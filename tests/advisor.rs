mod common;

use common::*;
use derma_detect::chat::{ ReplyOutcome, Transcript, FALLBACK_MESSAGE };
use derma_detect::error::AppError;
use derma_detect::models::chat::ChatMessage;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[tokio::test]
async fn register_analyze_logout_login_restores_history() {
    let advisor = advisor();
    let registered = advisor.register("Ada", "Ada@Example.com", "secret1").await.unwrap();
    assert_eq!(registered.email, "ada@example.com");

    let first = advisor.analyze(PNG, "image/png").await.unwrap();
    let second = advisor.analyze(PNG, "image/jpeg").await.unwrap();
    assert_ne!(first.id, second.id);

    let history = advisor.history().await.unwrap();
    assert_eq!(history, vec![second.clone(), first.clone()]);

    advisor.logout().await.unwrap();
    assert!(matches!(advisor.history().await, Err(AppError::NotAuthenticated)));

    let user = advisor.login("ada@example.com", "secret1").await.unwrap();
    assert_eq!(user, registered);
    assert_eq!(advisor.history().await.unwrap(), vec![second, first]);
}

#[tokio::test]
async fn reports_are_normalized() {
    let advisor = advisor();
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();

    let report = advisor.analyze(PNG, "image/webp").await.unwrap();

    let scores: Vec<f64> = report.possible_conditions.iter().map(|c| c.confidence_score).collect();
    assert_eq!(scores, vec![100.0, 0.0]);
    assert!(report.image.starts_with("data:image/webp;base64,"));
    assert!(!report.disclaimer.is_empty());
}

#[tokio::test]
async fn oversized_image_never_reaches_the_provider() {
    let vision = Arc::new(FixedVision::new(ECZEMA_REPLY));
    let advisor = advisor_with(memory_store(), vision.clone(), FixedDialogue::new(&[]));
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();

    let image = vec![0u8; 4 * MIB + 1];
    let err = advisor.analyze(&image, "image/png").await.unwrap_err();

    assert!(matches!(err, AppError::OversizedInput { .. }));
    assert_eq!(err.to_string(), "File is too large. Please upload an image smaller than 4MB.");
    assert_eq!(vision.calls(), 0);
    assert!(advisor.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn analysis_requires_a_session() {
    let vision = Arc::new(FixedVision::new(ECZEMA_REPLY));
    let advisor = advisor_with(memory_store(), vision.clone(), FixedDialogue::new(&[]));

    let err = advisor.analyze(PNG, "image/png").await.unwrap_err();

    assert!(matches!(err, AppError::NotAuthenticated));
    assert_eq!(vision.calls(), 0);
}

#[tokio::test]
async fn session_survives_a_restart() {
    let store = memory_store();
    let vision = Arc::new(FixedVision::new(ECZEMA_REPLY));

    let before = advisor_with(store.clone(), vision.clone(), FixedDialogue::new(&[]));
    before.register("Ada", "ada@example.com", "secret1").await.unwrap();
    let report = before.analyze(PNG, "image/png").await.unwrap();
    drop(before);

    let after = advisor_with(store, vision, FixedDialogue::new(&[]));
    let restored = after.restore_session().await.unwrap().unwrap();
    assert_eq!(restored.email, "ada@example.com");
    assert_eq!(after.history().await.unwrap(), vec![report]);
}

#[tokio::test]
async fn histories_are_kept_per_user() {
    let advisor = advisor();
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();
    advisor.analyze(PNG, "image/png").await.unwrap();
    advisor.logout().await.unwrap();

    advisor.register("Grace", "grace@example.com", "secret2").await.unwrap();
    assert!(advisor.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_registration_is_rejected() {
    let advisor = advisor();
    let err = advisor.register("Ada", "ada@example.com", "short").await.unwrap_err();
    assert_eq!(err.to_string(), "Password must be at least 6 characters long.");
    assert!(advisor.current_user().await.unwrap().is_none());
}

#[tokio::test]
async fn chat_streams_through_the_transcript() {
    let advisor = advisor();
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();

    let dialogue = advisor.dialogue().await.unwrap();
    let mut transcript = Transcript::new();
    let mut seen = Collected::default();
    let outcome = transcript.ask(&dialogue, "Hi", &mut seen).await.unwrap();

    assert_eq!(outcome, ReplyOutcome::Completed);
    assert_eq!(seen.0.concat(), "Hello there.");
    assert_eq!(transcript.last(), Some(&ChatMessage::model("Hello there.")));
}

#[tokio::test]
async fn chat_failure_ends_with_the_fallback() {
    let advisor = advisor_with(
        memory_store(),
        Arc::new(FixedVision::new(ECZEMA_REPLY)),
        FixedDialogue::failing_after(&["Sun", "screen"], 1)
    );
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();

    let dialogue = advisor.dialogue().await.unwrap();
    let mut transcript = Transcript::new();
    let mut seen = Collected::default();
    let outcome = transcript.ask(&dialogue, "Tips?", &mut seen).await.unwrap();

    assert_eq!(outcome, ReplyOutcome::Failed);
    let messages = transcript.messages();
    assert_eq!(messages[messages.len() - 2], ChatMessage::model("Sun"));
    assert_eq!(messages[messages.len() - 1], ChatMessage::model(FALLBACK_MESSAGE));
}

#[tokio::test]
async fn dialogue_is_gated_by_the_session() {
    let advisor = advisor();
    assert!(matches!(advisor.dialogue().await, Err(AppError::NotAuthenticated)));

    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();
    let first = advisor.dialogue().await.unwrap();
    let second = advisor.dialogue().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn concurrent_analysis_is_turned_away() {
    let vision = Arc::new(SlowVision {
        inner: FixedVision::new(ECZEMA_REPLY),
        delay: Duration::from_millis(100),
    });
    let advisor = advisor_with(memory_store(), vision, FixedDialogue::new(&[]));
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();

    let (first, second) = tokio::join!(
        advisor.analyze(PNG, "image/png"),
        advisor.analyze(PNG, "image/png")
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(AppError::AnalysisInProgress)));
    assert_eq!(advisor.history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_history_load_leaves_no_session() {
    let store = Arc::new(FlakyHistoryStore::default());
    let advisor = advisor_with(
        store.clone(),
        Arc::new(FixedVision::new(ECZEMA_REPLY)),
        FixedDialogue::new(&[])
    );
    advisor.register("Ada", "ada@example.com", "secret1").await.unwrap();
    let report = advisor.analyze(PNG, "image/png").await.unwrap();
    advisor.logout().await.unwrap();

    store.fail_next_history_read.store(true, Ordering::SeqCst);
    let err = advisor.login("ada@example.com", "secret1").await.unwrap_err();
    assert!(matches!(err, AppError::Storage(_)));
    assert!(advisor.current_user().await.unwrap().is_none());

    advisor.login("ada@example.com", "secret1").await.unwrap();
    assert_eq!(advisor.history().await.unwrap(), vec![report]);
}

#[tokio::test]
async fn failed_restore_drops_the_stale_session() {
    let store = Arc::new(FlakyHistoryStore::default());
    let vision = Arc::new(FixedVision::new(ECZEMA_REPLY));
    let before = advisor_with(store.clone(), vision.clone(), FixedDialogue::new(&[]));
    before.register("Ada", "ada@example.com", "secret1").await.unwrap();
    drop(before);

    store.fail_next_history_read.store(true, Ordering::SeqCst);
    let after = advisor_with(store, vision, FixedDialogue::new(&[]));
    assert!(after.restore_session().await.is_err());
    assert!(after.current_user().await.unwrap().is_none());
}

//! Job queue tests against a real SQLite database.
//!
//! These exercise the conditional updates under concurrency, which the
//! in-memory store cannot prove.

use std::sync::Arc;

use stuart::config::{ClaimOrder, Config};
use stuart::liveness::{self, NEVER_AGE};
use stuart::models::{ChatMessage, JobState};
use stuart::queue::JobQueue;
use stuart::store::{JobStore, SqliteStore};
use stuart::{db, migrate};
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let config_content = format!(
        r#"
[db]
path = "{}"
"#,
        tmp.path().join("data").join("stuart.sqlite").display()
    );
    toml::from_str(&config_content).unwrap()
}

async fn setup(tmp: &TempDir, order: ClaimOrder) -> (JobQueue, Arc<SqliteStore>) {
    let cfg = test_config(tmp);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    (JobQueue::new(store.clone(), order), store)
}

fn answered(question: &str, answer: &str) -> (Vec<ChatMessage>, Vec<String>) {
    (
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user(question),
            ChatMessage::assistant(answer),
        ],
        vec![question.to_string(), answer.to_string()],
    )
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    migrate::run_migrations(&cfg).await.unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
}

#[tokio::test]
async fn test_full_turn_returns_to_waiting() {
    let tmp = TempDir::new().unwrap();
    let (queue, _) = setup(&tmp, ClaimOrder::Newest).await;

    let id = queue.create_session().await.unwrap();
    assert_eq!(
        queue.state(&id).await.unwrap(),
        Some(JobState::WaitForQuestion)
    );

    assert!(queue.enqueue(&id, "  What is a tax residence?  ").await.unwrap());
    assert_eq!(
        queue.state(&id).await.unwrap(),
        Some(JobState::QuestionQueued)
    );

    let job = queue.claim().await.unwrap().expect("job should be claimable");
    assert_eq!(job.id, id);
    assert_eq!(job.conversation, vec!["What is a tax residence?".to_string()]);
    assert!(job.conversation_llm.is_empty());
    job.validate().unwrap();
    assert_eq!(
        queue.state(&id).await.unwrap(),
        Some(JobState::ProcessingQuestion)
    );

    let (llm, conv) = answered("What is a tax residence?", "Where you live.");
    let source = vec!["rt 0 residence.md".to_string()];
    assert!(queue.finish(&id, &llm, &conv, &source).await.unwrap());

    let session = queue.session(&id).await.unwrap().unwrap();
    assert_eq!(session.state, JobState::WaitForQuestion);
    assert_eq!(session.conversation_llm.len(), session.conversation.len() + 1);
    assert_eq!(session.source, source);

    // The next turn satisfies the worker's invariant check.
    assert!(queue.enqueue(&id, "And for companies?").await.unwrap());
    let next = queue.claim().await.unwrap().unwrap();
    assert_eq!(next.conversation.len(), 3);
    assert_eq!(next.conversation_llm.len(), next.conversation.len());
    next.validate().unwrap();
}

#[tokio::test]
async fn test_second_question_rejected_while_queued() {
    let tmp = TempDir::new().unwrap();
    let (queue, _) = setup(&tmp, ClaimOrder::Newest).await;
    let id = queue.create_session().await.unwrap();

    let (first, second) = tokio::join!(queue.enqueue(&id, "first"), queue.enqueue(&id, "second"));
    let accepted = [first.unwrap(), second.unwrap()];
    assert_eq!(accepted.iter().filter(|a| **a).count(), 1);

    let session = queue.session(&id).await.unwrap().unwrap();
    assert_eq!(session.state, JobState::QuestionQueued);
    assert_eq!(session.conversation.len(), 1);

    assert!(!queue.enqueue(&id, "third").await.unwrap());
}

#[tokio::test]
async fn test_enqueue_unknown_session() {
    let tmp = TempDir::new().unwrap();
    let (queue, _) = setup(&tmp, ClaimOrder::Newest).await;
    assert!(!queue.enqueue("no-such-session", "hello").await.unwrap());
    assert_eq!(queue.state("no-such-session").await.unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let tmp = TempDir::new().unwrap();
    let (queue, _) = setup(&tmp, ClaimOrder::Newest).await;
    let id = queue.create_session().await.unwrap();
    queue.enqueue(&id, "only one worker may take this").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.claim().await.unwrap() }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            winners.push(job.id);
        }
    }
    assert_eq!(winners, vec![id]);
}

#[tokio::test]
async fn test_claim_order() {
    let tmp = TempDir::new().unwrap();
    let (newest_queue, store) = setup(&tmp, ClaimOrder::Newest).await;
    let oldest_queue = JobQueue::new(store.clone(), ClaimOrder::Oldest);

    for id in ["a", "b", "c"] {
        store.create_session(id, 100).await.unwrap();
    }
    store.enqueue("a", "q", 200).await.unwrap();
    store.enqueue("b", "q", 300).await.unwrap();
    store.enqueue("c", "q", 250).await.unwrap();

    assert_eq!(newest_queue.claim().await.unwrap().unwrap().id, "b");
    assert_eq!(oldest_queue.claim().await.unwrap().unwrap().id, "a");
    assert_eq!(newest_queue.claim().await.unwrap().unwrap().id, "c");
    assert!(newest_queue.claim().await.unwrap().is_none());
}

#[tokio::test]
async fn test_finish_unknown_session_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let (queue, _) = setup(&tmp, ClaimOrder::Newest).await;
    let (llm, conv) = answered("q", "a");
    assert!(!queue.finish("missing", &llm, &conv, &[]).await.unwrap());
}

#[tokio::test]
async fn test_release_drops_unanswered_question() {
    let tmp = TempDir::new().unwrap();
    let (queue, store) = setup(&tmp, ClaimOrder::Newest).await;

    store.create_session("stuck", 100).await.unwrap();
    store.enqueue("stuck", "lost question", 110).await.unwrap();
    store.claim(ClaimOrder::Newest, 120).await.unwrap().unwrap();

    store.create_session("fresh", 100).await.unwrap();
    store.enqueue("fresh", "recent question", 110).await.unwrap();
    store.claim(ClaimOrder::Newest, 500).await.unwrap().unwrap();

    let released = store.release_stuck(400, 600).await.unwrap();
    assert_eq!(released, vec!["stuck".to_string()]);

    let stuck = queue.session("stuck").await.unwrap().unwrap();
    assert_eq!(stuck.state, JobState::WaitForQuestion);
    assert!(stuck.conversation.is_empty());
    assert_eq!(
        queue.state("fresh").await.unwrap(),
        Some(JobState::ProcessingQuestion)
    );

    // A released session accepts a new question and yields a valid job.
    assert!(queue.enqueue("stuck", "try again").await.unwrap());
    let job = queue.claim().await.unwrap().unwrap();
    assert_eq!(job.id, "stuck");
    job.validate().unwrap();
}

#[tokio::test]
async fn test_release_keeps_history_or_resets() {
    let tmp = TempDir::new().unwrap();
    let (queue, store) = setup(&tmp, ClaimOrder::Newest).await;

    // A follow-up turn that fits the job shape keeps its history.
    let (llm, conv) = answered("first", "answer");
    store.create_session("follow", 100).await.unwrap();
    store
        .finish("follow", &llm, &conv, &["rt 0 a.md".to_string()], 105)
        .await
        .unwrap();
    store.enqueue("follow", "second", 110).await.unwrap();
    store.claim(ClaimOrder::Newest, 120).await.unwrap().unwrap();

    // Three model messages but only two turns once the question is added.
    store.create_session("broken", 100).await.unwrap();
    store
        .finish("broken", &llm, &conv[1..], &["rt 0 b.md".to_string()], 105)
        .await
        .unwrap();
    store.enqueue("broken", "second", 110).await.unwrap();
    let job = store.claim(ClaimOrder::Newest, 120).await.unwrap().unwrap();
    assert_eq!((job.conversation_llm.len(), job.conversation.len()), (3, 2));

    let mut released = store.release_stuck(400, 600).await.unwrap();
    released.sort();
    assert_eq!(released, vec!["broken".to_string(), "follow".to_string()]);

    let follow = queue.session("follow").await.unwrap().unwrap();
    assert_eq!(follow.state, JobState::WaitForQuestion);
    assert_eq!(follow.conversation, conv);
    assert_eq!(follow.conversation_llm, llm);
    assert_eq!(follow.source, vec!["rt 0 a.md".to_string()]);

    let broken = queue.session("broken").await.unwrap().unwrap();
    assert_eq!(broken.state, JobState::WaitForQuestion);
    assert!(broken.conversation.is_empty());
    assert!(broken.conversation_llm.is_empty());
    assert!(broken.source.is_empty());

    // Neither session is dropped again on its next turn.
    for id in ["follow", "broken"] {
        assert!(queue.enqueue(id, "again").await.unwrap());
        queue.claim().await.unwrap().unwrap().validate().unwrap();
    }
}

#[tokio::test]
async fn test_state_counts_and_ages() {
    let tmp = TempDir::new().unwrap();
    let (queue, _) = setup(&tmp, ClaimOrder::Newest).await;

    let a = queue.create_session().await.unwrap();
    let _b = queue.create_session().await.unwrap();
    queue.enqueue(&a, "question").await.unwrap();

    let counts = queue.state_counts().await.unwrap();
    assert_eq!(
        counts,
        vec![
            (JobState::WaitForQuestion, 1),
            (JobState::QuestionQueued, 1),
            (JobState::ProcessingQuestion, 0),
        ]
    );

    let ages = queue.latest_age_by_state().await.unwrap();
    assert_eq!(ages.len(), 3);
    assert!(ages[0].age.unwrap() < 60.0);
    assert!(ages[1].age.unwrap() < 60.0);
    assert!(ages[2].age.is_none());
}

#[tokio::test]
async fn test_heartbeat_age() {
    let tmp = TempDir::new().unwrap();
    let (_, store) = setup(&tmp, ClaimOrder::Newest).await;

    assert!(liveness::heartbeat_age(store.as_ref()).await.unwrap() >= NEVER_AGE);
    assert!(liveness::is_stale(store.as_ref(), 10.0).await.unwrap());

    liveness::heartbeat(store.as_ref()).await.unwrap();
    liveness::heartbeat(store.as_ref()).await.unwrap();
    let age = liveness::heartbeat_age(store.as_ref()).await.unwrap();
    assert!((0.0..5.0).contains(&age), "age was {}", age);
    assert!(!liveness::is_stale(store.as_ref(), 10.0).await.unwrap());
}

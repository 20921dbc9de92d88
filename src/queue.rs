//! Job queue: the session state machine shared by the front end and the
//! worker.
//!
//! ```text
//!                enqueue                claim
//! wait-for-question ──▶ question-queued ──▶ processing-question
//!        ▲                                         │
//!        └──────────────── finish ─────────────────┘
//! ```
//!
//! `finish` is accepted from any state; `release_stuck` is the operator's
//! way back for a job whose worker never finished it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::config::ClaimOrder;
use crate::models::{ChatMessage, Job, JobState, Session};
use crate::store::JobStore;

/// Age in seconds per state, `None` when no session is in that state.
#[derive(Debug, Clone, Serialize)]
pub struct StateAge {
    pub state: JobState,
    pub age: Option<f64>,
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn now_secs_f64() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    claim_order: ClaimOrder,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, claim_order: ClaimOrder) -> Self {
        Self { store, claim_order }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a fresh session and return its id.
    pub async fn create_session(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.store.create_session(&id, now_secs()).await?;
        tracing::debug!(session = %id, "session created");
        Ok(id)
    }

    pub async fn state(&self, id: &str) -> Result<Option<JobState>> {
        Ok(self.store.session(id).await?.map(|s| s.state))
    }

    pub async fn session(&self, id: &str) -> Result<Option<Session>> {
        self.store.session(id).await
    }

    /// Queue a question. `false` when the session is unknown or not waiting.
    pub async fn enqueue(&self, id: &str, question: &str) -> Result<bool> {
        let question = question.trim();
        let accepted = self.store.enqueue(id, question, now_secs()).await?;
        if accepted {
            tracing::info!(session = %id, chars = question.chars().count(), "question queued");
        } else {
            tracing::debug!(session = %id, "question rejected");
        }
        Ok(accepted)
    }

    pub async fn claim(&self) -> Result<Option<Job>> {
        let job = self.store.claim(self.claim_order, now_secs()).await?;
        if let Some(ref job) = job {
            tracing::info!(session = %job.id, "job claimed");
        }
        Ok(job)
    }

    pub async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
    ) -> Result<bool> {
        let updated = self
            .store
            .finish(id, conversation_llm, conversation, source, now_secs())
            .await?;
        if updated {
            tracing::info!(session = %id, "job finished");
        } else {
            tracing::warn!(session = %id, "finish for unknown session ignored");
        }
        Ok(updated)
    }

    pub async fn state_counts(&self) -> Result<Vec<(JobState, i64)>> {
        self.store.state_counts().await
    }

    /// Seconds since the most recently modified session in each state.
    pub async fn latest_age_by_state(&self) -> Result<Vec<StateAge>> {
        let now = now_secs_f64();
        Ok(self
            .store
            .latest_modified_by_state()
            .await?
            .into_iter()
            .map(|(state, ts)| StateAge {
                state,
                age: ts.map(|ts| (now - ts as f64).max(0.0)),
            })
            .collect())
    }

    /// Return jobs stuck in `processing-question` for longer than
    /// `older_than` to `wait-for-question`. Sessions that still fit a job
    /// drop their unanswered question; the rest are cleared.
    pub async fn release_stuck(&self, older_than: Duration) -> Result<Vec<String>> {
        let now = now_secs();
        let cutoff = now - older_than.as_secs() as i64;
        let released = self.store.release_stuck(cutoff, now).await?;
        for id in &released {
            tracing::warn!(session = %id, "released stranded job");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn queue(order: ClaimOrder) -> JobQueue {
        JobQueue::new(Arc::new(InMemoryStore::new()), order)
    }

    #[tokio::test]
    async fn test_state_machine() {
        let q = queue(ClaimOrder::Newest);
        let id = q.create_session().await.unwrap();
        assert_eq!(q.state(&id).await.unwrap(), Some(JobState::WaitForQuestion));

        assert!(q.enqueue(&id, "  What is ODH?\n").await.unwrap());
        assert_eq!(q.state(&id).await.unwrap(), Some(JobState::QuestionQueued));
        // Second submission while queued is rejected.
        assert!(!q.enqueue(&id, "again").await.unwrap());

        let job = q.claim().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.conversation, vec!["What is ODH?".to_string()]);
        assert_eq!(q.state(&id).await.unwrap(), Some(JobState::ProcessingQuestion));
        assert!(q.claim().await.unwrap().is_none());
        assert!(!q.enqueue(&id, "still busy").await.unwrap());

        assert!(q.finish(&id, &[], &job.conversation, &[]).await.unwrap());
        assert_eq!(q.state(&id).await.unwrap(), Some(JobState::WaitForQuestion));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let q = queue(ClaimOrder::Newest);
        assert!(!q.enqueue("nope", "hi").await.unwrap());
        assert_eq!(q.state("nope").await.unwrap(), None);
        assert!(!q.finish("nope", &[], &[], &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_order() {
        for (order, expected) in [(ClaimOrder::Newest, 1), (ClaimOrder::Oldest, 0)] {
            let q = queue(order);
            let a = q.create_session().await.unwrap();
            let b = q.create_session().await.unwrap();
            q.enqueue(&a, "first").await.unwrap();
            q.enqueue(&b, "second").await.unwrap();
            let ids = [a, b];
            let job = q.claim().await.unwrap().unwrap();
            assert_eq!(job.id, ids[expected], "order {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_release_stuck() {
        let q = queue(ClaimOrder::Newest);
        let id = q.create_session().await.unwrap();
        q.enqueue(&id, "lost question").await.unwrap();
        q.claim().await.unwrap().unwrap();

        // Not old enough yet.
        assert!(q.release_stuck(Duration::from_secs(3600)).await.unwrap().is_empty());

        q.store()
            .release_stuck(now_secs() + 1, now_secs())
            .await
            .unwrap();
        let session = q.session(&id).await.unwrap().unwrap();
        assert_eq!(session.state, JobState::WaitForQuestion);
        assert!(session.conversation.is_empty());
        assert!(q.enqueue(&id, "retry").await.unwrap());
        assert!(q.claim().await.unwrap().unwrap().validate().is_ok());
    }

    #[tokio::test]
    async fn test_release_clears_inconsistent_session() {
        let q = queue(ClaimOrder::Newest);
        let id = q.create_session().await.unwrap();
        let llm = vec![
            ChatMessage::system("system"),
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ];
        // One entry short: the next claim carries 3 model messages and 2 turns.
        q.finish(&id, &llm, &["a".to_string()], &["src".to_string()])
            .await
            .unwrap();
        q.enqueue(&id, "follow-up").await.unwrap();
        assert!(q.claim().await.unwrap().unwrap().validate().is_err());

        let released = q
            .store()
            .release_stuck(now_secs() + 1, now_secs())
            .await
            .unwrap();
        assert_eq!(released, vec![id.clone()]);
        let session = q.session(&id).await.unwrap().unwrap();
        assert_eq!(session.state, JobState::WaitForQuestion);
        assert!(session.conversation.is_empty());
        assert!(session.conversation_llm.is_empty());
        assert!(session.source.is_empty());

        assert!(q.enqueue(&id, "start over").await.unwrap());
        assert!(q.claim().await.unwrap().unwrap().validate().is_ok());
    }

    #[tokio::test]
    async fn test_counts_and_ages() {
        let q = queue(ClaimOrder::Newest);
        let a = q.create_session().await.unwrap();
        q.create_session().await.unwrap();
        q.enqueue(&a, "hi").await.unwrap();

        let counts = q.state_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![
                (JobState::WaitForQuestion, 1),
                (JobState::QuestionQueued, 1),
                (JobState::ProcessingQuestion, 0),
            ]
        );
        let ages = q.latest_age_by_state().await.unwrap();
        assert!(ages[0].age.unwrap() < 5.0);
        assert!(ages[2].age.is_none());
    }
}

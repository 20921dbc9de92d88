//! Storage abstraction for Stuart.
//!
//! Two repository traits split the persisted state by owner:
//!
//! | Trait | Owner | Backing table |
//! |-------|-------|---------------|
//! | [`ChunkStore`] | ingestion (writes), retriever (reads) | `chunks` |
//! | [`JobStore`] | job queue | `session`, `heartbeat` |
//!
//! [`SqliteStore`] implements both over a shared pool. [`InMemoryStore`]
//! implements both behind a lock and exists so the pipeline can be tested
//! without a database file.
//!
//! Every job transition is a single conditional operation: two callers
//! racing on the same session can never both observe success.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ClaimOrder;
use crate::models::{Chunk, ChatMessage, Job, JobState, Session};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Whether any chunk of `(tag, file_name)` has been stored.
    async fn has_document(&self, tag: &str, file_name: &str) -> Result<bool>;

    /// Store all chunks of one document atomically.
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Every stored chunk, in insertion order.
    async fn all_chunks(&self) -> Result<Vec<Chunk>>;

    /// Number of distinct `(tag, file_name)` documents.
    async fn document_count(&self) -> Result<i64>;

    async fn chunk_count(&self) -> Result<i64>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a session in `wait-for-question` with empty lists.
    async fn create_session(&self, id: &str, now: i64) -> Result<()>;

    async fn session(&self, id: &str) -> Result<Option<Session>>;

    /// Append `question` and move to `question-queued`, only from
    /// `wait-for-question`. Returns whether the session moved.
    async fn enqueue(&self, id: &str, question: &str, now: i64) -> Result<bool>;

    /// Move one `question-queued` session to `processing-question` and
    /// return it.
    async fn claim(&self, order: ClaimOrder, now: i64) -> Result<Option<Job>>;

    /// Overwrite the conversation fields and return to `wait-for-question`
    /// from any state. Returns `false` for an unknown id.
    async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
        now: i64,
    ) -> Result<bool>;

    /// Session count for every state, zeros included.
    async fn state_counts(&self) -> Result<Vec<(JobState, i64)>>;

    /// Latest `modified` timestamp per state, `None` when no session is in
    /// that state.
    async fn latest_modified_by_state(&self) -> Result<Vec<(JobState, Option<i64>)>>;

    /// Move `processing-question` sessions last modified before `cutoff`
    /// back to `wait-for-question`. Returns the ids released.
    ///
    /// A session that would pass [`Job::validate`](crate::models::Job::validate)
    /// only drops its unanswered question. Any other session is cleared, since
    /// trimming cannot make its next job valid.
    async fn release_stuck(&self, cutoff: i64, now: i64) -> Result<Vec<String>>;

    async fn record_heartbeat(&self, now: i64) -> Result<()>;

    async fn last_heartbeat(&self) -> Result<Option<i64>>;
}

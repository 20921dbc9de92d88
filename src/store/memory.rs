//! In-memory [`ChunkStore`] and [`JobStore`] for tests.
//!
//! State lives behind `std::sync::RwLock`; each operation takes the write
//! lock once, which gives the same all-or-nothing transitions as the
//! single-statement SQLite queries.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ClaimOrder;
use crate::models::{ChatMessage, Chunk, Job, JobState, Session};

use super::{ChunkStore, JobStore};

#[derive(Default)]
struct Inner {
    chunks: Vec<Chunk>,
    /// Insertion order doubles as the SQLite rowid tie-break.
    sessions: Vec<Session>,
    heartbeat: Option<i64>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn has_document(&self, tag: &str, file_name: &str) -> Result<bool> {
        Ok(self
            .read()?
            .chunks
            .iter()
            .any(|c| c.tag == tag && c.file_name == file_name))
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        self.write()?.chunks.extend_from_slice(chunks);
        Ok(())
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        Ok(self.read()?.chunks.clone())
    }

    async fn document_count(&self) -> Result<i64> {
        let inner = self.read()?;
        let mut seen: Vec<(&str, &str)> = inner
            .chunks
            .iter()
            .map(|c| (c.tag.as_str(), c.file_name.as_str()))
            .collect();
        seen.sort_unstable();
        seen.dedup();
        Ok(seen.len() as i64)
    }

    async fn chunk_count(&self) -> Result<i64> {
        Ok(self.read()?.chunks.len() as i64)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_session(&self, id: &str, now: i64) -> Result<()> {
        let mut inner = self.write()?;
        if inner.sessions.iter().any(|s| s.id == id) {
            anyhow::bail!("session {} already exists", id);
        }
        inner.sessions.push(Session {
            id: id.to_string(),
            state: JobState::WaitForQuestion,
            conversation: Vec::new(),
            conversation_llm: Vec::new(),
            source: Vec::new(),
            created_at: now,
            modified_at: now,
        });
        Ok(())
    }

    async fn session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.read()?.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn enqueue(&self, id: &str, question: &str, now: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner
            .sessions
            .iter_mut()
            .find(|s| s.id == id && s.state == JobState::WaitForQuestion)
        {
            Some(session) => {
                session.conversation.push(question.to_string());
                session.state = JobState::QuestionQueued;
                session.modified_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim(&self, order: ClaimOrder, now: i64) -> Result<Option<Job>> {
        let mut inner = self.write()?;
        let queued = inner
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == JobState::QuestionQueued)
            .map(|(i, s)| (s.modified_at, i));
        let picked = match order {
            ClaimOrder::Newest => queued.max(),
            ClaimOrder::Oldest => queued.min(),
        };
        let Some((_, index)) = picked else {
            return Ok(None);
        };
        let session = &mut inner.sessions[index];
        session.state = JobState::ProcessingQuestion;
        session.modified_at = now;
        Ok(Some(Job {
            id: session.id.clone(),
            conversation: session.conversation.clone(),
            conversation_llm: session.conversation_llm.clone(),
            source: session.source.clone(),
        }))
    }

    async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
        now: i64,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.conversation_llm = conversation_llm.to_vec();
                session.conversation = conversation.to_vec();
                session.source = source.to_vec();
                session.state = JobState::WaitForQuestion;
                session.modified_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn state_counts(&self) -> Result<Vec<(JobState, i64)>> {
        let inner = self.read()?;
        Ok(JobState::ALL
            .iter()
            .map(|state| {
                let n = inner.sessions.iter().filter(|s| s.state == *state).count();
                (*state, n as i64)
            })
            .collect())
    }

    async fn latest_modified_by_state(&self) -> Result<Vec<(JobState, Option<i64>)>> {
        let inner = self.read()?;
        Ok(JobState::ALL
            .iter()
            .map(|state| {
                let latest = inner
                    .sessions
                    .iter()
                    .filter(|s| s.state == *state)
                    .map(|s| s.modified_at)
                    .max();
                (*state, latest)
            })
            .collect())
    }

    async fn release_stuck(&self, cutoff: i64, now: i64) -> Result<Vec<String>> {
        let mut inner = self.write()?;
        let mut released = Vec::new();
        for session in inner
            .sessions
            .iter_mut()
            .filter(|s| s.state == JobState::ProcessingQuestion && s.modified_at < cutoff)
        {
            let llm = session.conversation_llm.len();
            let conv = session.conversation.len();
            if (llm == 0 && conv == 1) || (llm > 0 && llm == conv) {
                session.conversation.pop();
            } else {
                session.conversation.clear();
                session.conversation_llm.clear();
                session.source.clear();
            }
            session.state = JobState::WaitForQuestion;
            session.modified_at = now;
            released.push(session.id.clone());
        }
        Ok(released)
    }

    async fn record_heartbeat(&self, now: i64) -> Result<()> {
        self.write()?.heartbeat = Some(now);
        Ok(())
    }

    async fn last_heartbeat(&self) -> Result<Option<i64>> {
        Ok(self.read()?.heartbeat)
    }
}

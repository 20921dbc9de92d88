//! Core data models used throughout Stuart.
//!
//! These types represent the documents and chunks that flow through
//! ingestion and retrieval, and the sessions that move through the job
//! queue. JSON appears only at the SQLite and HTTP boundaries; inside the
//! crate conversations are typed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A source file ready to be chunked.
#[derive(Debug, Clone)]
pub struct Document {
    pub tag: String,
    pub file_name: String,
    pub body: String,
}

/// A span of a document body together with its embedding.
///
/// `body` is always the exact character range `start_pos..end_pos` of the
/// parent document body. Chunks are written once and never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub tag: String,
    pub file_name: String,
    pub start_pos: usize,
    pub end_pos: usize,
    pub body: String,
    pub embedding: Vec<f32>,
}

/// A chunk ranked against a query. Lower distance is better.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub distance: f32,
    pub rank: usize,
}

/// Queue state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    WaitForQuestion,
    QuestionQueued,
    ProcessingQuestion,
}

impl JobState {
    pub const ALL: [JobState; 3] = [
        JobState::WaitForQuestion,
        JobState::QuestionQueued,
        JobState::ProcessingQuestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::WaitForQuestion => "wait-for-question",
            JobState::QuestionQueued => "question-queued",
            JobState::ProcessingQuestion => "processing-question",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job state: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of the model-facing conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A session as stored by the job queue.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub state: JobState,
    /// Alternating user questions and answers, as shown to the user.
    pub conversation: Vec<String>,
    /// Messages sent to the model, including the system message.
    pub conversation_llm: Vec<ChatMessage>,
    /// One citation string per chunk used as context.
    pub source: Vec<String>,
    pub created_at: i64,
    pub modified_at: i64,
}

/// The slice of a session handed to a worker by `claim`.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub conversation: Vec<String>,
    pub conversation_llm: Vec<ChatMessage>,
    pub source: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "conversation out of step: {conversation_llm} model messages for {conversation} turns"
)]
pub struct InvariantViolation {
    pub conversation_llm: usize,
    pub conversation: usize,
}

impl Job {
    /// The question waiting to be answered.
    pub fn question(&self) -> Option<&str> {
        self.conversation.last().map(String::as_str)
    }

    /// Turn that preceded the current question, if any.
    pub fn previous_turn(&self) -> Option<&str> {
        self.conversation
            .len()
            .checked_sub(2)
            .map(|i| self.conversation[i].as_str())
    }

    /// Check that the two conversation views are in step.
    ///
    /// A fresh job has no model messages and exactly one question. Once a
    /// session has been answered, `conversation_llm` holds the system
    /// message plus one message per turn, so after the next question is
    /// enqueued both lists have the same length.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let llm = self.conversation_llm.len();
        let conv = self.conversation.len();
        let ok = (llm == 0 && conv == 1) || (llm > 0 && llm == conv);
        if ok {
            Ok(())
        } else {
            Err(InvariantViolation {
                conversation_llm: llm,
                conversation: conv,
            })
        }
    }
}

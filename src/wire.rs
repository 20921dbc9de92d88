//! Payloads exchanged between the front end and the worker.
//!
//! List fields travel as JSON-encoded strings inside the outer JSON object
//! (claim) or form body (finish), which keeps the form encoding flat.

use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, Job};

/// Body of a non-empty `/claim_job` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub uuid: String,
    pub conversation: String,
    pub conversation_llm: String,
    pub source: String,
}

impl ClaimPayload {
    pub fn from_job(job: &Job) -> serde_json::Result<Self> {
        Ok(Self {
            uuid: job.id.clone(),
            conversation: serde_json::to_string(&job.conversation)?,
            conversation_llm: serde_json::to_string(&job.conversation_llm)?,
            source: serde_json::to_string(&job.source)?,
        })
    }

    pub fn into_job(self) -> serde_json::Result<Job> {
        Ok(Job {
            id: self.uuid,
            conversation: serde_json::from_str(&self.conversation)?,
            conversation_llm: serde_json::from_str(&self.conversation_llm)?,
            source: serde_json::from_str(&self.source)?,
        })
    }
}

/// Form body of `/finish_job`. Missing fields decode as empty strings so
/// the secret is checked before the lists are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinishForm {
    pub secret: String,
    pub uuid: String,
    pub conversation_llm: String,
    pub conversation: String,
    pub source: String,
}

/// Decoded `/finish_job` lists.
pub struct Finished {
    pub conversation_llm: Vec<ChatMessage>,
    pub conversation: Vec<String>,
    pub source: Vec<String>,
}

impl FinishForm {
    pub fn new(
        secret: &str,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
    ) -> serde_json::Result<Self> {
        Ok(Self {
            secret: secret.to_string(),
            uuid: id.to_string(),
            conversation_llm: serde_json::to_string(conversation_llm)?,
            conversation: serde_json::to_string(conversation)?,
            source: serde_json::to_string(source)?,
        })
    }

    pub fn decode(&self) -> serde_json::Result<Finished> {
        Ok(Finished {
            conversation_llm: serde_json::from_str(&self.conversation_llm)?,
            conversation: serde_json::from_str(&self.conversation)?,
            source: serde_json::from_str(&self.source)?,
        })
    }
}

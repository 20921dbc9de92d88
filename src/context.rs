//! Prompt assembly for first and follow-up turns.
//!
//! The first turn of a session produces a system message and one user
//! message that wraps the question in an answer-from-context instruction.
//! Follow-up turns append one user message carrying the new question and
//! fresh context, which the model is told to ignore when irrelevant. Every
//! chunk placed into the prompt yields one citation string for the user.

use crate::models::{ChatMessage, Chunk, RetrievalResult};

pub const SYSTEM_PROMPT: &str = "You are an assistant who answers questions.";

/// Messages and citations produced for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTurn {
    /// Full model conversation including the new user message.
    pub messages: Vec<ChatMessage>,
    /// Citations for the chunks used as context in this turn.
    pub citations: Vec<String>,
}

/// Concatenated bodies of the first `top_n` results, in rank order.
pub fn build_context(results: &[RetrievalResult], top_n: usize) -> String {
    results
        .iter()
        .take(top_n)
        .map(|r| r.chunk.body.as_str())
        .collect()
}

pub fn citation(chunk: &Chunk) -> String {
    format!(
        "Source: document {} (tag: {}) at offset {} chars.",
        chunk.file_name, chunk.tag, chunk.start_pos
    )
}

fn first_turn_prompt(context: &str, question: &str) -> String {
    format!(
        "\nAnswer the question based on the context below.\n\
         If the question can't be answered based on the context, just say \"I don't know\".\n\
         ---\n\
         Context:\n\
         {context}\n\
         \n\
         ---\n\
         Question:\n\
         {question}\n"
    )
}

fn follow_up_prompt(context: &str, question: &str) -> String {
    format!(
        "\n{question}\n\
         \n\
         Below is more context that might be useful or not.\n\
         If the context is irrelevant, ignore it silently. Otherwise use it to refine your answer.\n\
         ---\n\
         Context:\n\
         {context}\n"
    )
}

/// Build the model input for `question`.
///
/// An empty `conversation_llm` means this is the session's first turn.
pub fn assemble(
    conversation_llm: &[ChatMessage],
    question: &str,
    results: &[RetrievalResult],
    top_n: usize,
) -> AssembledTurn {
    let context = build_context(results, top_n);
    let citations = results.iter().take(top_n).map(|r| citation(&r.chunk)).collect();

    let messages = if conversation_llm.is_empty() {
        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(first_turn_prompt(&context, question)),
        ]
    } else {
        let mut messages = conversation_llm.to_vec();
        messages.push(ChatMessage::user(follow_up_prompt(&context, question)));
        messages
    };

    AssembledTurn {
        messages,
        citations,
    }
}

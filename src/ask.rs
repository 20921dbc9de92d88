//! `stuart ask`: answer one question from the terminal without going
//! through the job queue. Handy for checking retrieval and prompt quality
//! against a freshly loaded index.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::context;
use crate::db;
use crate::embedding;
use crate::llm;
use crate::search::Retriever;
use crate::store::SqliteStore;

pub async fn run_ask(config: &Config, question: &str, show_sources: bool) -> Result<()> {
    let question = question.trim();
    if question.is_empty() {
        bail!("question must not be empty");
    }
    if !config.embedding.is_enabled() {
        bail!("Asking requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let retriever = Retriever::new(
        Arc::new(SqliteStore::new(pool.clone())),
        embedding::create_provider(&config.embedding)?,
        &config.retrieval,
    );
    let model = llm::create_chat_model(&config.llm)?;

    let results = retriever.search(question, config.retrieval.top_k).await?;
    let turn = context::assemble(&[], question, &results, config.retrieval.top_n);

    let answer = model.complete(&turn.messages).await?;
    println!("{}", answer.trim());

    if show_sources {
        println!();
        for citation in &turn.citations {
            println!("  {}", citation);
        }
    }

    pool.close().await;
    Ok(())
}

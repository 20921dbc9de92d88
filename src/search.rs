//! Vector retrieval with a tag-based distance penalty.
//!
//! Chunks are scored by brute-force cosine distance against the query
//! embedding. Chunks carrying the penalized tag (ticket threads by default)
//! get a fixed amount added to their distance so curated documentation wins
//! near-ties.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding::{self, cosine_similarity, EmbeddingProvider};
use crate::models::{Chunk, RetrievalResult};
use crate::store::{ChunkStore, SqliteStore};

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    penalized_tag: String,
    tag_penalty: f32,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            penalized_tag: config.penalized_tag.clone(),
            tag_penalty: config.tag_penalty as f32,
        }
    }

    /// Top `top_k` chunks for `query`, nearest first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let chunks = self.store.all_chunks().await?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = embedding::embed_query(self.embedder.as_ref(), query).await?;
        let results = rank(chunks, &query_vec, top_k, |tag| {
            if tag == self.penalized_tag {
                self.tag_penalty
            } else {
                0.0
            }
        });
        tracing::debug!(
            results = results.len(),
            best = results.first().map(|r| r.distance),
            "retrieval done"
        );
        Ok(results)
    }
}

/// Score and order `chunks` (given in insertion order) by distance.
///
/// The sort is stable, so equal distances keep insertion order. A NaN
/// distance (from a corrupt embedding) ranks after every real one.
pub fn rank<F>(chunks: Vec<Chunk>, query_vec: &[f32], top_k: usize, penalty: F) -> Vec<RetrievalResult>
where
    F: Fn(&str) -> f32,
{
    let mut scored: Vec<(f32, Chunk)> = chunks
        .into_iter()
        .map(|chunk| {
            let distance =
                1.0 - cosine_similarity(query_vec, &chunk.embedding) + penalty(&chunk.tag);
            (distance, chunk)
        })
        .collect();

    scored.sort_by(|a, b| {
        a.0.is_nan()
            .cmp(&b.0.is_nan())
            .then_with(|| a.0.total_cmp(&b.0))
    });
    scored.truncate(top_k);

    scored
        .into_iter()
        .enumerate()
        .map(|(rank, (distance, chunk))| RetrievalResult {
            chunk,
            distance,
            rank,
        })
        .collect()
}

/// Text embedded for retrieval. Follow-up questions are prefixed with the
/// previous turn so that short questions like "and on Sundays?" still find
/// the topic under discussion.
pub fn retrieval_query(previous_turn: Option<&str>, question: &str) -> String {
    match previous_turn {
        Some(prev) => format!("{}\n{}", prev, question),
        None => question.to_string(),
    }
}

/// `stuart search`: print the nearest chunks for a query.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let embedder = embedding::create_provider(&config.embedding)?;
    let retriever = Retriever::new(store, embedder, &config.retrieval);

    let results = retriever
        .search(query, limit.unwrap_or(config.retrieval.top_k))
        .await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    println!("{:>4}  {:>8}  {:<10}  {:>8}  file", "rank", "distance", "tag", "offset");
    for result in &results {
        println!(
            "{:>4}  {:>8.4}  {:<10}  {:>8}  {}",
            result.rank + 1,
            result.distance,
            result.chunk.tag,
            result.chunk.start_pos,
            result.chunk.file_name
        );
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: &str, name: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            tag: tag.into(),
            file_name: name.into(),
            start_pos: 0,
            end_pos: 1,
            body: name.into(),
            embedding,
        }
    }

    fn rt_penalty(tag: &str) -> f32 {
        if tag == "rt" {
            0.1
        } else {
            0.0
        }
    }

    #[test]
    fn test_penalty_reorders_near_ties() {
        // Identical vectors: the penalized chunk loses by exactly 0.1.
        let chunks = vec![
            chunk("rt", "ticket", vec![1.0, 0.0]),
            chunk("wiki", "page", vec![1.0, 0.0]),
        ];
        let results = rank(chunks, &[1.0, 0.0], 5, rt_penalty);
        assert_eq!(results[0].chunk.file_name, "page");
        assert!(results[0].distance.abs() < 1e-6);
        assert!((results[1].distance - 0.1).abs() < 1e-6);
        assert_eq!(results[1].rank, 1);
    }

    #[test]
    fn test_penalty_does_not_hide_much_better_match() {
        let chunks = vec![
            chunk("readme", "far", vec![0.0, 1.0]),
            chunk("rt", "close", vec![1.0, 0.0]),
        ];
        let results = rank(chunks, &[1.0, 0.0], 5, rt_penalty);
        assert_eq!(results[0].chunk.file_name, "close");
    }

    #[test]
    fn test_ties_keep_insertion_order_and_truncate() {
        let chunks = (0..6)
            .map(|i| chunk("wiki", &format!("c{}", i), vec![1.0, 1.0]))
            .collect();
        let results = rank(chunks, &[1.0, 1.0], 3, rt_penalty);
        let names: Vec<_> = results.iter().map(|r| r.chunk.file_name.as_str()).collect();
        assert_eq!(names, vec!["c0", "c1", "c2"]);
    }

    #[test]
    fn test_nan_embedding_ranks_last() {
        let chunks = vec![
            chunk("wiki", "c0", vec![1.0, 0.5]),
            chunk("wiki", "broken", vec![f32::NAN, 1.0]),
            chunk("wiki", "c1", vec![1.0, 0.3]),
            chunk("wiki", "c2", vec![1.0, 0.0]),
        ];
        let results = rank(chunks, &[1.0, 0.0], 4, rt_penalty);
        let names: Vec<_> = results.iter().map(|r| r.chunk.file_name.as_str()).collect();
        assert_eq!(names, vec!["c2", "c1", "c0", "broken"]);
        assert!(results[3].distance.is_nan());
        assert_eq!(results[3].rank, 3);
    }

    #[test]
    fn test_retrieval_query() {
        assert_eq!(retrieval_query(None, "q"), "q");
        assert_eq!(retrieval_query(Some("answer"), "q"), "answer\nq");
    }
}

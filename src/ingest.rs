//! Ingestion pipeline: source directory → chunking → embedding → storage.
//!
//! Loading is incremental at file granularity. A document is identified by
//! `(tag, file_name)`; if any chunk of it is already stored the file is
//! skipped, so re-running `stuart load` only picks up new files. Documents
//! that may change must be deleted from the `chunks` table to be reloaded.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::chunk::{chunk_text, slice_chars, ChunkParams};
use crate::config::{Config, SourceConfig};
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::{Chunk, Document};
use crate::store::{ChunkStore, SqliteStore};

/// Bodies shorter than this many characters are not worth indexing.
const MIN_BODY_CHARS: usize = 5;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadStats {
    pub files_new: u64,
    pub files_known: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub chunks_new: u64,
    pub chunk_time: Duration,
    pub embed_time: Duration,
    pub store_time: Duration,
}

impl LoadStats {
    fn absorb(&mut self, other: &LoadStats) {
        self.files_new += other.files_new;
        self.files_known += other.files_known;
        self.files_skipped += other.files_skipped;
        self.files_failed += other.files_failed;
        self.chunks_new += other.chunks_new;
        self.chunk_time += other.chunk_time;
        self.embed_time += other.embed_time;
        self.store_time += other.store_time;
    }
}

/// Candidate files of a source directory: top level only, sorted by name,
/// filtered by the source's include globs.
pub fn scan_source(source: &SourceConfig) -> Result<Vec<(String, PathBuf)>> {
    if !source.dir.is_dir() {
        bail!(
            "source '{}': directory does not exist: {}",
            source.name,
            source.dir.display()
        );
    }
    let include_set = build_globset(&source.include_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(&source.dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !include_set.is_match(&file_name) {
            tracing::info!(source = %source.name, file = %file_name, "skipping file with unknown extension");
            continue;
        }
        files.push((file_name, entry.path().to_path_buf()));
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Chunk, embed and store one document.
///
/// All chunks of the document are written in one transaction, so a failure
/// never leaves a partially indexed file behind.
pub async fn ingest_document(
    store: &dyn ChunkStore,
    embedder: &dyn EmbeddingProvider,
    doc: &Document,
    params: &ChunkParams,
    batch_size: usize,
    stats: &mut LoadStats,
) -> Result<usize> {
    let t0 = Instant::now();
    let spans = chunk_text(&doc.body, params)
        .with_context(|| format!("chunking {} ({})", doc.file_name, doc.tag))?;
    let texts: Vec<String> = spans
        .iter()
        .map(|span| slice_chars(&doc.body, *span).to_string())
        .collect();
    stats.chunk_time += t0.elapsed();

    let t0 = Instant::now();
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let embedded = embedder.embed(batch).await?;
        if embedded.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                embedded.len(),
                batch.len()
            );
        }
        vectors.extend(embedded);
    }
    stats.embed_time += t0.elapsed();

    let chunks: Vec<Chunk> = spans
        .iter()
        .zip(texts)
        .zip(vectors)
        .map(|((span, body), embedding)| Chunk {
            tag: doc.tag.clone(),
            file_name: doc.file_name.clone(),
            start_pos: span.start,
            end_pos: span.end,
            body,
            embedding,
        })
        .collect();

    let t0 = Instant::now();
    store.insert_chunks(&chunks).await?;
    stats.store_time += t0.elapsed();

    Ok(chunks.len())
}

/// Load every new file of one source.
pub async fn load_source(
    store: &dyn ChunkStore,
    embedder: &dyn EmbeddingProvider,
    source: &SourceConfig,
    params: &ChunkParams,
    batch_size: usize,
) -> Result<LoadStats> {
    let mut stats = LoadStats::default();

    for (file_name, path) in scan_source(source)? {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let body = match String::from_utf8(bytes) {
            Ok(body) => body,
            Err(_) => {
                tracing::info!(file = %file_name, "skipping file with invalid unicode");
                stats.files_skipped += 1;
                continue;
            }
        };
        if body.chars().count() < MIN_BODY_CHARS {
            tracing::info!(file = %file_name, "skipping (almost) empty file");
            stats.files_skipped += 1;
            continue;
        }
        if store.has_document(&source.tag, &file_name).await? {
            stats.files_known += 1;
            continue;
        }

        let doc = Document {
            tag: source.tag.clone(),
            file_name,
            body,
        };
        match ingest_document(store, embedder, &doc, params, batch_size, &mut stats).await {
            Ok(n) => {
                tracing::debug!(file = %doc.file_name, chunks = n, "document loaded");
                stats.files_new += 1;
                stats.chunks_new += n as u64;
            }
            Err(e) if e.downcast_ref::<crate::chunk::ChunkError>().is_some() => {
                tracing::error!(file = %doc.file_name, error = %e, "document not loaded");
                stats.files_failed += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(stats)
}

/// `stuart load`: ingest all configured sources, or only the named one.
pub async fn run_load(config: &Config, only: Option<&str>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Loading requires embeddings. Set [embedding] provider in config.");
    }
    let sources: Vec<&SourceConfig> = config
        .sources
        .iter()
        .filter(|s| only.map_or(true, |name| s.name == name))
        .collect();
    if sources.is_empty() {
        match only {
            Some(name) => bail!("No source named '{}' in config", name),
            None => bail!("No [[sources]] configured"),
        }
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let embedder = embedding::create_provider(&config.embedding)?;

    let mut total = LoadStats::default();
    for source in sources {
        let params = source.chunk_params(&config.chunking);
        let stats = load_source(
            &store,
            embedder.as_ref(),
            source,
            &params,
            config.embedding.batch_size,
        )
        .await?;

        println!("load {} (tag: {})", source.name, source.tag);
        println!("  new files: {}", stats.files_new);
        println!("  known files: {}", stats.files_known);
        println!("  skipped files: {}", stats.files_skipped);
        if stats.files_failed > 0 {
            println!("  failed files: {}", stats.files_failed);
        }
        println!("  new chunks: {}", stats.chunks_new);
        total.absorb(&stats);
    }

    println!(
        "timing: chunking {:.3}s, embedding {:.3}s, storing {:.3}s",
        total.chunk_time.as_secs_f64(),
        total.embed_time.as_secs_f64(),
        total.store_time.as_secs_f64()
    );
    println!("documents stored: {}", store.document_count().await?);
    println!("chunks stored: {}", store.chunk_count().await?);
    println!("ok");

    pool.close().await;
    Ok(())
}

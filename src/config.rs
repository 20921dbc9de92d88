//! TOML configuration parsing and validation.
//!
//! Every component receives the parts of [`Config`] it needs at construction
//! time. Nothing reads configuration from globals after [`load_config`]
//! returns; the shared worker secret is resolved here once, falling back to
//! the `PRESHARED_SECRET` environment variable when the file omits it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkParams;

/// Environment variable consulted when no secret is set in the file.
pub const SECRET_ENV: &str = "PRESHARED_SECRET";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Default chunking window, in characters.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_len")]
    pub chunk_len: usize,
    #[serde(default = "default_overlap_len")]
    pub overlap_len: usize,
    #[serde(default = "default_hard_limit")]
    pub hard_limit: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_len: default_chunk_len(),
            overlap_len: default_overlap_len(),
            hard_limit: default_hard_limit(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            chunk_len: self.chunk_len,
            overlap_len: self.overlap_len,
            hard_limit: self.hard_limit,
        }
    }
}

fn default_chunk_len() -> usize {
    2000
}
fn default_overlap_len() -> usize {
    250
}
fn default_hard_limit() -> usize {
    2500
}

/// A directory of documents loaded under one tag.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub dir: PathBuf,
    pub tag: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    /// Overrides `[chunking]` for this source only.
    #[serde(default)]
    pub chunking: Option<ChunkingConfig>,
}

fn default_include_globs() -> Vec<String> {
    vec!["*.md".to_string(), "*.txt".to_string()]
}

impl SourceConfig {
    pub fn chunk_params(&self, fallback: &ChunkingConfig) -> ChunkParams {
        self.chunking.as_ref().unwrap_or(fallback).params()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_penalized_tag")]
    pub penalized_tag: String,
    #[serde(default = "default_tag_penalty")]
    pub tag_penalty: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_n: default_top_n(),
            penalized_tag: default_penalized_tag(),
            tag_penalty: default_tag_penalty(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_top_n() -> usize {
    1
}
fn default_penalized_tag() -> String {
    "rt".to_string()
}
fn default_tag_penalty() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers (Ollama, OpenAI-compatible servers).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Chat-completion backend used by the worker.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Name of the environment variable holding a bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_llm_url(),
            model: None,
            api_key_env: None,
            max_tokens: None,
            temperature: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub preshared_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            preshared_secret: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

/// Which queued session `claim` hands out first.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOrder {
    /// Most recently modified first.
    #[default]
    Newest,
    /// Least recently modified first.
    Oldest,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueueConfig {
    #[serde(default)]
    pub claim_order: ClaimOrder,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub preshared_secret: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_malformed_delay_ms")]
    pub malformed_delay_ms: u64,
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            preshared_secret: None,
            poll_interval_ms: default_poll_interval_ms(),
            malformed_delay_ms: default_malformed_delay_ms(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn malformed_delay(&self) -> Duration {
        Duration::from_millis(self.malformed_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_malformed_delay_ms() -> u64 {
    5000
}
fn default_backoff_initial_secs() -> u64 {
    2
}
fn default_backoff_max_secs() -> u64 {
    32
}
fn default_heartbeat_interval_ms() -> u64 {
    2500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Secret the front end expects from the worker, if one is configured.
    pub fn server_secret(&self) -> Option<&str> {
        self.server.preshared_secret.as_deref()
    }

    /// Secret the worker presents to the front end.
    pub fn worker_secret(&self) -> Option<&str> {
        self.worker.preshared_secret.as_deref()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // The file wins; the environment only fills a missing secret.
    let env_secret = std::env::var(SECRET_ENV).ok().filter(|s| !s.is_empty());
    if config.server.preshared_secret.is_none() {
        config.server.preshared_secret = env_secret.clone();
    }
    if config.worker.preshared_secret.is_none() {
        config.worker.preshared_secret = env_secret;
    }

    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .params()
        .validate()
        .context("invalid [chunking] section")?;

    for source in &config.sources {
        if source.tag.trim().is_empty() {
            bail!("sources.{}: tag must not be empty", source.name);
        }
        if let Some(ref chunking) = source.chunking {
            chunking
                .params()
                .validate()
                .with_context(|| format!("invalid chunking for source '{}'", source.name))?;
        }
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.top_n > config.retrieval.top_k {
        bail!(
            "retrieval.top_n ({}) must not exceed retrieval.top_k ({})",
            config.retrieval.top_n,
            config.retrieval.top_k
        );
    }
    if !config.retrieval.tag_penalty.is_finite() {
        bail!("retrieval.tag_penalty must be a finite number");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.worker.backoff_initial_secs == 0 {
        bail!("worker.backoff_initial_secs must be > 0");
    }
    if config.worker.backoff_max_secs < config.worker.backoff_initial_secs {
        bail!("worker.backoff_max_secs must be >= worker.backoff_initial_secs");
    }

    Ok(())
}

//! # Stuart CLI (`stuart`)
//!
//! ## Usage
//!
//! ```bash
//! stuart --config ./config/stuart.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `stuart init` | Create the SQLite database and run schema migrations |
//! | `stuart load` | Chunk and embed documents from configured sources |
//! | `stuart search "<query>"` | Show the top-K retrieved chunks |
//! | `stuart ask "<question>"` | Answer one question without the queue |
//! | `stuart serve` | Start the HTTP front end |
//! | `stuart worker` | Answer queued questions |
//! | `stuart heartbeat` | Report worker liveness only |
//! | `stuart status` | Index size, queue depth and heartbeat age |
//! | `stuart release` | Return stranded jobs to `wait-for-question` |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use stuart::{ask, config, ingest, logging, migrate, search, server, status, worker};

/// Stuart: retrieval-augmented question answering with a separate
/// inference worker.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/stuart.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "stuart",
    about = "Stuart — retrieval-augmented question answering over a local corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/stuart.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Chunk, embed and store documents from the configured sources.
    ///
    /// Documents already loaded under the same (tag, file name) are skipped.
    Load {
        /// Only load the source with this name.
        #[arg(long)]
        source: Option<String>,
    },

    /// Show the chunks retrieved for a query.
    Search {
        query: String,

        /// Number of results (defaults to `[retrieval] top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a single question directly, bypassing the job queue.
    Ask {
        question: String,

        /// Also print the citations of the chunks used as context.
        #[arg(long)]
        sources: bool,
    },

    /// Start the HTTP front end on `[server].bind`.
    Serve,

    /// Run the inference worker until Ctrl-C.
    Worker {
        /// Claim jobs from the database instead of the front end.
        #[arg(long)]
        direct: bool,
    },

    /// Send worker heartbeats until Ctrl-C.
    Heartbeat {
        /// Write heartbeats to the database instead of the front end.
        #[arg(long)]
        direct: bool,
    },

    /// Show index size, sessions per state and worker heartbeat age.
    Status,

    /// Move `processing-question` jobs older than the threshold back to
    /// `wait-for-question`.
    Release {
        /// Age threshold in seconds.
        #[arg(long, default_value_t = 600)]
        older_than: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { source } => {
            ingest::run_load(&cfg, source.as_deref()).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Ask { question, sources } => {
            ask::run_ask(&cfg, &question, sources).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Worker { direct } => {
            worker::run_worker(&cfg, direct).await?;
        }
        Commands::Heartbeat { direct } => {
            worker::run_heartbeat(&cfg, direct).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Release { older_than } => {
            status::run_release(&cfg, Duration::from_secs(older_than)).await?;
        }
    }

    Ok(())
}

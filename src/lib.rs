//! # Stuart
//!
//! Retrieval-augmented question answering over a local document corpus,
//! split into a request-accepting front end and a separate inference worker
//! that communicate through a durable job queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────┐
//! │ Sources  │──▶│ Chunk+Embed │──▶│  SQLite  │
//! │ *.md/txt │   │  (ingest)   │   │  chunks  │
//! └──────────┘   └─────────────┘   └────┬─────┘
//!                                       │ retrieve
//! ┌──────────┐  claim / finish     ┌────┴─────┐
//! │  Front   │◀───────────────────▶│  Worker  │──▶ LLM
//! │   end    │   (HTTP, secret)    └──────────┘
//! └────┬─────┘
//!      │ session table (job queue)
//!      ▼
//!   SQLite
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! stuart init                    # create database
//! stuart load                    # chunk and embed configured sources
//! stuart search "tax residency"  # inspect retrieval
//! stuart serve                   # start the front end
//! stuart worker                  # answer queued questions
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Boundary-aware text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Chat completion abstraction |
//! | [`ingest`] | Source scanning and indexing |
//! | [`search`] | Vector retrieval with tag penalty |
//! | [`context`] | Prompt assembly for first and follow-up turns |
//! | [`store`] | Chunk and session repositories |
//! | [`queue`] | Session state machine |
//! | [`liveness`] | Worker heartbeat |
//! | [`wire`] | Front end ↔ worker payloads |
//! | [`worker`] | Claim / answer / finish loop |
//! | [`server`] | HTTP front end |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ask;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod liveness;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod search;
pub mod server;
pub mod status;
pub mod store;
pub mod wire;
pub mod worker;

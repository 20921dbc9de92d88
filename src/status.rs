//! Operator view of the database: index size, queue depth per state and
//! worker liveness. Used by `stuart status`; `stuart release` lives here too
//! since it acts on what `status` reveals.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::liveness::{self, NEVER_AGE};
use crate::queue::JobQueue;
use crate::store::{ChunkStore, SqliteStore};

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let queue = JobQueue::new(store.clone(), config.queue.claim_order);

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Stuart — Status");
    println!("===============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", store.document_count().await?);
    println!("  Chunks:      {}", store.chunk_count().await?);
    println!();
    println!("  {:<22} {:>8} {:>14}", "STATE", "SESSIONS", "NEWEST");
    println!("  {}", "-".repeat(46));

    let counts = queue.state_counts().await?;
    let ages = queue.latest_age_by_state().await?;
    for ((state, count), age) in counts.iter().zip(ages.iter()) {
        let newest = age
            .age
            .map(|a| format_age(a))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<22} {:>8} {:>14}", state.as_str(), count, newest);
    }

    let heartbeat = liveness::heartbeat_age(store.as_ref()).await?;
    println!();
    if heartbeat >= NEVER_AGE {
        println!("  Worker heartbeat: never");
    } else {
        println!("  Worker heartbeat: {}", format_age(heartbeat));
    }

    pool.close().await;
    Ok(())
}

/// `stuart release`: return stranded jobs to `wait-for-question`.
pub async fn run_release(config: &Config, older_than: Duration) -> Result<()> {
    let pool = db::connect(config).await?;
    let queue = JobQueue::new(
        Arc::new(SqliteStore::new(pool.clone())),
        config.queue.claim_order,
    );

    let released = queue.release_stuck(older_than).await?;
    for id in &released {
        println!("  released {}", id);
    }
    println!("released {} job(s)", released.len());

    pool.close().await;
    Ok(())
}

fn format_age(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(5.4), "5s ago");
        assert_eq!(format_age(125.0), "2m ago");
        assert_eq!(format_age(7200.0), "2h ago");
        assert_eq!(format_age(200_000.0), "2d ago");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}

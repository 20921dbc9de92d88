//! Worker liveness.
//!
//! The worker (or a standalone `stuart heartbeat` process) records a
//! timestamp every few seconds; the front end and operators read its age.

use anyhow::Result;

use crate::queue::{now_secs, now_secs_f64};
use crate::store::JobStore;

/// Age reported when no heartbeat was ever recorded.
pub const NEVER_AGE: f64 = 1e9;

pub async fn heartbeat(store: &dyn JobStore) -> Result<()> {
    store.record_heartbeat(now_secs()).await
}

/// Seconds since the last heartbeat, or [`NEVER_AGE`].
pub async fn heartbeat_age(store: &dyn JobStore) -> Result<f64> {
    Ok(age_since(store.last_heartbeat().await?, now_secs_f64()))
}

pub async fn is_stale(store: &dyn JobStore, threshold_secs: f64) -> Result<bool> {
    Ok(heartbeat_age(store).await? > threshold_secs)
}

fn age_since(last: Option<i64>, now: f64) -> f64 {
    match last {
        Some(ts) => (now - ts as f64).max(0.0),
        None => NEVER_AGE,
    }
}

//! Background filesystem probes
//!
//! Existence checks for whole batches of paths run on the blocking pool so
//! no caller thread ever stalls on a slow disk or network mount.

use std::path::PathBuf;
use tokio::task::spawn_blocking;
use tracing::warn;

/// Check a batch of paths for existence, off the calling thread.
///
/// The result vector is index-aligned with `paths`.
pub async fn stat_many(paths: Vec<PathBuf>) -> Vec<bool> {
    stat_many_min_size(paths, 1).await
}

/// Like [`stat_many`], but a path only counts when the file holds at least
/// `min_bytes`.
pub async fn stat_many_min_size(paths: Vec<PathBuf>, min_bytes: u64) -> Vec<bool> {
    let len = paths.len();
    let result = spawn_blocking(move || {
        paths
            .iter()
            .map(|p| {
                std::fs::metadata(p)
                    .map(|m| m.is_file() && m.len() >= min_bytes)
                    .unwrap_or(false)
            })
            .collect::<Vec<bool>>()
    })
    .await;

    match result {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "stat batch worker failed");
            vec![false; len]
        }
    }
}

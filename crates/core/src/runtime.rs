//! # Runtime Directory
//!
//! File system locations for the `.stigmergy` runtime directory: the
//! database, per-task worktrees, and shutdown snapshots all live here.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::fs;

/// Get the runtime directory path (.stigmergy)
///
/// `STIGMERGY_RUNTIME_PATH` overrides the default of `<cwd>/.stigmergy`.
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("STIGMERGY_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".stigmergy")
}

/// Default database path inside the runtime directory
pub fn db_path() -> PathBuf {
    get_runtime_path().join("stigmergy.db")
}

/// Directory holding isolated worktrees, one per task attempt
pub fn worktrees_dir() -> PathBuf {
    get_runtime_path().join("worktrees")
}

/// Directory holding graph snapshots written on shutdown
pub fn snapshots_dir() -> PathBuf {
    get_runtime_path().join("snapshots")
}

/// Ensure the runtime directory exists
pub async fn ensure_runtime_dir() -> Result<PathBuf> {
    let path = get_runtime_path();
    fs::create_dir_all(&path)
        .await
        .with_context(|| format!("Failed to create runtime directory: {:?}", path))?;
    Ok(path)
}

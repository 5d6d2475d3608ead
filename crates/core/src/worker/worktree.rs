//! # Git Worktree Isolation
//!
//! Each task attempt gets its own branch and working directory checked out
//! from the project's base line. Branches are named `stigmergy/<workspace>`
//! and worktrees live under `.stigmergy/worktrees/<workspace>`.

use anyhow::{Context, Result};
use git2::{Repository, StatusOptions};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::runtime;

/// Result of a merge back to the base line
#[derive(Debug)]
pub enum MergeResult {
    /// Merge completed successfully
    Success,
    /// Merge has conflicts that need resolution
    Conflicts(Vec<String>),
}

/// Get the worktree path for a workspace
pub fn worktree_path(workspace_id: &str) -> PathBuf {
    runtime::worktrees_dir().join(workspace_id)
}

/// Create a new isolated worktree for a task attempt
///
/// Creates branch `stigmergy/<workspace_id>` from HEAD and checks it out in
/// `.stigmergy/worktrees/<workspace_id>`.
pub fn create_worktree(project_root: &Path, workspace_id: &str) -> Result<PathBuf> {
    let repo = Repository::open(project_root)
        .with_context(|| format!("Failed to open repository at {:?}", project_root))?;

    let branch_name = format!("stigmergy/{}", workspace_id);
    let path = worktree_path(workspace_id);

    std::fs::create_dir_all(&path)
        .with_context(|| format!("Failed to create worktree directory: {:?}", path))?;

    let head = repo.head().context("Failed to get HEAD")?;
    let head_commit = head.peel_to_commit().context("Failed to get HEAD commit")?;

    repo.branch(&branch_name, &head_commit, false)
        .with_context(|| format!("Failed to create branch: {}", branch_name))?;

    // git CLI is more reliable than libgit2 for worktree plumbing
    let output = Command::new("git")
        .args(["worktree", "add", &path.to_string_lossy(), &branch_name])
        .current_dir(project_root)
        .output()
        .context("Failed to run git worktree add")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(path)
}

/// Commit all changes in a worktree
///
/// Returns true if a commit was created, false when there was nothing to
/// commit.
pub fn commit_all(worktree: &Path, message: &str) -> Result<bool> {
    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(worktree)
        .output()
        .context("Failed to run git add")?;
    if !add.status.success() {
        return Err(anyhow::anyhow!(
            "git add failed: {}",
            String::from_utf8_lossy(&add.stderr)
        ));
    }

    let commit = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(worktree)
        .output()
        .context("Failed to run git commit")?;

    if !commit.status.success() {
        let stderr = String::from_utf8_lossy(&commit.stderr);
        let stdout = String::from_utf8_lossy(&commit.stdout);
        if stderr.contains("nothing to commit") || stdout.contains("nothing to commit") {
            return Ok(false);
        }
        return Err(anyhow::anyhow!("git commit failed: {}", stderr));
    }

    Ok(true)
}

/// Merge a workspace branch back to main using a squash-style merge
pub fn merge_worktree(project_root: &Path, workspace_id: &str) -> Result<MergeResult> {
    let branch_name = format!("stigmergy/{}", workspace_id);

    let mut checkout = Command::new("git")
        .args(["checkout", "main"])
        .current_dir(project_root)
        .output()
        .context("Failed to checkout main")?;
    if !checkout.status.success() {
        checkout = Command::new("git")
            .args(["checkout", "master"])
            .current_dir(project_root)
            .output()
            .context("Failed to checkout master")?;
    }
    if !checkout.status.success() {
        return Err(anyhow::anyhow!(
            "Failed to checkout main: {}",
            String::from_utf8_lossy(&checkout.stderr)
        ));
    }

    // --no-commit first so conflicts can be detected before committing
    let merge = Command::new("git")
        .args(["merge", "--no-commit", "--no-ff", &branch_name])
        .current_dir(project_root)
        .output()
        .context("Failed to run git merge")?;

    if !merge.status.success() {
        let status = Command::new("git")
            .args(["diff", "--name-only", "--diff-filter=U"])
            .current_dir(project_root)
            .output()?;

        let conflicts: Vec<String> = String::from_utf8_lossy(&status.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        if !conflicts.is_empty() {
            // leave main clean; the workspace keeps the conflicting work
            Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(project_root)
                .output()
                .ok();
            return Ok(MergeResult::Conflicts(conflicts));
        }

        return Err(anyhow::anyhow!(
            "Merge failed: {}",
            String::from_utf8_lossy(&merge.stderr)
        ));
    }

    let commit = Command::new("git")
        .args(["commit", "-m", &format!("merge workspace {}", workspace_id)])
        .current_dir(project_root)
        .output()
        .context("Failed to commit merge")?;

    if !commit.status.success() {
        let stderr = String::from_utf8_lossy(&commit.stderr);
        if !stderr.contains("nothing to commit") {
            return Err(anyhow::anyhow!("Failed to commit: {}", stderr));
        }
    }

    Ok(MergeResult::Success)
}

/// Delete a worktree and its associated branch
///
/// Safe to call when the worktree or branch no longer exists.
pub fn remove_worktree(project_root: &Path, workspace_id: &str) -> Result<()> {
    let path = worktree_path(workspace_id);
    let branch_name = format!("stigmergy/{}", workspace_id);

    Command::new("git")
        .args(["worktree", "remove", "--force", &path.to_string_lossy()])
        .current_dir(project_root)
        .output()
        .ok();

    if path.exists() {
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to remove worktree directory: {:?}", path))?;
    }

    Command::new("git")
        .args(["branch", "-D", &branch_name])
        .current_dir(project_root)
        .output()
        .ok();

    Ok(())
}

/// Files changed in a worktree relative to its checkout, including untracked
pub fn changed_files(worktree: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(worktree)
        .with_context(|| format!("Failed to open worktree at {:?}", worktree))?;

    let mut options = StatusOptions::new();
    options.include_untracked(true);

    let statuses = repo
        .statuses(Some(&mut options))
        .context("Failed to read worktree status")?;

    let files = statuses
        .iter()
        .filter_map(|entry| entry.path().map(String::from))
        .collect();
    Ok(files)
}

/// Whether a worktree has no uncommitted changes
pub fn is_clean(worktree: &Path) -> Result<bool> {
    Ok(changed_files(worktree)?.is_empty())
}

/// List workspace ids present under the runtime worktrees directory
pub fn list_workspaces() -> Result<Vec<String>> {
    let dir = runtime::worktrees_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to read worktrees directory: {:?}", dir))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Ok(name) = entry.file_name().into_string() {
                ids.push(name);
            }
        }
    }
    ids.sort();
    Ok(ids)
}

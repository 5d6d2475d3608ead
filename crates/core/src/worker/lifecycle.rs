//! # Worker Lifecycle
//!
//! Ties worktrees and sessions together: spawning a worker means creating an
//! isolated workspace, writing its mission brief, and launching the process
//! inside it. Completion commits and removes the workspace; orphaned
//! workspaces from crashed runs are swept on startup.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::graph::node::Task;
use crate::models::{WorkerCommand, WorkerRole};
use crate::signals::ContextualSignals;

use super::session::{SessionHandle, SessionRegistry};
use super::worktree::{self, MergeResult};

/// State of a task's workspace
#[derive(Debug)]
pub struct WorkspaceStatus {
    pub exists: bool,
    pub clean: bool,
    pub changed_files: Vec<String>,
}

/// Result of an orphan sweep
#[derive(Debug, Default)]
pub struct OrphanReport {
    pub removed: Vec<String>,
    /// Orphans left in place because they had uncommitted work
    pub skipped_dirty: Vec<String>,
}

/// Manages the full life of a worker: workspace, process, cleanup
#[derive(Clone)]
pub struct WorkerLifecycleManager {
    project_root: PathBuf,
    command: WorkerCommand,
    registry: SessionRegistry,
}

impl WorkerLifecycleManager {
    pub fn new(project_root: impl Into<PathBuf>, command: WorkerCommand) -> Self {
        Self {
            project_root: project_root.into(),
            command,
            registry: SessionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Create a workspace for a task attempt, write its mission, and launch
    /// the worker process in it
    pub async fn spawn(
        &self,
        task: &Task,
        role: WorkerRole,
        mission: &str,
    ) -> Result<SessionHandle> {
        let workspace_id = workspace_id(&task.id, task.retry_count);
        let worktree_path = worktree::create_worktree(&self.project_root, &workspace_id)
            .with_context(|| format!("Failed to create workspace for task {}", task.id))?;

        tokio::fs::write(worktree_path.join("MISSION.md"), mission)
            .await
            .context("Failed to write mission brief")?;
        // committed up front so only worker-produced changes ever count as
        // uncommitted work
        worktree::commit_all(&worktree_path, "mission brief")?;

        let handle = SessionHandle::start(
            &task.id,
            &workspace_id,
            worktree_path,
            &self.command,
            role,
        )
        .await?;

        info!(
            task_id = %task.id,
            workspace_id = %workspace_id,
            role = %role.as_str(),
            "Spawned worker"
        );
        self.registry.insert(handle.clone());
        Ok(handle)
    }

    /// Current workspace state for a task; `exists: false` when the task has
    /// no workspace
    pub fn status(&self, task_id: &str) -> Result<WorkspaceStatus> {
        let Some(workspace) = self.workspace_for(task_id)? else {
            return Ok(WorkspaceStatus {
                exists: false,
                clean: true,
                changed_files: Vec::new(),
            });
        };

        let path = worktree::worktree_path(&workspace);
        let changed = worktree::changed_files(&path)?;
        Ok(WorkspaceStatus {
            exists: true,
            clean: changed.is_empty(),
            changed_files: changed,
        })
    }

    /// Commit the task's work, merge it back to the base line, and remove
    /// its workspace
    ///
    /// Returns `None` when the task has no workspace, so completion can be
    /// retried safely. On merge conflicts the workspace is left in place
    /// with its work committed.
    pub async fn complete(&self, task_id: &str) -> Result<Option<MergeResult>> {
        if let Some(handle) = self.registry.remove(task_id) {
            handle.kill().await.ok();
        }

        let Some(workspace) = self.workspace_for(task_id)? else {
            return Ok(None);
        };

        let path = worktree::worktree_path(&workspace);
        if path.exists() {
            worktree::commit_all(&path, &format!("work for task {}", task_id))?;
        }

        let merge = worktree::merge_worktree(&self.project_root, &workspace)?;
        if let MergeResult::Conflicts(files) = &merge {
            warn!(
                task_id = %task_id,
                workspace_id = %workspace,
                conflicts = files.len(),
                "Merge conflicts, workspace kept for resolution"
            );
            return Ok(Some(merge));
        }

        worktree::remove_worktree(&self.project_root, &workspace)?;
        info!(task_id = %task_id, workspace_id = %workspace, "Workspace merged and removed");
        Ok(Some(merge))
    }

    /// Kill the session and delete the workspace without committing
    pub async fn discard(&self, task_id: &str) -> Result<()> {
        if let Some(handle) = self.registry.remove(task_id) {
            handle.kill().await.ok();
        }
        if let Some(workspace) = self.workspace_for(task_id)? {
            worktree::remove_worktree(&self.project_root, &workspace)?;
            info!(task_id = %task_id, workspace_id = %workspace, "Workspace discarded");
        }
        Ok(())
    }

    /// Merge a task's workspace branch back into the project's base line
    ///
    /// Returns `None` when the task has no workspace.
    pub fn merge(&self, task_id: &str) -> Result<Option<MergeResult>> {
        let Some(workspace) = self.workspace_for(task_id)? else {
            return Ok(None);
        };
        let result = worktree::merge_worktree(&self.project_root, &workspace)?;
        Ok(Some(result))
    }

    /// Remove workspaces whose task is no longer active
    ///
    /// Dirty workspaces are left in place and reported so their work is not
    /// silently lost.
    pub fn teardown_orphans(&self, active_task_ids: &[String]) -> Result<OrphanReport> {
        let mut report = OrphanReport::default();

        for workspace in worktree::list_workspaces()? {
            let Some(owner) = task_of_workspace(&workspace) else {
                warn!(workspace_id = %workspace, "Unrecognized workspace name, skipping");
                continue;
            };
            if active_task_ids.iter().any(|id| id == owner) {
                continue;
            }

            let path = worktree::worktree_path(&workspace);
            match worktree::is_clean(&path) {
                Ok(true) => {
                    worktree::remove_worktree(&self.project_root, &workspace)?;
                    info!(workspace_id = %workspace, "Removed orphaned workspace");
                    report.removed.push(workspace);
                }
                Ok(false) => {
                    warn!(
                        workspace_id = %workspace,
                        "Orphaned workspace has uncommitted changes, leaving in place"
                    );
                    report.skipped_dirty.push(workspace);
                }
                Err(e) => {
                    warn!(workspace_id = %workspace, error = %e, "Failed to inspect orphan");
                    report.skipped_dirty.push(workspace);
                }
            }
        }
        Ok(report)
    }

    fn workspace_for(&self, task_id: &str) -> Result<Option<String>> {
        if let Some(handle) = self.registry.get(task_id) {
            return Ok(Some(handle.workspace_id.clone()));
        }
        // multiple attempts leave at most one live workspace, but pick the
        // latest if cleanup ever lagged
        Ok(latest_workspace(worktree::list_workspaces()?, task_id))
    }
}

fn workspace_id(task_id: &str, attempt: u32) -> String {
    format!("{}-a{}", task_id, attempt)
}

/// The task's workspace with the highest attempt number, compared
/// numerically so `a10` outranks `a2`
fn latest_workspace(workspaces: Vec<String>, task_id: &str) -> Option<String> {
    let prefix = format!("{}-a", task_id);
    workspaces
        .into_iter()
        .filter_map(|w| {
            let attempt: u32 = w.strip_prefix(&prefix)?.parse().ok()?;
            Some((attempt, w))
        })
        .max_by_key(|(attempt, _)| *attempt)
        .map(|(_, w)| w)
}

fn task_of_workspace(workspace_id: &str) -> Option<&str> {
    let idx = workspace_id.rfind("-a")?;
    workspace_id[idx + 2..]
        .parse::<u32>()
        .ok()
        .map(|_| &workspace_id[..idx])
}

/// Build the mission brief written into each workspace
///
/// Combines the task itself with contextual guidance and warnings from the
/// signal layer, upstream artifact summaries, and any diagnostic from a
/// previous failed attempt.
pub fn compose_mission(
    task: &Task,
    role: WorkerRole,
    signals: &ContextualSignals,
    upstream: &[String],
    diagnostic: Option<&str>,
) -> String {
    let mut brief = String::new();
    brief.push_str(&format!("# Mission: {}\n\n", task.title));
    brief.push_str(&format!("Role: {}\n", role.as_str()));
    brief.push_str(&format!("Stage: {}\n\n", task.stage.as_str()));
    brief.push_str(&task.description);
    brief.push('\n');

    if !signals.guidance.is_empty() {
        brief.push_str("\n## Guidance from prior work\n\n");
        for signal in &signals.guidance {
            brief.push_str(&format!(
                "- ({:.2}) {}\n",
                signal.strength, signal.context
            ));
        }
    }

    if !signals.warnings.is_empty() {
        brief.push_str("\n## Warnings\n\n");
        for signal in &signals.warnings {
            brief.push_str(&format!(
                "- ({:.2}) {}\n",
                signal.strength, signal.context
            ));
        }
    }

    if !upstream.is_empty() {
        brief.push_str("\n## Upstream artifacts\n\n");
        for artifact in upstream {
            brief.push_str(&format!("- {}\n", artifact));
        }
    }

    if let Some(diagnostic) = diagnostic {
        brief.push_str("\n## Diagnostic from previous attempt\n\n");
        brief.push_str(diagnostic);
        brief.push('\n');
    }

    brief
}

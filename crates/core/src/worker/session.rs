//! # Worker Sessions
//!
//! A session is one running worker process bound to a task attempt. Output
//! is captured as it streams so a partially-complete session can still be
//! inspected, and the final transcript is scanned for the impasse marker.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::graph::node::generate_id;
use crate::models::{WorkerCommand, WorkerRole};

/// Marker a worker prints when it cannot make progress on its task
pub const IMPASSE_MARKER: &str = "IMPASSE:";

/// Optional usage report line: `USAGE: tokens=<n> cost=<f>`
const USAGE_MARKER: &str = "USAGE:";

/// Final result of a worker session
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub success: bool,
    /// Worker declared it cannot proceed
    pub impasse: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// Handle to a running worker process
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub task_id: String,
    pub workspace_id: String,
    pub worktree_path: PathBuf,
    pub role: WorkerRole,
    pub started_at: DateTime<Utc>,
    child: Arc<Mutex<Option<Child>>>,
    capture: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    output: Arc<StdMutex<String>>,
}

impl SessionHandle {
    /// Spawn the worker process inside its worktree
    pub(crate) async fn start(
        task_id: &str,
        workspace_id: &str,
        worktree_path: PathBuf,
        command: &WorkerCommand,
        role: WorkerRole,
    ) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&worktree_path)
            .env("STIGMERGY_TASK_ID", task_id)
            .env("STIGMERGY_ROLE", role.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker: {}", command.program))?;

        let output = Arc::new(StdMutex::new(String::new()));
        let mut capture = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            capture.push(capture_stream(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            capture.push(capture_stream(stderr, output.clone()));
        }

        let handle = Self {
            id: generate_id("session"),
            task_id: task_id.to_string(),
            workspace_id: workspace_id.to_string(),
            worktree_path,
            role,
            started_at: Utc::now(),
            child: Arc::new(Mutex::new(Some(child))),
            capture: Arc::new(Mutex::new(capture)),
            output,
        };

        debug!(
            session_id = %handle.id,
            task_id = %handle.task_id,
            role = %role.as_str(),
            "Worker session started"
        );
        Ok(handle)
    }

    /// Output captured so far
    pub fn output_snapshot(&self) -> String {
        self.output.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Wait for the process to exit and return the parsed outcome
    pub async fn wait(&self) -> Result<WorkerOutcome> {
        let status = {
            let mut guard = self.child.lock().await;
            let child = guard
                .as_mut()
                .context("Session has already been waited on")?;
            let status = child.wait().await.context("Failed to wait on worker")?;
            *guard = None;
            status
        };

        // drain capture tasks so the full transcript is visible
        for handle in self.capture.lock().await.drain(..) {
            let _ = handle.await;
        }

        let output = self.output_snapshot();
        Ok(parse_outcome(status.success(), status.code(), &output))
    }

    /// Kill the worker process if it is still running
    pub async fn kill(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(session_id = %self.id, error = %e, "Failed to kill worker");
            }
            *guard = None;
        }
        Ok(())
    }
}

fn capture_stream<R: AsyncRead + Unpin + Send + 'static>(
    stream: R,
    output: Arc<StdMutex<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut buffer) = output.lock() {
                buffer.push_str(&line);
                buffer.push('\n');
            }
        }
    })
}

fn parse_outcome(exited_ok: bool, exit_code: Option<i32>, output: &str) -> WorkerOutcome {
    let mut impasse = false;
    let mut tokens_used = None;
    let mut cost_usd = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with(IMPASSE_MARKER) {
            impasse = true;
        } else if let Some(rest) = line.strip_prefix(USAGE_MARKER) {
            for field in rest.split_whitespace() {
                if let Some(value) = field.strip_prefix("tokens=") {
                    tokens_used = value.parse().ok();
                } else if let Some(value) = field.strip_prefix("cost=") {
                    cost_usd = value.parse().ok();
                }
            }
        }
    }

    WorkerOutcome {
        success: exited_ok && !impasse,
        impasse,
        exit_code,
        output: output.to_string(),
        tokens_used,
        cost_usd,
    }
}

/// Live sessions keyed by task id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<StdMutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(handle.task_id.clone(), handle);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<SessionHandle> {
        self.inner.lock().ok()?.get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<SessionHandle> {
        self.inner.lock().ok()?.remove(task_id)
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every live session, e.g. during shutdown
    pub async fn kill_all(&self) {
        let handles: Vec<SessionHandle> = self
            .inner
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for handle in handles {
            handle.kill().await.ok();
            self.remove(&handle.task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcome_success() {
        let outcome = parse_outcome(true, Some(0), "did the work\nall done\n");
        assert!(outcome.success);
        assert!(!outcome.impasse);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn test_parse_outcome_impasse_overrides_exit_code() {
        let outcome = parse_outcome(
            true,
            Some(0),
            "tried everything\nIMPASSE: dependency artifact is missing\n",
        );
        assert!(!outcome.success);
        assert!(outcome.impasse);
    }

    #[test]
    fn test_parse_outcome_usage_line() {
        let outcome = parse_outcome(true, Some(0), "USAGE: tokens=1200 cost=0.35\n");
        assert_eq!(outcome.tokens_used, Some(1200));
        assert_eq!(outcome.cost_usd, Some(0.35));
    }

    #[test]
    fn test_parse_outcome_failure_exit() {
        let outcome = parse_outcome(false, Some(1), "panicked\n");
        assert!(!outcome.success);
        assert!(!outcome.impasse);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_session_runs_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let command = WorkerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo hello from worker".to_string()],
        };
        let handle = SessionHandle::start(
            "task-1",
            "task-1-a0",
            dir.path().to_path_buf(),
            &command,
            WorkerRole::Implementer,
        )
        .await
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(outcome.success);
        assert!(outcome.output.contains("hello from worker"));
    }

    #[tokio::test]
    async fn test_session_impasse_detection() {
        let dir = tempfile::tempdir().unwrap();
        let command = WorkerCommand {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo 'IMPASSE: cannot resolve interface'".to_string(),
            ],
        };
        let handle = SessionHandle::start(
            "task-2",
            "task-2-a0",
            dir.path().to_path_buf(),
            &command,
            WorkerRole::Prototyper,
        )
        .await
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.impasse);
    }

    #[tokio::test]
    async fn test_registry_tracks_and_kills_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let command = WorkerCommand {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        };
        let handle = SessionHandle::start(
            "task-3",
            "task-3-a0",
            dir.path().to_path_buf(),
            &command,
            WorkerRole::Generalist,
        )
        .await
        .unwrap();
        registry.insert(handle);

        assert_eq!(registry.active_task_ids(), vec!["task-3".to_string()]);
        registry.kill_all().await;
        assert!(registry.is_empty());
    }
}

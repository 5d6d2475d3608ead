//! # Task Scheduler
//!
//! Drives a project to completion: repeatedly spawns workers for every task
//! whose dependencies are satisfied, waits on a single completion channel,
//! advances finished tasks through their workflow, and hands failures to
//! the recovery engine. Signal decay runs opportunistically between
//! completions so no background timer is needed.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::graph::db::GraphDb;
use crate::graph::node::{Task, TaskStatus};
use crate::graph::snapshot::SnapshotManager;
use crate::graph::store::KnowledgeStore;
use crate::models::OrchestratorConfig;
use crate::recovery::{ErrorContext, ErrorKind, RecoveryEngine, RecoveryStrategy, Severity};
use crate::runtime;
use crate::signals::{SignalCoordinator, SignalKind, SignalPattern};
use crate::worker::{
    compose_mission, MergeResult, SessionHandle, WorkerLifecycleManager, WorkerOutcome,
};
use crate::workflow::{Advance, Stage, WorkflowStateMachine};

use super::budget::{Admission, BudgetTracker};
use super::events::{EventBus, EventKind, OrchestratorEvent};

/// One finished worker session
struct TaskCompletion {
    task_id: String,
    result: Result<WorkerOutcome>,
}

/// Summary of one orchestrator run
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub completed: usize,
    pub retried: usize,
    pub escalated: usize,
    pub decay_cycles: usize,
    /// The run stopped because the budget ran out
    pub budget_stopped: bool,
}

/// Point-in-time view of one task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub stage: Stage,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Requests a graceful stop of a running orchestrator
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The orchestration engine
///
/// Owns the knowledge store, signal layer, worker lifecycle, and recovery
/// engine for one project root.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: KnowledgeStore,
    signals: SignalCoordinator,
    lifecycle: WorkerLifecycleManager,
    workflow: Arc<StdMutex<WorkflowStateMachine>>,
    recovery: RecoveryEngine,
    budget: BudgetTracker,
    snapshots: SnapshotManager,
    events: EventBus,
    shutdown: ShutdownHandle,
}

impl Orchestrator {
    pub fn new(db: &GraphDb, project_root: impl Into<PathBuf>, config: OrchestratorConfig) -> Self {
        let store = KnowledgeStore::new(db);
        let signals = SignalCoordinator::new(db);
        let lifecycle = WorkerLifecycleManager::new(project_root, config.worker.clone());
        let workflow = Arc::new(StdMutex::new(WorkflowStateMachine::new()));
        let recovery = RecoveryEngine::new(
            store.clone(),
            signals.clone(),
            lifecycle.clone(),
            workflow.clone(),
        );
        let budget = BudgetTracker::new(config.budget.clone());
        Self {
            config,
            store,
            signals,
            lifecycle,
            workflow,
            recovery,
            budget,
            snapshots: SnapshotManager::new(db),
            events: EventBus::new(),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            },
        }
    }

    /// Attach an event consumer
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn signals(&self) -> &SignalCoordinator {
        &self.signals
    }

    pub fn lifecycle(&self) -> &WorkerLifecycleManager {
        &self.lifecycle
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Drive a project until no more work can proceed
    ///
    /// Returns when every task is terminal, every remaining task is blocked,
    /// the budget runs out, or a shutdown is requested. In-flight sessions
    /// are always drained before returning.
    pub async fn run(&self, project_id: &str) -> Result<RunReport> {
        runtime::ensure_runtime_dir().await?;
        self.events.emit(
            OrchestratorEvent::new(EventKind::RunStarted)
                .with_data(serde_json::json!({ "project_id": project_id })),
        );

        // workspaces left over from a crashed run
        let active = self.lifecycle.registry().active_task_ids();
        let orphans = self.lifecycle.teardown_orphans(&active)?;
        if !orphans.removed.is_empty() {
            info!(count = orphans.removed.len(), "Swept orphaned workspaces");
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<TaskCompletion>();
        let mut in_flight: usize = 0;
        let mut completions: usize = 0;
        let mut report = RunReport::default();

        loop {
            if self.shutdown.is_requested() {
                break;
            }

            match self.budget.admission() {
                Admission::Exceeded => {
                    warn!(
                        utilization = self.budget.utilization(),
                        "Budget exhausted, stopping run"
                    );
                    self.events.emit(OrchestratorEvent::new(EventKind::BudgetExceeded));
                    report.budget_stopped = true;
                    break;
                }
                Admission::SoftLimit => {
                    warn!(
                        utilization = self.budget.utilization(),
                        "Budget soft limit reached, refusing new work"
                    );
                    self.events.emit(OrchestratorEvent::new(EventKind::BudgetWarning));
                }
                Admission::Admit => {
                    in_flight += self.spawn_ready(project_id, &tx, in_flight).await?;
                }
            }

            if in_flight == 0 {
                // done, or every remaining task is blocked on a failed
                // dependency
                let pending = self
                    .store
                    .list_tasks_by_status(project_id, TaskStatus::Pending)?;
                if !pending.is_empty() {
                    warn!(
                        blocked = pending.len(),
                        "No runnable work left but tasks remain pending"
                    );
                }
                break;
            }

            let completion = tokio::select! {
                biased;
                _ = self.shutdown.notify.notified() => break,
                completion = rx.recv() => completion,
            };
            let Some(completion) = completion else { break };
            in_flight -= 1;
            completions += 1;

            if self
                .handle_completion(completion, &tx, &mut report)
                .await?
            {
                in_flight += 1;
            }

            if self.config.decay_every > 0 && completions % self.config.decay_every == 0 {
                let decayed = self.signals.decay_cycle()?;
                report.decay_cycles += 1;
                self.events.emit(
                    OrchestratorEvent::new(EventKind::DecayCycle).with_data(serde_json::json!({
                        "updated": decayed.updated,
                        "removed": decayed.removed,
                    })),
                );
            }
        }

        self.drain(project_id).await?;
        self.events.emit(OrchestratorEvent::new(EventKind::RunStopped));
        Ok(report)
    }

    /// Re-activate a paused, failed, or impassed task
    ///
    /// Any stale workspace is discarded; the task resumes at its current
    /// stage on the next run.
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status == TaskStatus::Completed || task.status == TaskStatus::Running {
            anyhow::bail!("Task {} is {} and cannot be retried", task_id, task.status.as_str());
        }
        self.lifecycle.discard(task_id).await?;
        self.store
            .update_task_status(task_id, TaskStatus::Pending, None)?;
        if let Ok(mut workflow) = self.workflow.lock() {
            workflow.set_recovery_enabled(task_id, true);
        }
        info!(task_id = %task_id, "Task queued for retry");
        Ok(())
    }

    /// Current state of every task in a project
    pub fn status(&self, project_id: &str) -> Result<Vec<TaskReport>> {
        let tasks = self.store.list_tasks(project_id)?;
        Ok(tasks
            .into_iter()
            .map(|t| TaskReport {
                id: t.id,
                title: t.title,
                status: t.status,
                stage: t.stage,
                retry_count: t.retry_count,
                last_error: t.last_error,
            })
            .collect())
    }

    async fn spawn_ready(
        &self,
        project_id: &str,
        tx: &mpsc::UnboundedSender<TaskCompletion>,
        in_flight: usize,
    ) -> Result<usize> {
        let mut budget_left = self
            .config
            .max_concurrent_tasks
            .saturating_sub(in_flight)
            .min(
                self.config
                    .max_concurrent_agents
                    .saturating_sub(self.lifecycle.registry().len()),
            );
        if budget_left == 0 {
            return Ok(0);
        }

        let mut spawned = 0;
        for task in self.store.ready_tasks(project_id)? {
            if budget_left == 0 {
                break;
            }
            self.spawn_task(&task, tx).await?;
            spawned += 1;
            budget_left -= 1;
        }
        Ok(spawned)
    }

    async fn spawn_task(&self, task: &Task, tx: &mpsc::UnboundedSender<TaskCompletion>) -> Result<()> {
        let role = task.stage.role();
        if let Ok(mut workflow) = self.workflow.lock() {
            if workflow.current_stage(&task.id).is_none() {
                workflow.register_at(&task.id, task.stage);
            }
        }

        let context = self
            .signals
            .contextual(role.as_str(), &task.description, None)?;
        let upstream = self.upstream_artifacts(task)?;
        let mission = compose_mission(task, role, &context, &upstream, None);

        let handle = self.lifecycle.spawn(task, role, &mission).await?;
        let worker = self.store.create_worker(role)?;
        self.store.assign_worker(&task.id, &worker.id)?;
        self.store
            .update_task_status(&task.id, TaskStatus::Running, None)?;

        self.events.emit(
            OrchestratorEvent::new(EventKind::TaskStarted)
                .with_task(&task.id)
                .with_data(serde_json::json!({
                    "stage": task.stage.as_str(),
                    "role": role.as_str(),
                })),
        );
        self.watch(handle, tx);
        Ok(())
    }

    fn watch(&self, handle: SessionHandle, tx: &mpsc::UnboundedSender<TaskCompletion>) {
        let tx = tx.clone();
        let task_id = handle.task_id.clone();
        tokio::spawn(async move {
            let result = handle.wait().await;
            let _ = tx.send(TaskCompletion { task_id, result });
        });
    }

    /// Handle one finished session; returns true when the task is still in
    /// flight because recovery spawned a helper for it
    async fn handle_completion(
        &self,
        completion: TaskCompletion,
        tx: &mpsc::UnboundedSender<TaskCompletion>,
        report: &mut RunReport,
    ) -> Result<bool> {
        let task_id = completion.task_id;

        let outcome = match completion.result {
            Ok(outcome) => outcome,
            Err(e) => {
                // the session itself broke, not the work
                let task = self.store.get_task(&task_id)?;
                return self
                    .recover(
                        &task,
                        ErrorKind::SystemFailure,
                        Severity::Critical,
                        &format!("worker session failed: {:#}", e),
                        tx,
                        report,
                    )
                    .await;
            }
        };

        self.budget
            .record_usage(outcome.tokens_used, outcome.cost_usd);
        let task = self.store.get_task(&task_id)?;

        if outcome.success {
            return self.advance_task(&task, report).await.map(|_| false);
        }

        if task.retry_count < self.config.max_retries {
            self.lifecycle.discard(&task_id).await?;
            self.store.increment_retry(&task_id)?;
            self.store.update_task_status(
                &task_id,
                TaskStatus::Pending,
                Some(&failure_summary(&outcome)),
            )?;
            report.retried += 1;
            self.events
                .emit(OrchestratorEvent::new(EventKind::TaskRetried).with_task(&task_id));
            info!(
                task_id = %task_id,
                attempt = task.retry_count + 1,
                "Task attempt failed, retrying"
            );
            return Ok(false);
        }

        let kind = if outcome.impasse {
            ErrorKind::Impasse
        } else {
            ErrorKind::WorkflowStepError
        };
        self.recover(
            &task,
            kind,
            Severity::Medium,
            &failure_summary(&outcome),
            tx,
            report,
        )
        .await
    }

    async fn advance_task(&self, task: &Task, report: &mut RunReport) -> Result<()> {
        match self.lifecycle.complete(&task.id).await? {
            Some(MergeResult::Conflicts(files)) => {
                // conflicting work is a failure of the stage, not the system
                self.store.update_task_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some(&format!("merge conflicts in {} files", files.len())),
                )?;
                let ctx = ErrorContext::new(
                    ErrorKind::WorkflowStepError,
                    Severity::High,
                    format!("merge conflicts: {}", files.join(", ")),
                    &task.id,
                    &task.project_id,
                    task.stage,
                );
                let outcome = self.recovery.handle(&ctx).await?;
                if outcome.escalated {
                    report.escalated += 1;
                }
                return Ok(());
            }
            Some(MergeResult::Success) | None => {}
        }

        self.signals.emit(
            SignalKind::Guide,
            &format!("completed {} for '{}'", task.stage.as_str(), task.title),
            Some(SignalPattern {
                stage: Some(task.stage.as_str().to_string()),
                outcome: Some("success".to_string()),
                role: Some(task.stage.role().as_str().to_string()),
                complexity: None,
            }),
            0.7,
        )?;

        let advance = self
            .workflow
            .lock()
            .ok()
            .and_then(|mut w| w.advance(&task.id));

        match advance {
            Some(Advance::Moved(next)) => {
                self.store.set_task_stage(&task.id, next)?;
                self.store
                    .update_task_status(&task.id, TaskStatus::Pending, None)?;
                self.events.emit(
                    OrchestratorEvent::new(EventKind::StageCompleted)
                        .with_task(&task.id)
                        .with_data(serde_json::json!({
                            "from": task.stage.as_str(),
                            "to": next.as_str(),
                        })),
                );
                info!(task_id = %task.id, from = task.stage.as_str(), to = next.as_str(), "Stage complete");
            }
            Some(Advance::Terminal) | None => {
                self.store
                    .update_task_status(&task.id, TaskStatus::Completed, None)?;
                if let Ok(mut workflow) = self.workflow.lock() {
                    workflow.remove(&task.id);
                }
                report.completed += 1;
                self.events
                    .emit(OrchestratorEvent::new(EventKind::TaskCompleted).with_task(&task.id));
                info!(task_id = %task.id, "Task completed");
            }
        }
        Ok(())
    }

    async fn recover(
        &self,
        task: &Task,
        kind: ErrorKind,
        severity: Severity,
        message: &str,
        tx: &mpsc::UnboundedSender<TaskCompletion>,
        report: &mut RunReport,
    ) -> Result<bool> {
        let status = if kind == ErrorKind::Impasse {
            TaskStatus::Impasse
        } else {
            TaskStatus::Failed
        };
        self.store
            .update_task_status(&task.id, status, Some(message))?;
        self.events.emit(
            OrchestratorEvent::new(EventKind::RecoveryTriggered)
                .with_task(&task.id)
                .with_data(serde_json::json!({
                    "kind": kind.as_str(),
                    "severity": severity.as_str(),
                })),
        );

        let ctx = ErrorContext::new(
            kind,
            severity,
            message,
            &task.id,
            &task.project_id,
            task.stage,
        );
        let outcome = self.recovery.handle(&ctx).await?;

        if outcome.escalated {
            report.escalated += 1;
            self.events
                .emit(OrchestratorEvent::new(EventKind::TaskEscalated).with_task(&task.id));
            return Ok(false);
        }

        if matches!(outcome.strategy, RecoveryStrategy::SpawnHelper { .. }) && outcome.executed {
            // the helper session takes the failed task's slot
            if let Some(handle) = self.lifecycle.registry().get(&task.id) {
                self.watch(handle, tx);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn upstream_artifacts(&self, task: &Task) -> Result<Vec<String>> {
        let mut artifacts = Vec::new();
        for dep in self.store.dependencies_of(&task.id)? {
            if dep.status == TaskStatus::Completed {
                artifacts.push(format!("{}: {}", dep.title, dep.description));
            }
        }
        Ok(artifacts)
    }

    async fn drain(&self, project_id: &str) -> Result<()> {
        self.lifecycle.registry().kill_all().await;

        for task in self
            .store
            .list_tasks_by_status(project_id, TaskStatus::Running)?
        {
            self.store.update_task_status(
                &task.id,
                TaskStatus::Paused,
                Some("orchestrator stopped"),
            )?;
        }

        let path = self
            .snapshots
            .write_to_file()
            .await
            .context("Failed to flush shutdown snapshot")?;
        info!(snapshot = %path.display(), "Run drained");
        Ok(())
    }
}

fn failure_summary(outcome: &WorkerOutcome) -> String {
    if outcome.impasse {
        if let Some(line) = outcome
            .output
            .lines()
            .rev()
            .find(|l| l.trim_start().starts_with(crate::worker::IMPASSE_MARKER))
        {
            return line.trim().to_string();
        }
    }
    let tail: Vec<&str> = outcome
        .output
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(3)
        .collect();
    let mut lines: Vec<&str> = tail.into_iter().rev().collect();
    if lines.is_empty() {
        lines.push("worker exited with no output");
    }
    format!(
        "exit code {:?}: {}",
        outcome.exit_code,
        lines.join(" | ")
    )
}

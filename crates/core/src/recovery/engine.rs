//! # Recovery Engine
//!
//! Decides and executes what happens after a worker fails: every failure is
//! recorded in the graph and broadcast as a warning signal before any
//! strategy runs, so even a botched recovery leaves a trail.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{error, info, warn};

use crate::graph::node::TaskStatus;
use crate::graph::store::KnowledgeStore;
use crate::models::WorkerRole;
use crate::signals::{SignalCoordinator, SignalKind, SignalPattern};
use crate::worker::{compose_mission, WorkerLifecycleManager};
use crate::workflow::{Stage, WorkflowStateMachine};

use super::context::{ErrorContext, ErrorKind, RecoveryOutcome, RecoveryStrategy, Severity};

/// Aggregate recovery statistics
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
}

/// Classifies failures and executes the chosen recovery strategy
#[derive(Clone)]
pub struct RecoveryEngine {
    store: KnowledgeStore,
    signals: SignalCoordinator,
    lifecycle: WorkerLifecycleManager,
    workflow: Arc<StdMutex<WorkflowStateMachine>>,
    history: Arc<StdMutex<HashMap<String, Vec<RecoveryOutcome>>>>,
}

impl RecoveryEngine {
    pub fn new(
        store: KnowledgeStore,
        signals: SignalCoordinator,
        lifecycle: WorkerLifecycleManager,
        workflow: Arc<StdMutex<WorkflowStateMachine>>,
    ) -> Self {
        Self {
            store,
            signals,
            lifecycle,
            workflow,
            history: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Pick a strategy for a failure
    ///
    /// Rules apply in priority order: critical system failures get a
    /// debugger, step errors get a generalist when the task still allows
    /// recovery, impasses always get a generalist, everything else goes to
    /// a human.
    pub fn classify(&self, ctx: &ErrorContext) -> RecoveryStrategy {
        if ctx.kind == ErrorKind::SystemFailure && ctx.severity == Severity::Critical {
            return RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Debugger,
            };
        }
        if ctx.kind == ErrorKind::WorkflowStepError && self.recovery_enabled(&ctx.task_id) {
            return RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Generalist,
            };
        }
        if ctx.kind == ErrorKind::Impasse {
            return RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Generalist,
            };
        }
        RecoveryStrategy::Escalate
    }

    /// Handle a failure end to end
    ///
    /// Records the failure and emits a warning signal before executing the
    /// strategy. A strategy that fails to execute degrades to escalation;
    /// escalated failures also pause downstream work according to severity.
    pub async fn handle(&self, ctx: &ErrorContext) -> Result<RecoveryOutcome> {
        let failure = self.store.create_failure(
            &ctx.project_id,
            &ctx.task_id,
            ctx.kind.as_str(),
            ctx.severity.as_str(),
            &ctx.message,
            ctx.stage,
        )?;

        self.signals.emit(
            SignalKind::Warn,
            &ctx.message,
            Some(SignalPattern {
                stage: Some(ctx.stage.as_str().to_string()),
                outcome: Some("failure".to_string()),
                role: Some(ctx.stage.role().as_str().to_string()),
                complexity: None,
            }),
            warn_strength(ctx.severity),
        )?;

        let strategy = self.classify(ctx);

        let mut executed = false;
        let mut escalated = false;
        match &strategy {
            RecoveryStrategy::SpawnHelper { role } => {
                match self.spawn_helper(ctx, *role, &failure.id).await {
                    Ok(()) => executed = true,
                    Err(e) => {
                        error!(
                            task_id = %ctx.task_id,
                            role = %role.as_str(),
                            error = %e,
                            "Helper spawn failed, escalating instead"
                        );
                        self.escalate(ctx)?;
                        escalated = true;
                    }
                }
            }
            RecoveryStrategy::Escalate => {
                self.escalate(ctx)?;
                executed = true;
                escalated = true;
            }
        }

        // siblings are paused only when no helper takes over; a recovered
        // task leaves the rest of the project running
        let paused_tasks = if escalated {
            self.pause_downstream(&ctx.project_id, &ctx.task_id, ctx.severity)?
        } else {
            Vec::new()
        };

        let outcome = RecoveryOutcome {
            task_id: ctx.task_id.clone(),
            kind: ctx.kind,
            severity: ctx.severity,
            strategy,
            executed,
            escalated,
            paused_tasks,
            timestamp: Utc::now(),
        };

        if let Ok(mut history) = self.history.lock() {
            history
                .entry(ctx.task_id.clone())
                .or_default()
                .push(outcome.clone());
        }

        info!(
            task_id = %ctx.task_id,
            kind = %ctx.kind.as_str(),
            severity = %ctx.severity.as_str(),
            escalated,
            paused = outcome.paused_tasks.len(),
            "Recovery handled"
        );
        Ok(outcome)
    }

    /// Pause pending tasks in the project according to failure severity
    ///
    /// High and critical failures pause every pending task; medium pauses
    /// only pending tasks already in design or later stages; low pauses
    /// nothing.
    pub fn pause_downstream(
        &self,
        project_id: &str,
        task_id: &str,
        severity: Severity,
    ) -> Result<Vec<String>> {
        if severity == Severity::Low {
            return Ok(Vec::new());
        }

        let mut paused = Vec::new();
        for pending in self
            .store
            .list_tasks_by_status(project_id, TaskStatus::Pending)?
        {
            if pending.id == task_id {
                continue;
            }
            if severity == Severity::Medium && !is_late_stage(pending.stage) {
                continue;
            }
            self.store.update_task_status(
                &pending.id,
                TaskStatus::Paused,
                Some(&format!("paused: task {} failed", task_id)),
            )?;
            paused.push(pending.id);
        }

        if !paused.is_empty() {
            warn!(
                task_id = %task_id,
                count = paused.len(),
                "Paused downstream tasks"
            );
        }
        Ok(paused)
    }

    /// Recovery history for one task, oldest first
    pub fn history_for(&self, task_id: &str) -> Vec<RecoveryOutcome> {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.get(task_id).cloned())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RecoveryStats {
        let history = match self.history.lock() {
            Ok(h) => h,
            Err(_) => return RecoveryStats::default(),
        };
        let total: usize = history.values().map(Vec::len).sum();
        let successful: usize = history
            .values()
            .flatten()
            .filter(|o| o.executed && !o.escalated)
            .count();
        RecoveryStats {
            total,
            successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
        }
    }

    async fn spawn_helper(
        &self,
        ctx: &ErrorContext,
        role: WorkerRole,
        failure_id: &str,
    ) -> Result<()> {
        let session_output = self
            .lifecycle
            .registry()
            .get(&ctx.task_id)
            .map(|h| h.output_snapshot());

        let diagnostic = self.store.create_diagnostic(
            &ctx.project_id,
            &ctx.task_id,
            &ctx.message,
            session_output,
            Some(failure_id),
        )?;

        // previous attempt's workspace goes away before the helper starts
        self.lifecycle.discard(&ctx.task_id).await?;
        self.store.increment_retry(&ctx.task_id)?;
        let task = self.store.get_task(&ctx.task_id)?;

        let context_signals =
            self.signals
                .contextual(role.as_str(), &task.description, None)?;
        let mission = compose_mission(
            &task,
            role,
            &context_signals,
            &[],
            Some(&diagnostic.summary),
        );

        self.lifecycle
            .spawn(&task, role, &mission)
            .await
            .with_context(|| format!("Failed to spawn {} helper", role.as_str()))?;

        let worker = self.store.create_worker(role)?;
        self.store.assign_worker(&ctx.task_id, &worker.id)?;
        self.store
            .update_task_status(&ctx.task_id, TaskStatus::Running, None)?;
        Ok(())
    }

    fn escalate(&self, ctx: &ErrorContext) -> Result<()> {
        self.store.create_escalated_error(
            &ctx.project_id,
            &ctx.task_id,
            &ctx.message,
            ctx.severity.as_str(),
        )?;
        self.store
            .update_task_status(&ctx.task_id, TaskStatus::Failed, Some(&ctx.message))?;
        Ok(())
    }

    fn recovery_enabled(&self, task_id: &str) -> bool {
        self.workflow
            .lock()
            .map(|w| w.recovery_enabled(task_id))
            .unwrap_or(true)
    }
}

fn warn_strength(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.4,
        Severity::Medium => 0.6,
        Severity::High => 0.8,
        Severity::Critical => 1.0,
    }
}

fn is_late_stage(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::ArchitectureDesign | Stage::Implementation | Stage::TestExecution
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::db::GraphDb;
    use crate::models::WorkerCommand;

    fn engine() -> (RecoveryEngine, KnowledgeStore, SignalCoordinator) {
        let db = GraphDb::open_in_memory().unwrap();
        let store = KnowledgeStore::new(&db);
        let signals = SignalCoordinator::new(&db);
        let lifecycle = WorkerLifecycleManager::new(".", WorkerCommand::default());
        let workflow = Arc::new(StdMutex::new(WorkflowStateMachine::new()));
        (
            RecoveryEngine::new(store.clone(), signals.clone(), lifecycle, workflow),
            store,
            signals,
        )
    }

    fn ctx(kind: ErrorKind, severity: Severity, task_id: &str, project_id: &str) -> ErrorContext {
        ErrorContext::new(
            kind,
            severity,
            "database connection refused",
            task_id,
            project_id,
            Stage::Implementation,
        )
    }

    #[test]
    fn test_critical_system_failure_gets_debugger() {
        let (engine, store, _signals) = engine();
        let project = store.create_project("p").unwrap();
        let task = store
            .create_task(&project.id, "t", "", 1)
            .unwrap();
        let strategy = engine.classify(&ctx(
            ErrorKind::SystemFailure,
            Severity::Critical,
            &task.id,
            &project.id,
        ));
        assert_eq!(
            strategy,
            RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Debugger
            }
        );
    }

    #[test]
    fn test_step_error_respects_recovery_flag() {
        let (engine, store, _signals) = engine();
        let project = store.create_project("p").unwrap();
        let task = store
            .create_task(&project.id, "t", "", 1)
            .unwrap();

        // unregistered tasks default to recovery enabled
        let strategy = engine.classify(&ctx(
            ErrorKind::WorkflowStepError,
            Severity::Medium,
            &task.id,
            &project.id,
        ));
        assert_eq!(
            strategy,
            RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Generalist
            }
        );

        {
            let mut workflow = engine.workflow.lock().unwrap();
            workflow.register(&task.id);
            workflow.set_recovery_enabled(&task.id, false);
        }
        let strategy = engine.classify(&ctx(
            ErrorKind::WorkflowStepError,
            Severity::Medium,
            &task.id,
            &project.id,
        ));
        assert_eq!(strategy, RecoveryStrategy::Escalate);
    }

    #[test]
    fn test_impasse_always_gets_generalist() {
        let (engine, store, _signals) = engine();
        let project = store.create_project("p").unwrap();
        let task = store
            .create_task(&project.id, "t", "", 1)
            .unwrap();
        {
            let mut workflow = engine.workflow.lock().unwrap();
            workflow.register(&task.id);
            workflow.set_recovery_enabled(&task.id, false);
        }
        let strategy = engine.classify(&ctx(
            ErrorKind::Impasse,
            Severity::Low,
            &task.id,
            &project.id,
        ));
        assert_eq!(
            strategy,
            RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Generalist
            }
        );
    }

    #[test]
    fn test_timeout_escalates() {
        let (engine, store, _signals) = engine();
        let project = store.create_project("p").unwrap();
        let task = store
            .create_task(&project.id, "t", "", 1)
            .unwrap();
        let strategy = engine.classify(&ctx(
            ErrorKind::Timeout,
            Severity::High,
            &task.id,
            &project.id,
        ));
        assert_eq!(strategy, RecoveryStrategy::Escalate);
    }

    #[test]
    fn test_pause_downstream_by_severity() {
        let (engine, store, _signals) = engine();
        let project = store.create_project("p").unwrap();
        let failed = store.create_task(&project.id, "upstream", "", 1).unwrap();
        let early = store.create_task(&project.id, "early", "", 1).unwrap();
        let late = store.create_task(&project.id, "late", "", 1).unwrap();
        store
            .set_task_stage(&late.id, Stage::Implementation)
            .unwrap();
        store
            .update_task_status(&failed.id, TaskStatus::Failed, Some("boom"))
            .unwrap();

        // low never pauses
        let paused = engine
            .pause_downstream(&project.id, &failed.id, Severity::Low)
            .unwrap();
        assert!(paused.is_empty());

        // medium only pauses pending tasks in late stages
        let paused = engine
            .pause_downstream(&project.id, &failed.id, Severity::Medium)
            .unwrap();
        assert_eq!(paused, vec![late.id.clone()]);
        assert_eq!(
            store.get_task(&early.id).unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(store.get_task(&late.id).unwrap().status, TaskStatus::Paused);

        // high pauses every pending task left in the project
        let paused = engine
            .pause_downstream(&project.id, &failed.id, Severity::High)
            .unwrap();
        assert_eq!(paused, vec![early.id.clone()]);
    }

    #[tokio::test]
    async fn test_escalated_failure_pauses_pending_siblings() {
        let (engine, store, _signals) = engine();
        let project = store.create_project("p").unwrap();
        let task = store.create_task(&project.id, "t", "", 1).unwrap();
        let sibling = store.create_task(&project.id, "sibling", "", 1).unwrap();
        store
            .set_task_stage(&sibling.id, Stage::Implementation)
            .unwrap();

        let outcome = engine
            .handle(&ErrorContext::new(
                ErrorKind::Timeout,
                Severity::High,
                "worker timed out",
                &task.id,
                &project.id,
                Stage::Implementation,
            ))
            .await
            .unwrap();

        assert!(outcome.escalated);
        assert_eq!(outcome.paused_tasks, vec![sibling.id.clone()]);
        assert_eq!(
            store.get_task(&sibling.id).unwrap().status,
            TaskStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_escalation_persists_record_and_warn_signal() {
        let (engine, store, signals) = engine();
        let project = store.create_project("p").unwrap();
        let task = store
            .create_task(&project.id, "t", "", 1)
            .unwrap();

        let outcome = engine
            .handle(&ErrorContext::new(
                ErrorKind::CritiqueFailure,
                Severity::High,
                "tests keep flaking",
                &task.id,
                &project.id,
                Stage::TestExecution,
            ))
            .await
            .unwrap();

        assert!(outcome.escalated);
        assert_eq!(outcome.strategy, RecoveryStrategy::Escalate);
        assert_eq!(store.get_task(&task.id).unwrap().status, TaskStatus::Failed);

        let escalated = store.escalated_errors(&project.id).unwrap();
        assert_eq!(escalated.len(), 1);
        assert_eq!(escalated[0].reason, "tests keep flaking");

        // the failure left a warning trail for future workers
        let active = signals.active_signals().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, SignalKind::Warn);
        assert!((active[0].strength - 0.8).abs() < 1e-9);

        let stats = engine.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.successful, 0);
    }
}

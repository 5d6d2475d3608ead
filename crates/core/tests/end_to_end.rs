//! End-to-end scenarios across the store, signals, recovery, and the full
//! orchestrator loop.

use std::process::Command;
use std::sync::{Arc, Mutex};

use stigmergy_core::graph::{GraphDb, KnowledgeStore, SnapshotManager, TaskStatus};
use stigmergy_core::models::{
    BudgetConfig, OrchestratorConfig, WorkerCommand, WorkerRole,
};
use stigmergy_core::orchestrator::Orchestrator;
use stigmergy_core::recovery::{
    ErrorContext, ErrorKind, RecoveryEngine, RecoveryStrategy, Severity,
};
use stigmergy_core::signals::{SignalCoordinator, SignalKind, SignalQuery};
use stigmergy_core::worker::WorkerLifecycleManager;
use stigmergy_core::workflow::{Stage, WorkflowStateMachine};

#[test]
fn ready_set_follows_dependency_completion() {
    let db = GraphDb::open_in_memory().unwrap();
    let store = KnowledgeStore::new(&db);
    let project = store.create_project("delivery").unwrap();

    let t1 = store
        .create_task(&project.id, "T1", "build the base", 1)
        .unwrap();
    let t2 = store
        .create_task(&project.id, "T2", "build on top", 1)
        .unwrap();
    store.add_dependency(&t2.id, &t1.id).unwrap();

    let ready: Vec<String> = store
        .ready_tasks(&project.id)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![t1.id.clone()]);

    store
        .update_task_status(&t1.id, TaskStatus::Completed, None)
        .unwrap();

    let ready: Vec<String> = store
        .ready_tasks(&project.id)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![t2.id.clone()]);
}

#[test]
fn guide_signal_decays_to_the_floor_and_disappears() {
    let db = GraphDb::open_in_memory().unwrap();
    let signals = SignalCoordinator::new(&db);

    let emitted = signals
        .emit(SignalKind::Guide, "prefer small commits", None, 0.9)
        .unwrap();
    assert!((emitted.decay_rate - 0.05).abs() < 1e-9);

    signals.decay_cycle().unwrap();
    let after_one = signals.get(&emitted.id).unwrap().unwrap();
    assert!((after_one.strength - 0.855).abs() < 1e-9);

    // multiplicative decay is monotonic non-increasing and must eventually
    // push the signal under the 0.1 floor, at which point it is deleted
    let mut previous = after_one.strength;
    let mut cycles = 1;
    loop {
        signals.decay_cycle().unwrap();
        cycles += 1;
        match signals.get(&emitted.id).unwrap() {
            Some(current) => {
                assert!(current.strength <= previous);
                assert!(current.strength > 0.1);
                previous = current.strength;
            }
            None => break,
        }
        assert!(cycles < 100, "signal never reached the floor");
    }

    assert!(signals.query(&SignalQuery::default()).unwrap().is_empty());
    assert!(signals.active_signals().unwrap().is_empty());
}

#[test]
fn critical_system_failure_always_gets_a_debugger() {
    let db = GraphDb::open_in_memory().unwrap();
    let store = KnowledgeStore::new(&db);
    let signals = SignalCoordinator::new(&db);
    let lifecycle = WorkerLifecycleManager::new(".", WorkerCommand::default());
    let workflow = Arc::new(Mutex::new(WorkflowStateMachine::new()));
    let engine = RecoveryEngine::new(store.clone(), signals, lifecycle, workflow.clone());

    let project = store.create_project("p").unwrap();
    let t3 = store.create_task(&project.id, "T3", "", 1).unwrap();

    for recovery_enabled in [true, false] {
        {
            let mut workflow = workflow.lock().unwrap();
            workflow.register(&t3.id);
            workflow.set_recovery_enabled(&t3.id, recovery_enabled);
        }
        let strategy = engine.classify(&ErrorContext::new(
            ErrorKind::SystemFailure,
            Severity::Critical,
            "database file corrupted",
            &t3.id,
            &project.id,
            Stage::Implementation,
        ));
        assert_eq!(
            strategy,
            RecoveryStrategy::SpawnHelper {
                role: WorkerRole::Debugger
            }
        );
    }
}

#[test]
fn invalid_snapshot_is_rejected_without_mutation() {
    let db = GraphDb::open_in_memory().unwrap();
    let store = KnowledgeStore::new(&db);
    let snapshots = SnapshotManager::new(&db);

    let project = store.create_project("p").unwrap();
    store.create_task(&project.id, "keep me", "", 1).unwrap();
    let before = snapshots.save().unwrap();

    let broken = serde_json::json!({
        "version": "1.0",
        "timestamp": "2026-01-01T00:00:00Z",
        "metadata": {},
        "nodes": [],
    });
    assert!(snapshots.restore(&broken).is_err());

    let after = snapshots.save().unwrap();
    assert_eq!(
        before["metadata"]["totalNodes"],
        after["metadata"]["totalNodes"]
    );
    assert_eq!(
        before["metadata"]["totalRelationships"],
        after["metadata"]["totalRelationships"]
    );
}

// Tests that point STIGMERGY_RUNTIME_PATH at a scratch directory must not
// interleave, process env is shared across the test harness threads.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn init_scratch_repo(path: &std::path::Path) {
    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(path)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "fleet@example.com"]);
    run(&["config", "user.name", "fleet"]);
    std::fs::write(path.join("README.md"), "# scratch\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-m", "initial"]);
}

#[tokio::test]
async fn orchestrator_drives_dependent_tasks_to_completion() {
    if !git_available() {
        eprintln!("git unavailable, skipping");
        return;
    }

    let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let repo = tempfile::tempdir().unwrap();
    init_scratch_repo(repo.path());
    let runtime = tempfile::tempdir().unwrap();
    std::env::set_var("STIGMERGY_RUNTIME_PATH", runtime.path());

    let db = GraphDb::open_in_memory().unwrap();
    let config = OrchestratorConfig {
        max_concurrent_tasks: 2,
        max_concurrent_agents: 4,
        max_retries: 1,
        decay_every: 5,
        worker: WorkerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo stage done".to_string()],
        },
        budget: BudgetConfig::default(),
    };
    let orchestrator = Orchestrator::new(&db, repo.path(), config);

    let store = orchestrator.store();
    let project = store.create_project("delivery").unwrap();
    let t1 = store
        .create_task(&project.id, "T1", "lay the groundwork", 2)
        .unwrap();
    let t2 = store
        .create_task(&project.id, "T2", "build the feature", 1)
        .unwrap();
    store.add_dependency(&t2.id, &t1.id).unwrap();

    let report = orchestrator.run(&project.id).await.unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.escalated, 0);
    assert!(!report.budget_stopped);

    for id in [&t1.id, &t2.id] {
        let task = store.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.stage, Stage::TestExecution);
    }

    // every completed stage left a guide signal behind
    assert!(!orchestrator.signals().active_signals().unwrap().is_empty());

    // all workspaces were merged and removed
    assert!(orchestrator.lifecycle().registry().is_empty());
}

#[tokio::test]
async fn clean_orphaned_workspace_is_swept() {
    if !git_available() {
        eprintln!("git unavailable, skipping");
        return;
    }

    let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let repo = tempfile::tempdir().unwrap();
    init_scratch_repo(repo.path());
    let runtime = tempfile::tempdir().unwrap();
    std::env::set_var("STIGMERGY_RUNTIME_PATH", runtime.path());

    let db = GraphDb::open_in_memory().unwrap();
    let store = KnowledgeStore::new(&db);
    let lifecycle = WorkerLifecycleManager::new(
        repo.path(),
        WorkerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "true".to_string()],
        },
    );

    let project = store.create_project("p").unwrap();
    let task = store
        .create_task(&project.id, "T1", "lay the groundwork", 1)
        .unwrap();
    let handle = lifecycle
        .spawn(&task, WorkerRole::Implementer, "# Mission\n\ndo the thing\n")
        .await
        .unwrap();
    handle.wait().await.unwrap();

    // a crashed run leaves the workspace behind with no live session
    lifecycle.registry().remove(&task.id);

    // the worker produced no work, so the workspace holds nothing beyond its
    // committed mission brief and must be collected
    let report = lifecycle.teardown_orphans(&[]).unwrap();
    assert_eq!(report.removed.len(), 1);
    assert!(report.removed[0].starts_with(&task.id));
    assert!(report.skipped_dirty.is_empty());
}

#[tokio::test]
async fn helper_recovery_leaves_sibling_tasks_running() {
    if !git_available() {
        eprintln!("git unavailable, skipping");
        return;
    }

    let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let repo = tempfile::tempdir().unwrap();
    init_scratch_repo(repo.path());
    let runtime = tempfile::tempdir().unwrap();
    std::env::set_var("STIGMERGY_RUNTIME_PATH", runtime.path());

    let db = GraphDb::open_in_memory().unwrap();
    let store = KnowledgeStore::new(&db);
    let signals = SignalCoordinator::new(&db);
    let lifecycle = WorkerLifecycleManager::new(
        repo.path(),
        WorkerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "true".to_string()],
        },
    );
    let workflow = Arc::new(Mutex::new(WorkflowStateMachine::new()));
    let engine = RecoveryEngine::new(
        store.clone(),
        signals,
        lifecycle.clone(),
        workflow,
    );

    let project = store.create_project("p").unwrap();
    let failed = store
        .create_task(&project.id, "T1", "build the parser", 1)
        .unwrap();
    let sibling = store
        .create_task(&project.id, "T2", "write the docs", 1)
        .unwrap();

    let outcome = engine
        .handle(&ErrorContext::new(
            ErrorKind::WorkflowStepError,
            Severity::High,
            "parser stage crashed",
            &failed.id,
            &project.id,
            Stage::Implementation,
        ))
        .await
        .unwrap();

    // a helper took over, so the rest of the project keeps running
    assert!(outcome.executed);
    assert!(!outcome.escalated);
    assert!(outcome.paused_tasks.is_empty());
    assert_eq!(
        store.get_task(&sibling.id).unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        store.get_task(&failed.id).unwrap().status,
        TaskStatus::Running
    );

    lifecycle.registry().kill_all().await;
}

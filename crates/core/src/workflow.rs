//! # Workflow State Machine
//!
//! Per-task pipeline-stage tracking. Stages are a fixed ordered sequence
//! and transitions are strictly forward; each stage maps to the worker
//! role responsible for it.
//!
//! State is held in an explicitly owned table keyed by task id, invalidated
//! by `remove` when a task reaches a terminal status.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::WorkerRole;

/// One stage of the fixed delivery pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Requirements analysis
    #[default]
    Requirements,
    /// Contract formalization
    ContractFormalization,
    /// Prototyping
    Prototyping,
    /// Architecture design
    ArchitectureDesign,
    /// Implementation
    Implementation,
    /// Test execution (final stage)
    TestExecution,
}

impl Stage {
    /// The first stage, assigned on task creation
    pub fn first() -> Self {
        Self::Requirements
    }

    /// The next stage, or None from the final stage
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Requirements => Some(Self::ContractFormalization),
            Self::ContractFormalization => Some(Self::Prototyping),
            Self::Prototyping => Some(Self::ArchitectureDesign),
            Self::ArchitectureDesign => Some(Self::Implementation),
            Self::Implementation => Some(Self::TestExecution),
            Self::TestExecution => None,
        }
    }

    /// Fixed stage-to-role table
    pub fn role(&self) -> WorkerRole {
        match self {
            Self::Requirements => WorkerRole::Analyst,
            Self::ContractFormalization => WorkerRole::ContractEngineer,
            Self::Prototyping => WorkerRole::Prototyper,
            Self::ArchitectureDesign => WorkerRole::Architect,
            Self::Implementation => WorkerRole::Implementer,
            Self::TestExecution => WorkerRole::TestRunner,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::ContractFormalization => "contract_formalization",
            Self::Prototyping => "prototyping",
            Self::ArchitectureDesign => "architecture_design",
            Self::Implementation => "implementation",
            Self::TestExecution => "test_execution",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "contract_formalization" => Self::ContractFormalization,
            "prototyping" => Self::Prototyping,
            "architecture_design" => Self::ArchitectureDesign,
            "implementation" => Self::Implementation,
            "test_execution" => Self::TestExecution,
            _ => Self::Requirements,
        }
    }
}

/// Result of advancing a task's workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Moved forward to the given stage
    Moved(Stage),
    /// The final stage completed; the task is done
    Terminal,
}

/// In-memory workflow state for one task (never persisted in the graph)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Current stage
    pub stage: Stage,
    /// Stages already completed, in order
    pub history: Vec<Stage>,
    /// Whether automatic error recovery may spawn helpers for this task
    pub recovery_enabled: bool,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            stage: Stage::first(),
            history: Vec::new(),
            recovery_enabled: true,
        }
    }
}

/// Owned table of per-task workflow state
#[derive(Debug, Default)]
pub struct WorkflowStateMachine {
    states: HashMap<String, WorkflowState>,
}

impl WorkflowStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task at the first stage; no-op if already registered
    pub fn register(&mut self, task_id: &str) {
        self.states
            .entry(task_id.to_string())
            .or_insert_with(WorkflowState::default);
    }

    /// Register a task at a specific stage (resume after restart)
    pub fn register_at(&mut self, task_id: &str, stage: Stage) {
        self.states.insert(
            task_id.to_string(),
            WorkflowState {
                stage,
                ..WorkflowState::default()
            },
        );
    }

    /// Current stage for a task, if registered
    pub fn current_stage(&self, task_id: &str) -> Option<Stage> {
        self.states.get(task_id).map(|s| s.stage)
    }

    /// Role required for a task's current stage
    pub fn role_for(&self, task_id: &str) -> Option<WorkerRole> {
        self.current_stage(task_id).map(|s| s.role())
    }

    /// Advance a task to its next stage
    ///
    /// Returns `Terminal` when the final stage has completed; the caller is
    /// responsible for marking the task completed in the store.
    pub fn advance(&mut self, task_id: &str) -> Option<Advance> {
        let state = self.states.get_mut(task_id)?;
        state.history.push(state.stage);
        match state.stage.next() {
            Some(next) => {
                state.stage = next;
                Some(Advance::Moved(next))
            }
            None => Some(Advance::Terminal),
        }
    }

    /// Enable or disable automatic error recovery for a task
    pub fn set_recovery_enabled(&mut self, task_id: &str, enabled: bool) {
        if let Some(state) = self.states.get_mut(task_id) {
            state.recovery_enabled = enabled;
        }
    }

    /// Whether automatic recovery is permitted for a task (default true)
    pub fn recovery_enabled(&self, task_id: &str) -> bool {
        self.states
            .get(task_id)
            .map(|s| s.recovery_enabled)
            .unwrap_or(true)
    }

    /// Drop a task's state (terminal status invalidation)
    pub fn remove(&mut self, task_id: &str) -> Option<WorkflowState> {
        self.states.remove(task_id)
    }

    /// Number of tracked tasks
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

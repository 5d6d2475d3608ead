//! # Core Models
//!
//! Shared configuration and role types for the orchestration engine.
//! These were kept out of the component modules so the scheduler, worker
//! lifecycle, and recovery engine can all depend on them cleanly.

use serde::{Deserialize, Serialize};

/// Worker specialization responsible for a pipeline stage
///
/// The first six roles map one-to-one to pipeline stages. `Debugger` and
/// `Generalist` are helper roles spawned by the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Requirements analysis
    Analyst,
    /// Contract formalization
    ContractEngineer,
    /// Prototyping
    Prototyper,
    /// Architecture design
    Architect,
    /// Implementation
    Implementer,
    /// Test execution
    TestRunner,
    /// Recovery helper for critical system failures
    Debugger,
    /// General-purpose recovery helper
    Generalist,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::ContractEngineer => "contract_engineer",
            Self::Prototyper => "prototyper",
            Self::Architect => "architect",
            Self::Implementer => "implementer",
            Self::TestRunner => "test_runner",
            Self::Debugger => "debugger",
            Self::Generalist => "generalist",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "analyst" => Self::Analyst,
            "contract_engineer" => Self::ContractEngineer,
            "prototyper" => Self::Prototyper,
            "architect" => Self::Architect,
            "implementer" => Self::Implementer,
            "test_runner" => Self::TestRunner,
            "debugger" => Self::Debugger,
            _ => Self::Generalist,
        }
    }
}

/// Command used to start a worker process inside its workspace
///
/// The task id and role are passed via `STIGMERGY_TASK_ID` / `STIGMERGY_ROLE`
/// environment variables; the composed mission context is written to
/// `MISSION.md` in the workspace before the process starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "stigmergy-worker".to_string(),
            args: Vec::new(),
        }
    }
}

/// Per-project budget limits consulted before every spawn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum cumulative token usage (None = unlimited)
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Maximum cumulative cost in USD (None = unlimited)
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

/// Configuration for the orchestrator loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum tasks in flight simultaneously
    pub max_concurrent_tasks: usize,
    /// Maximum worker sessions alive at once (in-flight tasks plus helpers)
    pub max_concurrent_agents: usize,
    /// Plain retries before a failure is handed to the recovery engine
    pub max_retries: u32,
    /// Run the signal decay cycle after this many worker completions
    pub decay_every: usize,
    /// Worker process command
    #[serde(default)]
    pub worker: WorkerCommand,
    /// Budget limits
    #[serde(default)]
    pub budget: BudgetConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_concurrent_agents: 6,
            max_retries: 2,
            decay_every: 5,
            worker: WorkerCommand::default(),
            budget: BudgetConfig::default(),
        }
    }
}

//! # Orchestration
//!
//! The run loop that drives a project: dependency-aware scheduling, budget
//! admission, opportunistic signal decay, and graceful drains.

pub mod budget;
pub mod events;
pub mod scheduler;

pub use budget::{Admission, BudgetTracker};
pub use events::{EventBus, EventKind, OrchestratorEvent};
pub use scheduler::{Orchestrator, RunReport, ShutdownHandle, TaskReport};

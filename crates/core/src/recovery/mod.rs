//! # Failure Recovery
//!
//! Classification of worker failures and execution of recovery strategies:
//! helper spawns, escalation to a human, and pausing of downstream work.

pub mod context;
pub mod engine;

pub use context::{ErrorContext, ErrorKind, RecoveryOutcome, RecoveryStrategy, Severity};
pub use engine::{RecoveryEngine, RecoveryStats};

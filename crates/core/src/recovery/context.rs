//! # Error Classification
//!
//! Types describing a failure and the strategy chosen to handle it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::WorkerRole;
use crate::workflow::Stage;

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Infrastructure broke: process crash, database unreachable, git failure
    SystemFailure,
    /// A worker failed at its stage's work
    WorkflowStepError,
    /// A worker declared it cannot make progress
    Impasse,
    /// Validation of produced work failed
    CritiqueFailure,
    /// A worker exceeded its time allowance
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SystemFailure => "system_failure",
            ErrorKind::WorkflowStepError => "workflow_step_error",
            ErrorKind::Impasse => "impasse",
            ErrorKind::CritiqueFailure => "critique_failure",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// How bad it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Everything known about a failure at classification time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub task_id: String,
    pub project_id: String,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        task_id: impl Into<String>,
        project_id: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            task_id: task_id.into(),
            project_id: project_id.into(),
            stage,
            timestamp: Utc::now(),
        }
    }
}

/// What the recovery engine decided to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Spawn a helper worker to diagnose or unblock the task
    SpawnHelper { role: WorkerRole },
    /// Hand the failure to a human
    Escalate,
}

/// Record of one handled failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub task_id: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    /// Whether executing the strategy succeeded
    pub executed: bool,
    /// Set when the failure ended up escalated, including degraded spawns
    pub escalated: bool,
    /// Pending downstream tasks paused because the failure escalated
    pub paused_tasks: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::WorkflowStepError).unwrap();
        assert_eq!(json, "\"workflow_step_error\"");
    }

    #[test]
    fn test_strategy_serialization_carries_role() {
        let strategy = RecoveryStrategy::SpawnHelper {
            role: WorkerRole::Debugger,
        };
        let json = serde_json::to_value(&strategy).unwrap();
        assert_eq!(json["strategy"], "spawn_helper");
        assert_eq!(json["role"], "debugger");
    }
}

//! # Orchestrator Events
//!
//! Observable events emitted while a run is in progress. Consumers attach an
//! unbounded channel; when nobody is listening events are only logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::graph::node::generate_id;

/// Kind of orchestrator event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A run began for a project
    RunStarted,
    /// A worker was spawned for a task
    TaskStarted,
    /// A task finished one stage
    StageCompleted,
    /// A task reached its terminal stage
    TaskCompleted,
    /// A task attempt failed and will be retried
    TaskRetried,
    /// A failure was handed to the recovery engine
    RecoveryTriggered,
    /// A failure was escalated to a human
    TaskEscalated,
    /// A signal decay cycle ran
    DecayCycle,
    /// Budget utilization crossed the soft limit
    BudgetWarning,
    /// Budget was exhausted and the run is stopping
    BudgetExceeded,
    /// The run drained and stopped
    RunStopped,
}

/// An event in an orchestrator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Associated task, when the event concerns one
    #[serde(default)]
    pub task_id: Option<String>,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: generate_id("event"),
            timestamp: Utc::now(),
            kind,
            task_id: None,
            data: None,
        }
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Fan-out point for orchestrator events
#[derive(Clone, Default)]
pub struct EventBus {
    sender: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with an attached consumer channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        debug!(
            event_id = %event.id,
            kind = ?event.kind,
            task_id = ?event.task_id,
            "Orchestrator event"
        );
        if let Some(sender) = &self.sender {
            // a dropped receiver must not stop the run
            let _ = sender.send(event);
        }
    }
}

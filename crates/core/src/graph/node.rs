//! # Graph Records
//!
//! The closed set of typed records stored in the knowledge graph, plus the
//! raw `Node`/`Relationship` shapes they serialize to. Genuinely open-ended
//! data goes in a task's explicit `metadata` map, never in untyped blobs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::workflow::Stage;

/// Node label: the closed set of entity types in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Project,
    Task,
    Worker,
    Pheromone,
    Decision,
    Contract,
    CodeModule,
    Test,
    Failure,
    Diagnostic,
    EscalatedError,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "Project",
            Self::Task => "Task",
            Self::Worker => "Worker",
            Self::Pheromone => "Pheromone",
            Self::Decision => "Decision",
            Self::Contract => "Contract",
            Self::CodeModule => "CodeModule",
            Self::Test => "Test",
            Self::Failure => "Failure",
            Self::Diagnostic => "Diagnostic",
            Self::EscalatedError => "EscalatedError",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Project" => Some(Self::Project),
            "Task" => Some(Self::Task),
            "Worker" => Some(Self::Worker),
            "Pheromone" => Some(Self::Pheromone),
            "Decision" => Some(Self::Decision),
            "Contract" => Some(Self::Contract),
            "CodeModule" => Some(Self::CodeModule),
            "Test" => Some(Self::Test),
            "Failure" => Some(Self::Failure),
            "Diagnostic" => Some(Self::Diagnostic),
            "EscalatedError" => Some(Self::EscalatedError),
            _ => None,
        }
    }
}

/// Relationship type between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelType {
    /// Task → Task dependency; the graph must stay acyclic
    DependsOn,
    /// Task → Worker assignment, one per spawn attempt
    AssignedTo,
    /// CodeModule → Contract
    Implements,
    /// Test → Contract
    Validates,
    /// Decision → Contract
    Defines,
    /// Loose traceability link
    RelatedTo,
    /// Diagnostic → Failure
    Diagnoses,
    /// Any project-scoped record → Project partition edge
    BelongsTo,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependsOn => "DEPENDS_ON",
            Self::AssignedTo => "ASSIGNED_TO",
            Self::Implements => "IMPLEMENTS",
            Self::Validates => "VALIDATES",
            Self::Defines => "DEFINES",
            Self::RelatedTo => "RELATED_TO",
            Self::Diagnoses => "DIAGNOSES",
            Self::BelongsTo => "BELONGS_TO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DEPENDS_ON" => Some(Self::DependsOn),
            "ASSIGNED_TO" => Some(Self::AssignedTo),
            "IMPLEMENTS" => Some(Self::Implements),
            "VALIDATES" => Some(Self::Validates),
            "DEFINES" => Some(Self::Defines),
            "RELATED_TO" => Some(Self::RelatedTo),
            "DIAGNOSES" => Some(Self::Diagnoses),
            "BELONGS_TO" => Some(Self::BelongsTo),
            _ => None,
        }
    }
}

/// A raw graph node as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A raw relationship as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub start_node: String,
    pub end_node: String,
    pub rel_type: String,
    pub properties: serde_json::Value,
}

/// Serialize a typed record to its node property map
pub fn to_properties<T: Serialize>(record: &T) -> Result<serde_json::Value> {
    serde_json::to_value(record).context("Failed to serialize record properties")
}

/// Deserialize a typed record from a node property map
pub fn from_properties<T: DeserializeOwned>(properties: &serde_json::Value) -> Result<T> {
    serde_json::from_value(properties.clone()).context("Failed to deserialize record properties")
}

/// Generate a prefixed unique id (timestamp + random suffix)
pub fn generate_id(prefix: &str) -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    let salt = RandomState::new().build_hasher().finish() as u32;
    format!("{}-{:x}-{:x}", prefix, nanos, salt)
}

/// Project status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

/// A project: owns all tasks and artifacts via BELONGS_TO partition edges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task status over its lifetime; tasks are never deleted, only transitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Impasse,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Impasse => "impasse",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "impasse" => Self::Impasse,
            "paused" => Self::Paused,
            _ => Self::Pending,
        }
    }
}

/// A unit of pipeline work belonging to a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub project_id: String,
    /// Current pipeline stage, mirrored from the workflow state machine
    pub stage: Stage,
    pub retry_count: u32,
    /// Summary of the most recent error, for status reporting
    #[serde(default)]
    pub last_error: Option<String>,
    /// Open-ended metadata; the only untyped field on a task
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A spawned worker, linked to tasks via ASSIGNED_TO
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub role: String,
    pub spawned_at: DateTime<Utc>,
}

/// An architecture/design decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

/// A formalized contract with declared endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub project_id: String,
    pub name: String,
    /// Declared endpoints used by coverage analysis
    pub endpoints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A code module produced by an implementation worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeModule {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub path: String,
    /// Contract endpoints this module covers
    #[serde(default)]
    pub covers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A test produced by a test-runner worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    /// Contract endpoints this test covers
    #[serde(default)]
    pub covers: Vec<String>,
    #[serde(default)]
    pub passed: Option<bool>,
    pub created_at: DateTime<Utc>,
}

/// A persisted task failure; written before any recovery action runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
}

/// Diagnostic context captured for a failure (prior session output etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    pub summary: String,
    #[serde(default)]
    pub session_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An unrecoverable failure requiring manual intervention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalatedError {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    pub reason: String,
    pub severity: String,
    pub created_at: DateTime<Utc>,
}

//! # Knowledge Graph
//!
//! Persistent graph of projects, tasks, workers, coordination signals, and
//! delivery artifacts. Storage is a single SQLite database; every operation
//! goes through the transaction runner.

pub mod db;
pub mod node;
pub mod snapshot;
pub mod store;
pub mod txn;

pub use db::GraphDb;
pub use node::{
    CodeModule, Contract, Decision, Diagnostic, EscalatedError, FailureRecord, Node, NodeLabel,
    Project, ProjectStatus, Relationship, RelType, Task, TaskStatus, TestRecord, WorkerRecord,
};
pub use snapshot::{RestoreStats, SnapshotError, SnapshotManager};
pub use store::{CoverageReport, EndpointCoverage, KnowledgeStore, ProjectGraph};
pub use txn::{TransactionRunner, TxnMetrics};

//! # Stigmergy Core
//!
//! Task orchestration engine for an agent fleet: a dependency-aware
//! scheduler over a transactional knowledge graph, with decaying
//! coordination signals, isolated git workspaces per worker, and an
//! error-classification recovery engine.
//!
//! ## Architecture
//!
//! - `graph/` - SQLite-backed knowledge graph, transactions, snapshots
//! - `signals/` - Decaying pheromone signals and their analysis
//! - `workflow` - Per-task stage state machine
//! - `worker/` - Worktree isolation and worker session lifecycle
//! - `recovery/` - Failure classification and recovery strategies
//! - `orchestrator/` - The scheduling run loop, events, and budget
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stigmergy_core::graph::GraphDb;
//! use stigmergy_core::models::OrchestratorConfig;
//! use stigmergy_core::orchestrator::Orchestrator;
//!
//! let db = GraphDb::open()?;
//! let orchestrator = Orchestrator::new(&db, ".", OrchestratorConfig::default());
//! let report = orchestrator.run(&project_id).await?;
//! ```

pub mod graph;
pub mod models;
pub mod orchestrator;
pub mod recovery;
pub mod runtime;
pub mod signals;
pub mod worker;
pub mod workflow;

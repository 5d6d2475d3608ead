//! # Knowledge Store
//!
//! Typed CRUD and relationship queries over the graph database. This is the
//! shared record of projects, tasks, workers, artifacts, and failures that
//! the scheduler and recovery engine coordinate through.
//!
//! Dependency edges are validated for acyclicity at creation time; a task is
//! *ready* only when every `DEPENDS_ON` target is completed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::db::GraphDb;
use super::node::{
    self, CodeModule, Contract, Decision, Diagnostic, EscalatedError, FailureRecord, Node,
    NodeLabel, Project, ProjectStatus, Relationship, RelType, Task, TaskStatus, TestRecord,
    WorkerRecord,
};
use super::txn::TransactionRunner;
use crate::models::WorkerRole;
use crate::workflow::Stage;

/// Coverage of a single declared endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCoverage {
    pub endpoint: String,
    /// Names of code modules implementing this endpoint
    pub implementations: Vec<String>,
    /// Names of tests validating this endpoint
    pub tests: Vec<String>,
    /// True when at least one implementation and one test cover it
    pub covered: bool,
}

/// Per-endpoint coverage for one contract, computed in a single transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    pub contract_id: String,
    pub contract_name: String,
    pub endpoints: Vec<EndpointCoverage>,
}

/// All nodes and relationships belonging to one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectGraph {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

/// Typed access to the knowledge graph
#[derive(Clone)]
pub struct KnowledgeStore {
    txn: TransactionRunner,
}

impl KnowledgeStore {
    pub fn new(db: &GraphDb) -> Self {
        Self {
            txn: TransactionRunner::new(db),
        }
    }

    /// The underlying transaction runner (shared metrics and health probe)
    pub fn runner(&self) -> &TransactionRunner {
        &self.txn
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn create_project(&self, name: &str) -> Result<Project> {
        let now = Utc::now();
        let project = Project {
            id: node::generate_id("proj"),
            name: name.to_string(),
            status: ProjectStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let props = node::to_properties(&project)?;
        self.txn.write(|conn| {
            insert_node(conn, &project.id, NodeLabel::Project, &props, now)?;
            Ok(())
        })?;

        tracing::info!(project_id = %project.id, name = %name, "Project created");
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        self.txn.read(|conn| {
            let node = load_node(conn, id)?
                .with_context(|| format!("Project not found: {}", id))?;
            node::from_properties(&node.properties)
        })
    }

    pub fn set_project_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        let mut project = self.get_project(id)?;
        project.status = status;
        project.updated_at = Utc::now();
        let props = node::to_properties(&project)?;
        self.txn
            .write(|conn| update_node_properties(conn, id, &props))
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn create_task(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: i64,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            id: node::generate_id("task"),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            priority,
            project_id: project_id.to_string(),
            stage: Stage::first(),
            retry_count: 0,
            last_error: None,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };

        let props = node::to_properties(&task)?;
        self.txn.write(|conn| {
            load_node(conn, project_id)?
                .with_context(|| format!("Project not found: {}", project_id))?;
            insert_node(conn, &task.id, NodeLabel::Task, &props, now)?;
            insert_rel(conn, &task.id, project_id, RelType::BelongsTo)?;
            Ok(())
        })?;

        tracing::info!(task_id = %task.id, project_id = %project_id, "Task created");
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.txn.read(|conn| get_task_tx(conn, id))
    }

    /// All tasks belonging to a project
    pub fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.txn.read(|conn| list_project_tasks(conn, project_id))
    }

    /// Tasks of a project in a given status
    pub fn list_tasks_by_status(&self, project_id: &str, status: TaskStatus) -> Result<Vec<Task>> {
        let mut tasks = self.list_tasks(project_id)?;
        tasks.retain(|t| t.status == status);
        Ok(tasks)
    }

    /// Transition a task's status, recording the last error summary
    ///
    /// Tasks are never deleted; this is the only way their lifecycle moves.
    pub fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.txn.write(|conn| {
            let mut task = get_task_tx(conn, id)?;
            task.status = status;
            if let Some(err) = last_error {
                task.last_error = Some(err.to_string());
            }
            task.updated_at = Utc::now();
            update_node_properties(conn, id, &node::to_properties(&task)?)
        })?;
        tracing::debug!(task_id = %id, status = status.as_str(), "Task status updated");
        Ok(())
    }

    /// Mirror the workflow stage onto the persisted task
    pub fn set_task_stage(&self, id: &str, stage: Stage) -> Result<()> {
        self.txn.write(|conn| {
            let mut task = get_task_tx(conn, id)?;
            task.stage = stage;
            task.updated_at = Utc::now();
            update_node_properties(conn, id, &node::to_properties(&task)?)
        })
    }

    /// Increment a task's retry counter, returning the new count
    pub fn increment_retry(&self, id: &str) -> Result<u32> {
        self.txn.write(|conn| {
            let mut task = get_task_tx(conn, id)?;
            task.retry_count += 1;
            task.updated_at = Utc::now();
            update_node_properties(conn, id, &node::to_properties(&task)?)?;
            Ok(task.retry_count)
        })
    }

    /// Set one key in a task's metadata map
    pub fn set_task_metadata(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.txn.write(|conn| {
            let mut task = get_task_tx(conn, id)?;
            task.metadata.insert(key.to_string(), value.clone());
            task.updated_at = Utc::now();
            update_node_properties(conn, id, &node::to_properties(&task)?)
        })
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// Create a DEPENDS_ON edge from `task_id` to `depends_on_id`
    ///
    /// Rejects self-dependencies and any edge that would close a cycle; the
    /// check and the insert happen in one write transaction.
    pub fn add_dependency(&self, task_id: &str, depends_on_id: &str) -> Result<()> {
        if task_id == depends_on_id {
            anyhow::bail!("Task cannot depend on itself: {}", task_id);
        }

        self.txn.write(|conn| {
            get_task_tx(conn, task_id)?;
            get_task_tx(conn, depends_on_id)?;

            if reaches(conn, depends_on_id, task_id)? {
                anyhow::bail!(
                    "Dependency {} -> {} would create a cycle",
                    task_id,
                    depends_on_id
                );
            }

            insert_rel(conn, task_id, depends_on_id, RelType::DependsOn)?;
            Ok(())
        })
    }

    /// Tasks this task depends on
    pub fn dependencies_of(&self, task_id: &str) -> Result<Vec<Task>> {
        self.txn.read(|conn| {
            let ids = rel_targets(conn, task_id, RelType::DependsOn)?;
            ids.iter().map(|id| get_task_tx(conn, id)).collect()
        })
    }

    /// Tasks that depend on this task
    pub fn dependents_of(&self, task_id: &str) -> Result<Vec<Task>> {
        self.txn.read(|conn| {
            let ids = rel_sources(conn, task_id, RelType::DependsOn)?;
            ids.iter().map(|id| get_task_tx(conn, id)).collect()
        })
    }

    /// Pending tasks whose every dependency is completed
    ///
    /// Ordered by priority descending, then creation time.
    pub fn ready_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.txn.read(|conn| {
            let tasks = list_project_tasks(conn, project_id)?;
            let mut ready = Vec::new();

            for task in tasks {
                if task.status != TaskStatus::Pending {
                    continue;
                }
                let dep_ids = rel_targets(conn, &task.id, RelType::DependsOn)?;
                let mut blocked = false;
                for dep_id in &dep_ids {
                    let dep = get_task_tx(conn, dep_id)?;
                    if dep.status != TaskStatus::Completed {
                        blocked = true;
                        break;
                    }
                }
                if !blocked {
                    ready.push(task);
                }
            }

            ready.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
            Ok(ready)
        })
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub fn create_worker(&self, role: WorkerRole) -> Result<WorkerRecord> {
        let now = Utc::now();
        let worker = WorkerRecord {
            id: node::generate_id("worker"),
            role: role.as_str().to_string(),
            spawned_at: now,
        };
        let props = node::to_properties(&worker)?;
        self.txn.write(|conn| {
            insert_node(conn, &worker.id, NodeLabel::Worker, &props, now)?;
            Ok(())
        })?;
        Ok(worker)
    }

    /// Record a task-to-worker assignment; retries produce new edges
    pub fn assign_worker(&self, task_id: &str, worker_id: &str) -> Result<()> {
        self.txn.write(|conn| {
            insert_rel(conn, task_id, worker_id, RelType::AssignedTo)?;
            Ok(())
        })
    }

    pub fn workers_for(&self, task_id: &str) -> Result<Vec<WorkerRecord>> {
        self.txn.read(|conn| {
            let ids = rel_targets(conn, task_id, RelType::AssignedTo)?;
            ids.iter()
                .map(|id| {
                    let n = load_node(conn, id)?
                        .with_context(|| format!("Worker not found: {}", id))?;
                    node::from_properties(&n.properties)
                })
                .collect()
        })
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    pub fn create_decision(
        &self,
        project_id: &str,
        title: &str,
        rationale: &str,
        defines_contract: Option<&str>,
    ) -> Result<Decision> {
        let now = Utc::now();
        let decision = Decision {
            id: node::generate_id("dec"),
            project_id: project_id.to_string(),
            title: title.to_string(),
            rationale: rationale.to_string(),
            created_at: now,
        };
        let props = node::to_properties(&decision)?;
        self.txn.write(|conn| {
            insert_node(conn, &decision.id, NodeLabel::Decision, &props, now)?;
            insert_rel(conn, &decision.id, project_id, RelType::BelongsTo)?;
            if let Some(contract_id) = defines_contract {
                insert_rel(conn, &decision.id, contract_id, RelType::Defines)?;
            }
            Ok(())
        })?;
        Ok(decision)
    }

    pub fn create_contract(
        &self,
        project_id: &str,
        name: &str,
        endpoints: Vec<String>,
    ) -> Result<Contract> {
        let now = Utc::now();
        let contract = Contract {
            id: node::generate_id("contract"),
            project_id: project_id.to_string(),
            name: name.to_string(),
            endpoints,
            created_at: now,
        };
        let props = node::to_properties(&contract)?;
        self.txn.write(|conn| {
            insert_node(conn, &contract.id, NodeLabel::Contract, &props, now)?;
            insert_rel(conn, &contract.id, project_id, RelType::BelongsTo)?;
            Ok(())
        })?;
        Ok(contract)
    }

    pub fn create_code_module(
        &self,
        project_id: &str,
        name: &str,
        path: &str,
        covers: Vec<String>,
        implements_contract: Option<&str>,
    ) -> Result<CodeModule> {
        let now = Utc::now();
        let module = CodeModule {
            id: node::generate_id("mod"),
            project_id: project_id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            covers,
            created_at: now,
        };
        let props = node::to_properties(&module)?;
        self.txn.write(|conn| {
            insert_node(conn, &module.id, NodeLabel::CodeModule, &props, now)?;
            insert_rel(conn, &module.id, project_id, RelType::BelongsTo)?;
            if let Some(contract_id) = implements_contract {
                insert_rel(conn, &module.id, contract_id, RelType::Implements)?;
            }
            Ok(())
        })?;
        Ok(module)
    }

    pub fn create_test(
        &self,
        project_id: &str,
        name: &str,
        covers: Vec<String>,
        passed: Option<bool>,
        validates_contract: Option<&str>,
    ) -> Result<TestRecord> {
        let now = Utc::now();
        let test = TestRecord {
            id: node::generate_id("test"),
            project_id: project_id.to_string(),
            name: name.to_string(),
            covers,
            passed,
            created_at: now,
        };
        let props = node::to_properties(&test)?;
        self.txn.write(|conn| {
            insert_node(conn, &test.id, NodeLabel::Test, &props, now)?;
            insert_rel(conn, &test.id, project_id, RelType::BelongsTo)?;
            if let Some(contract_id) = validates_contract {
                insert_rel(conn, &test.id, contract_id, RelType::Validates)?;
            }
            Ok(())
        })?;
        Ok(test)
    }

    pub fn create_failure(
        &self,
        project_id: &str,
        task_id: &str,
        kind: &str,
        severity: &str,
        message: &str,
        stage: Stage,
    ) -> Result<FailureRecord> {
        let now = Utc::now();
        let failure = FailureRecord {
            id: node::generate_id("fail"),
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            severity: severity.to_string(),
            message: message.to_string(),
            stage,
            created_at: now,
        };
        let props = node::to_properties(&failure)?;
        self.txn.write(|conn| {
            insert_node(conn, &failure.id, NodeLabel::Failure, &props, now)?;
            insert_rel(conn, &failure.id, project_id, RelType::BelongsTo)?;
            insert_rel(conn, &failure.id, task_id, RelType::RelatedTo)?;
            Ok(())
        })?;
        Ok(failure)
    }

    pub fn create_diagnostic(
        &self,
        project_id: &str,
        task_id: &str,
        summary: &str,
        session_output: Option<String>,
        diagnoses_failure: Option<&str>,
    ) -> Result<Diagnostic> {
        let now = Utc::now();
        let diagnostic = Diagnostic {
            id: node::generate_id("diag"),
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            session_output,
            created_at: now,
        };
        let props = node::to_properties(&diagnostic)?;
        self.txn.write(|conn| {
            insert_node(conn, &diagnostic.id, NodeLabel::Diagnostic, &props, now)?;
            insert_rel(conn, &diagnostic.id, project_id, RelType::BelongsTo)?;
            if let Some(failure_id) = diagnoses_failure {
                insert_rel(conn, &diagnostic.id, failure_id, RelType::Diagnoses)?;
            }
            Ok(())
        })?;
        Ok(diagnostic)
    }

    pub fn create_escalated_error(
        &self,
        project_id: &str,
        task_id: &str,
        reason: &str,
        severity: &str,
    ) -> Result<EscalatedError> {
        let now = Utc::now();
        let escalated = EscalatedError {
            id: node::generate_id("esc"),
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            severity: severity.to_string(),
            created_at: now,
        };
        let props = node::to_properties(&escalated)?;
        self.txn.write(|conn| {
            insert_node(conn, &escalated.id, NodeLabel::EscalatedError, &props, now)?;
            insert_rel(conn, &escalated.id, project_id, RelType::BelongsTo)?;
            insert_rel(conn, &escalated.id, task_id, RelType::RelatedTo)?;
            Ok(())
        })?;
        tracing::warn!(task_id = %task_id, reason = %reason, "Error escalated for manual intervention");
        Ok(escalated)
    }

    pub fn escalated_errors(&self, project_id: &str) -> Result<Vec<EscalatedError>> {
        self.txn.read(|conn| {
            let nodes = nodes_by_label(conn, NodeLabel::EscalatedError)?;
            let mut out = Vec::new();
            for n in &nodes {
                let rec: EscalatedError = node::from_properties(&n.properties)?;
                if rec.project_id == project_id {
                    out.push(rec);
                }
            }
            Ok(out)
        })
    }

    /// Create an arbitrary typed relationship between two existing nodes
    pub fn link(&self, start: &str, rel_type: RelType, end: &str) -> Result<String> {
        self.txn.write(|conn| {
            load_node(conn, start)?.with_context(|| format!("Node not found: {}", start))?;
            load_node(conn, end)?.with_context(|| format!("Node not found: {}", end))?;
            insert_rel(conn, start, end, rel_type)
        })
    }

    // =========================================================================
    // Relationship queries
    // =========================================================================

    /// Code modules implementing a contract
    pub fn implementations_of(&self, contract_id: &str) -> Result<Vec<CodeModule>> {
        self.txn.read(|conn| {
            let ids = rel_sources(conn, contract_id, RelType::Implements)?;
            ids.iter()
                .map(|id| {
                    let n = load_node(conn, id)?
                        .with_context(|| format!("CodeModule not found: {}", id))?;
                    node::from_properties(&n.properties)
                })
                .collect()
        })
    }

    /// Tests validating a contract
    pub fn tests_covering(&self, contract_id: &str) -> Result<Vec<TestRecord>> {
        self.txn.read(|conn| {
            let ids = rel_sources(conn, contract_id, RelType::Validates)?;
            ids.iter()
                .map(|id| {
                    let n = load_node(conn, id)?
                        .with_context(|| format!("Test not found: {}", id))?;
                    node::from_properties(&n.properties)
                })
                .collect()
        })
    }

    /// Per-endpoint coverage for a contract
    ///
    /// Runs in a single read transaction so implementations and tests are
    /// observed at the same point in time. Fatal if the contract is missing.
    pub fn contract_coverage(&self, contract_id: &str) -> Result<CoverageReport> {
        self.txn.read(|conn| {
            let contract_node = load_node(conn, contract_id)?
                .with_context(|| format!("Contract not found: {}", contract_id))?;
            let contract: Contract = node::from_properties(&contract_node.properties)?;

            let impl_ids = rel_sources(conn, contract_id, RelType::Implements)?;
            let mut modules = Vec::new();
            for id in &impl_ids {
                if let Some(n) = load_node(conn, id)? {
                    modules.push(node::from_properties::<CodeModule>(&n.properties)?);
                }
            }

            let test_ids = rel_sources(conn, contract_id, RelType::Validates)?;
            let mut tests = Vec::new();
            for id in &test_ids {
                if let Some(n) = load_node(conn, id)? {
                    tests.push(node::from_properties::<TestRecord>(&n.properties)?);
                }
            }

            let endpoints = contract
                .endpoints
                .iter()
                .map(|endpoint| {
                    let implementations: Vec<String> = modules
                        .iter()
                        .filter(|m| m.covers.iter().any(|c| c == endpoint))
                        .map(|m| m.name.clone())
                        .collect();
                    let covering_tests: Vec<String> = tests
                        .iter()
                        .filter(|t| t.covers.iter().any(|c| c == endpoint))
                        .map(|t| t.name.clone())
                        .collect();
                    let covered = !implementations.is_empty() && !covering_tests.is_empty();
                    EndpointCoverage {
                        endpoint: endpoint.clone(),
                        implementations,
                        tests: covering_tests,
                        covered,
                    }
                })
                .collect();

            Ok(CoverageReport {
                contract_id: contract.id,
                contract_name: contract.name,
                endpoints,
            })
        })
    }

    /// All nodes and relationships belonging to a project
    pub fn knowledge_graph(&self, project_id: &str) -> Result<ProjectGraph> {
        self.txn.read(|conn| {
            let project = load_node(conn, project_id)?
                .with_context(|| format!("Project not found: {}", project_id))?;

            let mut ids: HashSet<String> = HashSet::new();
            ids.insert(project.id.clone());
            for id in rel_sources(conn, project_id, RelType::BelongsTo)? {
                ids.insert(id);
            }

            let mut nodes = vec![project];
            for id in &ids {
                if let Some(n) = load_node(conn, id)? {
                    if n.id != nodes[0].id {
                        nodes.push(n);
                    }
                }
            }

            let relationships = all_relationships(conn)?
                .into_iter()
                .filter(|r| ids.contains(&r.start_node) && ids.contains(&r.end_node))
                .collect();

            Ok(ProjectGraph {
                nodes,
                relationships,
            })
        })
    }
}

// =============================================================================
// Shared row-level helpers, reused by the snapshot and signal layers
// =============================================================================

pub(crate) fn insert_node(
    conn: &Connection,
    id: &str,
    label: NodeLabel,
    properties: &serde_json::Value,
    created_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO nodes (id, label, properties, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            id,
            label.as_str(),
            serde_json::to_string(properties)?,
            created_at.to_rfc3339()
        ],
    )
    .with_context(|| format!("Failed to insert {} node {}", label.as_str(), id))?;
    Ok(())
}

pub(crate) fn load_node(conn: &Connection, id: &str) -> Result<Option<Node>> {
    let mut stmt =
        conn.prepare("SELECT id, label, properties, created_at FROM nodes WHERE id = ?1")?;
    let mut rows = stmt.query_map(params![id], row_to_node)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub(crate) fn nodes_by_label(conn: &Connection, label: NodeLabel) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare(
        "SELECT id, label, properties, created_at FROM nodes WHERE label = ?1 ORDER BY created_at",
    )?;
    let nodes = stmt
        .query_map(params![label.as_str()], row_to_node)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(nodes)
}

pub(crate) fn update_node_properties(
    conn: &Connection,
    id: &str,
    properties: &serde_json::Value,
) -> Result<()> {
    let affected = conn.execute(
        "UPDATE nodes SET properties = ?1 WHERE id = ?2",
        params![serde_json::to_string(properties)?, id],
    )?;
    if affected == 0 {
        anyhow::bail!("Node not found: {}", id);
    }
    Ok(())
}

pub(crate) fn delete_node(conn: &Connection, id: &str) -> Result<bool> {
    conn.execute(
        "DELETE FROM relationships WHERE start_node = ?1 OR end_node = ?1",
        params![id],
    )?;
    let affected = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
    Ok(affected > 0)
}

pub(crate) fn insert_rel(
    conn: &Connection,
    start: &str,
    end: &str,
    rel_type: RelType,
) -> Result<String> {
    let id = node::generate_id("rel");
    conn.execute(
        "INSERT INTO relationships (id, start_node, end_node, rel_type, properties) VALUES (?1, ?2, ?3, ?4, '{}')",
        params![id, start, end, rel_type.as_str()],
    )
    .with_context(|| format!("Failed to insert {} relationship", rel_type.as_str()))?;
    Ok(id)
}

/// End-node ids of typed relationships starting at `start`
pub(crate) fn rel_targets(conn: &Connection, start: &str, rel_type: RelType) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT end_node FROM relationships WHERE start_node = ?1 AND rel_type = ?2",
    )?;
    let ids = stmt
        .query_map(params![start, rel_type.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Start-node ids of typed relationships ending at `end`
pub(crate) fn rel_sources(conn: &Connection, end: &str, rel_type: RelType) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT start_node FROM relationships WHERE end_node = ?1 AND rel_type = ?2",
    )?;
    let ids = stmt
        .query_map(params![end, rel_type.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub(crate) fn all_nodes(conn: &Connection) -> Result<Vec<Node>> {
    let mut stmt =
        conn.prepare("SELECT id, label, properties, created_at FROM nodes ORDER BY created_at")?;
    let nodes = stmt
        .query_map([], row_to_node)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(nodes)
}

pub(crate) fn all_relationships(conn: &Connection) -> Result<Vec<Relationship>> {
    let mut stmt =
        conn.prepare("SELECT id, start_node, end_node, rel_type, properties FROM relationships")?;
    let rels = stmt
        .query_map([], |row| {
            let props: String = row.get(4)?;
            Ok(Relationship {
                id: row.get(0)?,
                start_node: row.get(1)?,
                end_node: row.get(2)?,
                rel_type: row.get(3)?,
                properties: serde_json::from_str(&props).unwrap_or(serde_json::Value::Null),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rels)
}

fn get_task_tx(conn: &Connection, id: &str) -> Result<Task> {
    let n = load_node(conn, id)?.with_context(|| format!("Task not found: {}", id))?;
    node::from_properties(&n.properties)
}

fn list_project_tasks(conn: &Connection, project_id: &str) -> Result<Vec<Task>> {
    let nodes = nodes_by_label(conn, NodeLabel::Task)?;
    let mut tasks = Vec::new();
    for n in &nodes {
        let task: Task = node::from_properties(&n.properties)?;
        if task.project_id == project_id {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

/// Depth-first reachability over DEPENDS_ON edges (cycle detection)
fn reaches(conn: &Connection, from: &str, to: &str) -> Result<bool> {
    let mut stack = vec![from.to_string()];
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == to {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        for next in rel_targets(conn, &current, RelType::DependsOn)? {
            stack.push(next);
        }
    }
    Ok(false)
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
    let props: String = row.get(2)?;
    let created_at_str: String = row.get(3)?;
    Ok(Node {
        id: row.get(0)?,
        label: row.get(1)?,
        properties: serde_json::from_str(&props).unwrap_or(serde_json::Value::Null),
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

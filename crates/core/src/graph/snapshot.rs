//! # Graph Snapshots
//!
//! Export of the whole knowledge graph to a versioned document and restore
//! back into a (cleared) store. Malformed documents are rejected before any
//! mutation, so a failed validation never leaves a half-restored graph.
//!
//! Shutdown drains write the current snapshot to `.stigmergy/snapshots/`.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::db::GraphDb;
use super::store;
use super::txn::TransactionRunner;
use crate::runtime;

/// Snapshot document format version
const SNAPSHOT_VERSION: &str = "1.0";

/// Nodes recreated per batch during restore
const RESTORE_BATCH_SIZE: usize = 500;

/// Validation failures for snapshot documents
///
/// These are typed so callers can distinguish a malformed document from an
/// operational store error.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot document is not a JSON object")]
    NotAnObject,
    #[error("snapshot document missing required field: {0}")]
    MissingField(&'static str),
    #[error("snapshot field {0} must be an array")]
    NotAnArray(&'static str),
}

/// Result of a completed restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreStats {
    pub nodes_restored: usize,
    pub relationships_restored: usize,
    /// Relationships dropped because an endpoint node was absent
    pub relationships_skipped: usize,
}

/// Saves and restores whole-graph snapshots
#[derive(Clone)]
pub struct SnapshotManager {
    txn: TransactionRunner,
}

impl SnapshotManager {
    pub fn new(db: &GraphDb) -> Self {
        Self {
            txn: TransactionRunner::new(db),
        }
    }

    /// Export every node and relationship to a versioned document
    pub fn save(&self) -> Result<Value> {
        self.txn.read(|conn| {
            let nodes = store::all_nodes(conn)?;
            let relationships = store::all_relationships(conn)?;

            let mut node_types: HashMap<String, usize> = HashMap::new();
            for n in &nodes {
                *node_types.entry(n.label.clone()).or_insert(0) += 1;
            }

            let node_docs: Vec<Value> = nodes
                .iter()
                .map(|n| {
                    json!({
                        "id": n.id,
                        "labels": [n.label],
                        "properties": n.properties,
                    })
                })
                .collect();

            let rel_docs: Vec<Value> = relationships
                .iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "startNode": r.start_node,
                        "endNode": r.end_node,
                        "type": r.rel_type,
                        "properties": r.properties,
                    })
                })
                .collect();

            Ok(json!({
                "version": SNAPSHOT_VERSION,
                "timestamp": Utc::now().to_rfc3339(),
                "metadata": {
                    "totalNodes": nodes.len(),
                    "totalRelationships": relationships.len(),
                    "nodeTypes": node_types,
                },
                "nodes": node_docs,
                "relationships": rel_docs,
            }))
        })
    }

    /// Clear the store and recreate it from a snapshot document
    ///
    /// The document is validated in full before any mutation; the clear and
    /// both recreate passes run inside one write transaction.
    pub fn restore(&self, doc: &Value) -> Result<RestoreStats> {
        let (node_docs, rel_docs) = validate(doc)?;

        let stats = self.txn.write(|conn| {
            conn.execute("DELETE FROM relationships", [])?;
            conn.execute("DELETE FROM nodes", [])?;

            let now = Utc::now();
            let mut known_ids: HashSet<String> = HashSet::new();

            // Nodes first, in batches
            for batch in node_docs.chunks(RESTORE_BATCH_SIZE) {
                for n in batch {
                    let id = n
                        .get("id")
                        .and_then(Value::as_str)
                        .context("Snapshot node missing id")?;
                    let label = n
                        .get("labels")
                        .and_then(Value::as_array)
                        .and_then(|labels| labels.first())
                        .and_then(Value::as_str)
                        .context("Snapshot node missing label")?;
                    let properties = n.get("properties").cloned().unwrap_or(json!({}));

                    conn.execute(
                        "INSERT INTO nodes (id, label, properties, created_at) VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![
                            id,
                            label,
                            serde_json::to_string(&properties)?,
                            now.to_rfc3339()
                        ],
                    )?;
                    known_ids.insert(id.to_string());
                }
            }

            // Then relationships, matched by node id
            let mut restored = 0usize;
            let mut skipped = 0usize;
            for r in &rel_docs {
                let id = r
                    .get("id")
                    .and_then(Value::as_str)
                    .context("Snapshot relationship missing id")?;
                let start = r
                    .get("startNode")
                    .and_then(Value::as_str)
                    .context("Snapshot relationship missing startNode")?;
                let end = r
                    .get("endNode")
                    .and_then(Value::as_str)
                    .context("Snapshot relationship missing endNode")?;
                let rel_type = r
                    .get("type")
                    .and_then(Value::as_str)
                    .context("Snapshot relationship missing type")?;

                if !known_ids.contains(start) || !known_ids.contains(end) {
                    tracing::warn!(rel_id = %id, "Skipping relationship with missing endpoint node");
                    skipped += 1;
                    continue;
                }

                let properties = r.get("properties").cloned().unwrap_or(json!({}));
                conn.execute(
                    "INSERT INTO relationships (id, start_node, end_node, rel_type, properties) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, start, end, rel_type, serde_json::to_string(&properties)?],
                )?;
                restored += 1;
            }

            Ok(RestoreStats {
                nodes_restored: known_ids.len(),
                relationships_restored: restored,
                relationships_skipped: skipped,
            })
        })?;

        tracing::info!(
            nodes = stats.nodes_restored,
            relationships = stats.relationships_restored,
            "Graph restored from snapshot"
        );
        Ok(stats)
    }

    /// Write the current snapshot to a timestamped file under the runtime dir
    pub async fn write_to_file(&self) -> Result<PathBuf> {
        let doc = self.save()?;
        let dir = runtime::snapshots_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create snapshot directory: {:?}", dir))?;

        let path = dir.join(format!(
            "graph_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        tokio::fs::write(&path, serde_json::to_string_pretty(&doc)?)
            .await
            .with_context(|| format!("Failed to write snapshot: {:?}", path))?;

        tracing::info!(path = %path.display(), "Snapshot flushed to disk");
        Ok(path)
    }

    /// Load and restore a snapshot from a file
    pub async fn read_from_file<P: AsRef<Path>>(&self, path: P) -> Result<RestoreStats> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read snapshot: {:?}", path.as_ref()))?;
        let doc: Value = serde_json::from_str(&raw).context("Snapshot file is not valid JSON")?;
        self.restore(&doc)
    }
}

/// Validate a snapshot document, returning its node and relationship arrays
///
/// All five top-level fields must be present and `nodes`/`relationships`
/// must be arrays. Runs before any store mutation.
fn validate(doc: &Value) -> Result<(Vec<Value>, Vec<Value>), SnapshotError> {
    let obj = doc.as_object().ok_or(SnapshotError::NotAnObject)?;

    for field in ["version", "timestamp", "metadata", "nodes", "relationships"] {
        if !obj.contains_key(field) {
            return Err(SnapshotError::MissingField(match field {
                "version" => "version",
                "timestamp" => "timestamp",
                "metadata" => "metadata",
                "nodes" => "nodes",
                _ => "relationships",
            }));
        }
    }

    let nodes = obj["nodes"]
        .as_array()
        .ok_or(SnapshotError::NotAnArray("nodes"))?
        .clone();
    let relationships = obj["relationships"]
        .as_array()
        .ok_or(SnapshotError::NotAnArray("relationships"))?
        .clone();

    Ok((nodes, relationships))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::KnowledgeStore;

    fn setup() -> (GraphDb, KnowledgeStore, SnapshotManager) {
        let db = GraphDb::open_in_memory().unwrap();
        let store = KnowledgeStore::new(&db);
        let snapshots = SnapshotManager::new(&db);
        (db, store, snapshots)
    }

    #[test]
    fn test_snapshot_round_trip_is_structurally_idempotent() {
        let (_db, store, snapshots) = setup();
        let project = store.create_project("demo").unwrap();
        let t1 = store.create_task(&project.id, "T1", "", 0).unwrap();
        let t2 = store.create_task(&project.id, "T2", "", 0).unwrap();
        store.add_dependency(&t2.id, &t1.id).unwrap();

        let doc = snapshots.save().unwrap();
        let n = doc["metadata"]["totalNodes"].as_u64().unwrap();
        let m = doc["metadata"]["totalRelationships"].as_u64().unwrap();
        assert_eq!(n, 3);
        assert_eq!(m, 3); // two BELONGS_TO + one DEPENDS_ON

        let stats = snapshots.restore(&doc).unwrap();
        assert_eq!(stats.nodes_restored as u64, n);
        assert_eq!(stats.relationships_restored as u64, m);

        let doc2 = snapshots.save().unwrap();
        assert_eq!(doc2["metadata"]["totalNodes"].as_u64().unwrap(), n);
        assert_eq!(doc2["metadata"]["totalRelationships"].as_u64().unwrap(), m);

        // Typed reads still work after restore
        let loaded = store.get_task(&t1.id).unwrap();
        assert_eq!(loaded.title, "T1");
    }

    #[test]
    fn test_missing_relationships_field_rejected_without_mutation() {
        let (_db, store, snapshots) = setup();
        let project = store.create_project("demo").unwrap();
        store.create_task(&project.id, "T1", "", 0).unwrap();

        let malformed = json!({
            "version": "1.0",
            "timestamp": "2026-01-01T00:00:00Z",
            "metadata": {},
            "nodes": [],
        });

        let err = snapshots.restore(&malformed).unwrap_err();
        assert!(err.to_string().contains("relationships"));

        // The store was not touched
        let doc = snapshots.save().unwrap();
        assert_eq!(doc["metadata"]["totalNodes"].as_u64().unwrap(), 2);
    }

    #[test]
    fn test_non_array_nodes_rejected() {
        let (_db, _store, snapshots) = setup();
        let malformed = json!({
            "version": "1.0",
            "timestamp": "2026-01-01T00:00:00Z",
            "metadata": {},
            "nodes": "not-a-list",
            "relationships": [],
        });
        let err = snapshots.restore(&malformed).unwrap_err();
        assert!(err.to_string().contains("nodes"));
    }

    #[test]
    fn test_relationship_with_missing_endpoint_is_skipped() {
        let (_db, _store, snapshots) = setup();
        let doc = json!({
            "version": "1.0",
            "timestamp": "2026-01-01T00:00:00Z",
            "metadata": {},
            "nodes": [
                {"id": "a", "labels": ["Task"], "properties": {}},
            ],
            "relationships": [
                {"id": "r1", "startNode": "a", "endNode": "ghost", "type": "DEPENDS_ON", "properties": {}},
            ],
        });

        let stats = snapshots.restore(&doc).unwrap();
        assert_eq!(stats.nodes_restored, 1);
        assert_eq!(stats.relationships_restored, 0);
        assert_eq!(stats.relationships_skipped, 1);
    }
}

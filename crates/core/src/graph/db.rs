//! # Graph Database
//!
//! Single SQLite database holding the knowledge graph. All state lives in
//! two generic tables — `nodes` and `relationships` — so snapshot export,
//! restore, and relationship queries share one shape regardless of label.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::runtime;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Handle to the knowledge graph database
#[derive(Clone)]
pub struct GraphDb {
    conn: Arc<Mutex<Connection>>,
}

impl GraphDb {
    /// Open or create the database at `.stigmergy/stigmergy.db`
    pub fn open() -> Result<Self> {
        if let Some(parent) = runtime::db_path().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::open_at(runtime::db_path())
    }

    /// Open a database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn =
            Connection::open(path.as_ref()).context("Failed to open stigmergy database")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database
    ///
    /// Satisfies the same contract as the on-disk store; used throughout the
    /// test suite.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(250))
            .context("Failed to set busy timeout")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get the shared connection for use by the transaction runner
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - complete schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        // Graph nodes: one row per entity, typed by label, open property map
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Directed typed relationships between nodes
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                start_node TEXT NOT NULL,
                end_node TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_nodes_label ON nodes(label)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rels_type ON relationships(rel_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rels_start ON relationships(start_node)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rels_end ON relationships(end_node)",
            [],
        )?;

        tracing::info!("GraphDb initialized with schema version {}", SCHEMA_VERSION);

        Ok(())
    }
}

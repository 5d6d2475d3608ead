//! # Transaction Runner
//!
//! Every graph operation goes through here as either a read or a write
//! transaction. Transient lock conflicts are retried in a bounded loop with
//! doubling backoff; write units of work must therefore be safe to re-run.
//! Exposes counters and a health probe for observability.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::db::GraphDb;

/// Maximum attempts for one unit of work before the error propagates
const MAX_ATTEMPTS: u32 = 5;

/// Initial backoff between attempts; doubles on each retry
const BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Aggregate transaction counters
#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,
}

/// Point-in-time view of the runner's counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxnMetrics {
    /// Transaction attempts, including retried ones
    pub attempts: u64,
    /// Attempts that were retried after a transient conflict
    pub retries: u64,
    /// Units of work that exhausted their retry budget or failed outright
    pub failures: u64,
    /// Cumulative wall-clock time spent inside transactions, in microseconds
    pub total_latency_us: u64,
}

/// Runs units of work against the store as read or write transactions
#[derive(Clone)]
pub struct TransactionRunner {
    conn: Arc<Mutex<Connection>>,
    counters: Arc<Counters>,
}

impl TransactionRunner {
    pub fn new(db: &GraphDb) -> Self {
        Self {
            conn: db.connection(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Execute a unit of work in a read transaction
    pub fn read<T>(&self, f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        self.run("BEGIN DEFERRED", f)
    }

    /// Execute a unit of work in a write transaction
    ///
    /// The closure may run more than once if a transient conflict forces a
    /// retry, so it must not have side effects outside the connection.
    pub fn write<T>(&self, f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        self.run("BEGIN IMMEDIATE", f)
    }

    fn run<T>(&self, begin: &str, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0;

        // Bounded loop, not recursion: stack depth stays constant and the
        // attempt budget is explicit.
        let result = loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

                match conn
                    .execute_batch(begin)
                    .context("Failed to begin transaction")
                {
                    Ok(()) => match f(&conn) {
                        Ok(value) => match conn
                            .execute_batch("COMMIT")
                            .context("Failed to commit transaction")
                        {
                            Ok(()) => Ok(value),
                            Err(e) => {
                                // a failed COMMIT leaves the transaction open
                                conn.execute_batch("ROLLBACK").ok();
                                Err(e)
                            }
                        },
                        Err(e) => {
                            conn.execute_batch("ROLLBACK").ok();
                            Err(e)
                        }
                    },
                    Err(e) => Err(e),
                }
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient store conflict, retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    break Err(e);
                }
            }
        };

        self.counters
            .total_latency_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);

        result
    }

    /// Health probe: can a trivial query execute?
    pub fn health(&self) -> Result<()> {
        self.read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
                .context("Health probe query failed")?;
            Ok(())
        })
    }

    /// Current counter values
    pub fn metrics(&self) -> TxnMetrics {
        TxnMetrics {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            total_latency_us: self.counters.total_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Whether an error is a transient SQLite lock conflict worth retrying
fn is_transient(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(inner, _)) => matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> TransactionRunner {
        TransactionRunner::new(&GraphDb::open_in_memory().unwrap())
    }

    #[test]
    fn test_read_and_write_commit() {
        let runner = runner();

        runner
            .write(|conn| {
                conn.execute(
                    "INSERT INTO nodes (id, label, properties, created_at) VALUES ('n1', 'Task', '{}', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let count: i64 = runner
            .read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let runner = runner();

        let result: Result<()> = runner.write(|conn| {
            conn.execute(
                "INSERT INTO nodes (id, label, properties, created_at) VALUES ('n1', 'Task', '{}', '2026-01-01T00:00:00Z')",
                [],
            )?;
            anyhow::bail!("unit of work failed");
        });
        assert!(result.is_err());

        let count: i64 = runner
            .read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0, "rolled-back insert must not be visible");
    }

    #[test]
    fn test_failed_commit_leaves_connection_usable() {
        let runner = runner();

        // The closure commits on its own, so the runner's COMMIT fails with
        // "no transaction is active". The connection must come back clean.
        let result: Result<()> = runner.write(|conn| {
            conn.execute_batch("COMMIT")?;
            Ok(())
        });
        assert!(result.is_err());

        runner
            .write(|conn| {
                conn.execute(
                    "INSERT INTO nodes (id, label, properties, created_at) VALUES ('n2', 'Task', '{}', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .expect("runner must recover after a failed commit");
    }

    #[test]
    fn test_health_probe() {
        let runner = runner();
        assert!(runner.health().is_ok());
    }

    #[test]
    fn test_metrics_count_attempts() {
        let runner = runner();
        runner.read(|_conn| Ok(())).unwrap();
        runner.read(|_conn| Ok(())).unwrap();

        let metrics = runner.metrics();
        assert!(metrics.attempts >= 2);
        assert_eq!(metrics.retries, 0);
    }

    #[test]
    fn test_non_transient_error_is_not_retried() {
        let runner = runner();
        let before = runner.metrics().attempts;

        let result: Result<()> = runner.write(|_conn| anyhow::bail!("fatal"));
        assert!(result.is_err());

        let metrics = runner.metrics();
        assert_eq!(metrics.attempts - before, 1, "no retry for non-transient errors");
        assert_eq!(metrics.failures, 1);
    }
}

//! # Transactional Executor (事务执行器)
//!
//! Applies one unit inside its own savepoint, nested in the runner's run
//! scope. The ledger row is written in the same savepoint, so a unit and its
//! record are kept or discarded together.
//!
//! ```text
//! SAVEPOINT migration_run
//!   SAVEPOINT unit_0002   forward → verify → ledger row → RELEASE
//!   SAVEPOINT unit_0003   forward fails → ROLLBACK TO unit_0003; RELEASE
//! ROLLBACK TO migration_run   (runner decides)
//! ```

use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;

use super::baseline::{capture_for, Baseline};
use super::definitions::MigrationConn;
use super::ledger::SchemaLedger;
use super::registry::RegisteredMigration;
use super::{ExecutionError, MigrationError};

// ============================================================================
// Savepoint guard
// ============================================================================

/// RAII savepoint on a shared connection.
///
/// Dropping an unfinished guard rolls it back. SQLite starts a transaction
/// for the outermost savepoint, so releasing that one commits.
pub(crate) struct Savepoint<'c> {
    conn: &'c Connection,
    name: String,
    finished: bool,
}

impl<'c> Savepoint<'c> {
    pub(crate) fn open(conn: &'c Connection, name: impl Into<String>) -> rusqlite::Result<Self> {
        let name = name.into();
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(Self {
            conn,
            name,
            finished: false,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// On error the guard is dropped unfinished, which rolls it back.
    pub(crate) fn release(mut self) -> rusqlite::Result<()> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.finished = true;
        Ok(())
    }

    /// Forgets a savepoint that no longer exists, e.g. after the
    /// transaction was ended underneath it.
    pub(crate) fn abandon(mut self) {
        self.finished = true;
    }

    pub(crate) fn rollback(mut self) -> rusqlite::Result<()> {
        self.finished = true;
        self.conn
            .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self
            .conn
            .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))
        {
            tracing::error!(savepoint = %self.name, error = %e, "[Executor] 保存点回滚失败");
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// What happened to a pending unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Forward action executed.
    Applied,
    /// Objects already present; only the ledger row was written.
    Backfilled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Backfilled => "backfilled",
        }
    }
}

pub struct TransactionalExecutor;

impl TransactionalExecutor {
    /// Runs the unit's forward action, verifies its declared objects and
    /// records it. On failure only this unit's savepoint is rolled back.
    pub fn apply(
        conn: &Connection,
        migration: &RegisteredMigration,
    ) -> Result<Outcome, MigrationError> {
        let key = migration.key();
        let started = Instant::now();

        let executed = in_unit_scope(conn, migration, || {
            let mut mconn = MigrationConn::new(conn);
            if let Err(err) = migration.unit().forward(&mut mconn) {
                return Err(ExecutionError {
                    key: key.to_string(),
                    statement: mconn.failing_statement().map(str::to_string),
                    source: err.into(),
                }
                .into());
            }
            if conn.is_autocommit() {
                return Err(ExecutionError {
                    key: key.to_string(),
                    statement: None,
                    source: "the unit ended the run's transaction; its changes and those of earlier units in this run were committed".into(),
                }
                .into());
            }
            verify(conn, migration)?;
            SchemaLedger::record(conn, key, false)?;
            Ok(mconn.statements_executed())
        })?;

        tracing::info!(
            key = key,
            ordinal = migration.ordinal(),
            outcome = Outcome::Applied.as_str(),
            statements = executed,
            duration_ms = started.elapsed().as_millis() as u64,
            "[Executor] 迁移已执行"
        );
        Ok(Outcome::Applied)
    }

    /// Records a unit whose objects already exist, without running it.
    pub fn backfill(
        conn: &Connection,
        migration: &RegisteredMigration,
    ) -> Result<Outcome, MigrationError> {
        in_unit_scope(conn, migration, || {
            SchemaLedger::record(conn, migration.key(), true).map(|_| ())
        })?;

        tracing::info!(
            key = migration.key(),
            ordinal = migration.ordinal(),
            outcome = Outcome::Backfilled.as_str(),
            "[Executor] 目标对象已存在，仅补记账本"
        );
        Ok(Outcome::Backfilled)
    }
}

/// Runs `body` in a savepoint named after the unit's ordinal.
fn in_unit_scope<T>(
    conn: &Connection,
    migration: &RegisteredMigration,
    body: impl FnOnce() -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let scope_err = |context: &'static str, e: rusqlite::Error| {
        MigrationError::Execution(ExecutionError {
            key: migration.key().to_string(),
            statement: None,
            source: anyhow::Error::new(e).context(context).into(),
        })
    };

    let savepoint = Savepoint::open(conn, format!("unit_{:04}", migration.ordinal()))
        .map_err(|e| scope_err("opening unit savepoint", e))?;

    match body() {
        Ok(value) => {
            savepoint
                .release()
                .map_err(|e| scope_err("releasing unit savepoint", e))?;
            Ok(value)
        }
        Err(err) => {
            if conn.is_autocommit() {
                savepoint.abandon();
                return Err(err);
            }
            let name = savepoint.name().to_string();
            if let Err(rollback_err) = savepoint.rollback() {
                tracing::error!(
                    key = migration.key(),
                    savepoint = %name,
                    error = %rollback_err,
                    "[Executor] 单元保存点回滚失败"
                );
            }
            Err(err)
        }
    }
}

/// Fail-close check that a unit produced what it declares.
fn verify(conn: &Connection, migration: &RegisteredMigration) -> Result<(), MigrationError> {
    let unit = migration.unit();
    if !unit.declares_baseline() {
        return Ok(());
    }
    let snapshot = capture_for(conn, migration.key())?;
    match unit.baseline(&snapshot) {
        Baseline::Missing(reason) => Err(ExecutionError {
            key: migration.key().to_string(),
            statement: None,
            source: anyhow::anyhow!(reason)
                .context("post-migration verification failed")
                .into(),
        }
        .into()),
        Baseline::Satisfied | Baseline::Undeclared => Ok(()),
    }
}

//! # Migration 模块
//!
//! Brings a previously deployed job-manager database up to the current schema,
//! whichever application version last wrote to it.
//!
//! ---
//!
//! # ⚠️ Migration authoring rules
//!
//! 1. **Idempotent forward actions**: every statement is guarded
//!    (`IF NOT EXISTS` / `IF EXISTS` / column introspection). A unit may run
//!    against a database that already holds its objects.
//! 2. **Declare expected objects**: a unit that declares the tables, columns
//!    and indexes it produces can be baselined on drifted databases instead of
//!    being re-executed.
//! 3. **Never edit a released migration**: ship a new `NNN_description` unit.
//! 4. **Never rename a recorded key**: add an alias to
//!    [`job_manager::LEGACY_KEY_ALIASES`] instead.
//!
//! ## 组件
//!
//! - `definitions`: the [`MigrationUnit`] interface, SQL and code units
//! - `registry`: discovery, ordinal ordering, legacy key aliases
//! - `ledger`: the `schema_migrations` history table
//! - `baseline`: schema snapshots and the baseline detector
//! - `executor`: per-unit savepoint execution
//! - `runner`: run orchestration, state machine and [`RunReport`]
//! - `script_checker`: static idempotence lint for SQL scripts
//! - `job_manager`: the built-in migration set
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use schema_migrator::migration::{job_manager, MigrationRunner};
//!
//! let registry = job_manager::registry()?;
//! let report = MigrationRunner::new(&registry).run(&conn);
//! assert!(report.is_committed());
//! ```

// ============================================================================
// 子模块
// ============================================================================

pub mod baseline;
pub mod definitions;
pub mod executor;
pub mod job_manager;
pub mod ledger;
pub mod registry;
pub mod runner;
pub mod script_checker;

// ============================================================================
// Re-exports - 核心类型
// ============================================================================

pub use baseline::{Baseline, BaselineDetector, SchemaExpectation, SchemaSnapshot};
pub use definitions::{FnMigration, MigrationConn, MigrationUnit, ScriptFileMigration, SqlMigration};
pub use executor::{Outcome, TransactionalExecutor};
pub use ledger::{LedgerRecord, SchemaLedger, LEDGER_TABLE};
pub use registry::{MigrationRegistry, MigrationRegistryBuilder, RegisteredMigration};
pub use runner::{FailureKind, MigrationRunner, RunFailure, RunReport, RunState, RunStatus};

use std::path::PathBuf;

// ============================================================================
// 错误类型
// ============================================================================

/// 迁移错误
///
/// Every variant is fatal for the run that raised it; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Reaching this means the pending-set computation disagrees with the ledger.
    #[error("Ledger already contains key '{key}' (pending set is inconsistent with the ledger)")]
    DuplicateLedgerKey { key: String },

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl MigrationError {
    /// Key of the migration unit involved, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            MigrationError::DuplicateLedgerKey { key } => Some(key),
            MigrationError::Execution(err) => Some(&err.key),
            _ => None,
        }
    }
}

/// Malformed or conflicting migration definitions. Raised before any
/// database access.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Malformed migration name '{name}': expected NNN_description")]
    MalformedName { name: String },

    #[error("Duplicate ordinal {ordinal}: '{first}' and '{second}'")]
    DuplicateOrdinal {
        ordinal: u32,
        first: String,
        second: String,
    },

    #[error("Duplicate migration key '{key}'")]
    DuplicateKey { key: String },

    #[error("Alias conflict for '{alias}': {reason}")]
    AliasConflict { alias: String, reason: String },

    #[error("Cannot read migration source {}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The ledger table could not be created, read or written.
#[derive(Debug, thiserror::Error)]
#[error("Ledger {operation} failed")]
pub struct LedgerError {
    pub operation: &'static str,
    #[source]
    pub source: rusqlite::Error,
}

impl LedgerError {
    pub(crate) fn new(operation: &'static str, source: rusqlite::Error) -> Self {
        Self { operation, source }
    }
}

/// A unit's forward action (or its verification) failed against the live
/// database. `source` carries the full causal chain.
#[derive(Debug, thiserror::Error)]
#[error("Migration '{key}' failed{}", describe_statement(.statement))]
pub struct ExecutionError {
    pub key: String,
    /// SQL statement that was executing when the failure happened.
    pub statement: Option<String>,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

fn describe_statement(statement: &Option<String>) -> String {
    match statement {
        Some(sql) => format!(" at statement `{}`", shorten_statement(sql)),
        None => String::new(),
    }
}

/// Keeps long statements readable in one-line messages; logs carry the full text.
pub(crate) fn shorten_statement(sql: &str) -> String {
    const MAX_LEN: usize = 120;
    let flat: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_LEN {
        return flat;
    }
    let head: String = flat.chars().take(MAX_LEN).collect();
    format!("{}...", head)
}

/// Flattens an error and all of its causes, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    chain
}

// ============================================================================
// 测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_walks_sources() {
        let err = MigrationError::from(ExecutionError {
            key: "003_update_hours_table".to_string(),
            statement: Some("ALTER TABLE hours ADD COLUMN start_date DATE".to_string()),
            source: anyhow::anyhow!("duplicate column name: start_date")
                .context("adding hours.start_date")
                .into(),
        });

        let chain = error_chain(&err);
        assert_eq!(
            chain[0],
            "Migration '003_update_hours_table' failed at statement `ALTER TABLE hours ADD COLUMN start_date DATE`"
        );
        assert!(chain.iter().any(|c| c == "adding hours.start_date"));
        assert!(chain.iter().any(|c| c.contains("duplicate column name")));
        assert_eq!(err.key(), Some("003_update_hours_table"));
    }

    #[test]
    fn test_shorten_statement_flattens_whitespace() {
        assert_eq!(
            shorten_statement("CREATE TABLE\n    IF NOT EXISTS  t (id INTEGER)"),
            "CREATE TABLE IF NOT EXISTS t (id INTEGER)"
        );
        let long = "x".repeat(300);
        assert!(shorten_statement(&long).ends_with("..."));
    }
}

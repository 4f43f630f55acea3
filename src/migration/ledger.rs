//! # Schema Ledger (迁移账本)
//!
//! Persistent history of applied units, stored in the database it describes.
//!
//! ```sql
//! CREATE TABLE schema_migrations (
//!     filename   TEXT PRIMARY KEY,   -- canonical key
//!     applied_at TEXT,               -- RFC 3339
//!     backfilled INTEGER NOT NULL DEFAULT 0
//! );
//! ```
//!
//! Older engine versions created the table without `backfilled` and keyed
//! rows by `.py` filename; both are handled here. Rows are append-only.

use std::collections::HashSet;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use super::baseline::{column_exists, table_exists};
use super::registry::MigrationRegistry;
use super::{LedgerError, MigrationError};

pub const LEDGER_TABLE: &str = "schema_migrations";

/// One applied (or backfilled) unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRecord {
    /// Key as recorded; may be a legacy alias.
    pub key: String,
    pub applied_at: Option<String>,
    pub backfilled: bool,
}

pub struct SchemaLedger;

impl SchemaLedger {
    /// Creates the table, or upgrades a legacy one. Issues no DDL when the
    /// table is already current.
    pub fn ensure_exists(conn: &Connection) -> Result<(), LedgerError> {
        let exists = table_exists(conn, LEDGER_TABLE)
            .map_err(|e| LedgerError::new("introspection", e))?;

        if !exists {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    filename TEXT PRIMARY KEY,
                    applied_at TEXT,
                    backfilled INTEGER NOT NULL DEFAULT 0
                )",
            )
            .map_err(|e| LedgerError::new("create", e))?;
            tracing::info!(table = LEDGER_TABLE, "[Ledger] 已创建迁移账本表");
            return Ok(());
        }

        let has_backfilled = column_exists(conn, LEDGER_TABLE, "backfilled")
            .map_err(|e| LedgerError::new("introspection", e))?;
        if !has_backfilled {
            conn.execute_batch(
                "ALTER TABLE schema_migrations ADD COLUMN backfilled INTEGER NOT NULL DEFAULT 0",
            )
            .map_err(|e| LedgerError::new("upgrade", e))?;
            tracing::info!(table = LEDGER_TABLE, "[Ledger] 旧版账本表已补充 backfilled 列");
        }
        Ok(())
    }

    /// Read-only check used by status displays.
    pub fn exists(conn: &Connection) -> Result<bool, LedgerError> {
        table_exists(conn, LEDGER_TABLE).map_err(|e| LedgerError::new("introspection", e))
    }

    /// Every row, in key order.
    pub fn load_records(conn: &Connection) -> Result<Vec<LedgerRecord>, LedgerError> {
        let read = |e| LedgerError::new("read", e);
        let mut stmt = conn
            .prepare("SELECT filename, applied_at, backfilled FROM schema_migrations ORDER BY filename")
            .map_err(read)?;
        let records = stmt
            .query_map([], |row| {
                Ok(LedgerRecord {
                    key: row.get(0)?,
                    applied_at: timestamp_text(row.get_ref(1)?),
                    backfilled: row.get::<_, Option<i64>>(2)?.unwrap_or(0) != 0,
                })
            })
            .map_err(read)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read)?;
        Ok(records)
    }

    /// Canonical keys of applied units. Legacy keys are resolved through the
    /// registry's alias table; rows matching nothing are logged and ignored.
    pub fn load_applied(
        conn: &Connection,
        registry: &MigrationRegistry,
    ) -> Result<HashSet<String>, LedgerError> {
        let mut applied = HashSet::new();
        for record in Self::load_records(conn)? {
            match registry.resolve_key(&record.key) {
                Some(canonical) => {
                    if canonical != record.key {
                        tracing::debug!(
                            recorded = %record.key,
                            canonical = canonical,
                            "[Ledger] 历史键已映射到规范键"
                        );
                    }
                    applied.insert(canonical.to_string());
                }
                None => {
                    tracing::warn!(
                        recorded = %record.key,
                        "[Ledger] 账本记录不对应任何已注册迁移（孤儿记录）"
                    );
                }
            }
        }
        Ok(applied)
    }

    /// Writes the row for `key`. A second row for the same key is an
    /// invariant violation.
    pub fn record(
        conn: &Connection,
        key: &str,
        backfilled: bool,
    ) -> Result<LedgerRecord, MigrationError> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT filename FROM schema_migrations WHERE filename = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LedgerError::new("read", e))?;
        if existing.is_some() {
            return Err(MigrationError::DuplicateLedgerKey {
                key: key.to_string(),
            });
        }

        let applied_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO schema_migrations (filename, applied_at, backfilled) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, applied_at, backfilled],
        )
        .map_err(|e| LedgerError::new("write", e))?;

        tracing::debug!(key = key, backfilled = backfilled, "[Ledger] 已写入账本记录");
        Ok(LedgerRecord {
            key: key.to_string(),
            applied_at: Some(applied_at),
            backfilled,
        })
    }
}

/// Legacy rows may hold the timestamp as text, a number or NULL.
fn timestamp_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Blob(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::definitions::SqlMigration;
    use assert_matches::assert_matches;

    fn registry() -> MigrationRegistry {
        MigrationRegistry::builder()
            .register(SqlMigration::new("001_initial.sql", "SELECT 1;"))
            .register(SqlMigration::new("002_create_auth_tables.sql", "SELECT 1;"))
            .alias("001_initial.py", "001_initial.sql")
            .alias("create_auth_tables_002", "002_create_auth_tables.sql")
            .build()
            .unwrap()
    }

    #[test]
    fn test_ensure_exists_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        SchemaLedger::ensure_exists(&conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA schema_version", [], |r| r.get(0))
            .unwrap();

        SchemaLedger::ensure_exists(&conn).unwrap();
        let after: i64 = conn
            .query_row("PRAGMA schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, after);
    }

    #[test]
    fn test_upgrades_legacy_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_migrations (filename VARCHAR PRIMARY KEY, applied_at TIMESTAMP);
             INSERT INTO schema_migrations VALUES ('001_initial.py', '2024-03-01 10:00:00');",
        )
        .unwrap();

        SchemaLedger::ensure_exists(&conn).unwrap();
        assert!(column_exists(&conn, LEDGER_TABLE, "backfilled").unwrap());

        let records = SchemaLedger::load_records(&conn).unwrap();
        assert_eq!(
            records,
            vec![LedgerRecord {
                key: "001_initial.py".to_string(),
                applied_at: Some("2024-03-01 10:00:00".to_string()),
                backfilled: false,
            }]
        );
    }

    #[test]
    fn test_load_applied_resolves_aliases_and_ignores_orphans() {
        let conn = Connection::open_in_memory().unwrap();
        SchemaLedger::ensure_exists(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO schema_migrations (filename, applied_at) VALUES
                ('001_initial.py', '2024-03-01'),
                ('create_auth_tables_002', NULL),
                ('099_removed_long_ago.py', '2023-01-01');",
        )
        .unwrap();

        let applied = SchemaLedger::load_applied(&conn, &registry()).unwrap();
        let expected: HashSet<String> = ["001_initial.sql", "002_create_auth_tables.sql"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(applied, expected);
    }

    #[test]
    fn test_record_rejects_duplicate_key() {
        let conn = Connection::open_in_memory().unwrap();
        SchemaLedger::ensure_exists(&conn).unwrap();

        let record = SchemaLedger::record(&conn, "001_initial.sql", true).unwrap();
        assert!(record.backfilled);
        assert!(record.applied_at.is_some());

        let err = SchemaLedger::record(&conn, "001_initial.sql", false).unwrap_err();
        assert_matches!(err, MigrationError::DuplicateLedgerKey { key } if key == "001_initial.sql");
    }

    #[test]
    fn test_missing_table_is_ledger_error() {
        let conn = Connection::open_in_memory().unwrap();
        let err = SchemaLedger::load_records(&conn).unwrap_err();
        assert_eq!(err.operation, "read");
    }
}

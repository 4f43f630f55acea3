//! # Baseline Detector (基线检测)
//!
//! Decides whether a pending unit's effects already exist in the live
//! database even though the ledger has no record of it. Typical cause: an
//! older application version created tables directly with a bulk
//! "verify and create tables" step, leaving no migration history.
//!
//! ## 检查内容
//!
//! - 表是否存在
//! - 列是否存在 / 是否已删除
//! - 索引是否存在
//!
//! The same expectations are reused after execution to verify a unit did
//! what it declares.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;

use super::registry::RegisteredMigration;
use super::{ExecutionError, MigrationError};

// ============================================================================
// Snapshot
// ============================================================================

/// Tables, columns and indexes visible on a connection at one instant.
///
/// Captured per check and never cached: each unit can change what is visible.
/// Names are compared case-insensitively, like SQLite identifiers.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, BTreeSet<String>>,
    indexes: BTreeSet<String>,
}

impl SchemaSnapshot {
    pub fn capture(conn: &Connection) -> rusqlite::Result<Self> {
        let mut tables = BTreeMap::new();

        let table_names: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };

        let mut column_stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        for table in table_names {
            let columns = column_stmt
                .query_map([table.as_str()], |row| row.get::<_, String>(0))?
                .map(|name| name.map(|n| n.to_lowercase()))
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            tables.insert(table.to_lowercase(), columns);
        }

        let mut index_stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index'")?;
        let indexes = index_stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|name| name.map(|n| n.to_lowercase()))
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;

        Ok(Self { tables, indexes })
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_lowercase())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(&table.to_lowercase())
            .map(|columns| columns.contains(&column.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indexes.contains(&index.to_lowercase())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// 检查表是否存在
pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 COLLATE NOCASE)",
        [table],
        |row| row.get(0),
    )
}

/// 检查列是否存在
pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2 COLLATE NOCASE",
        rusqlite::params![table, column],
        |row| row.get(0),
    )
}

// ============================================================================
// Expectations
// ============================================================================

/// Result of checking a unit's predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline {
    /// The unit has no predicate; it is never baselined.
    Undeclared,
    Satisfied,
    /// First missing object, for logs.
    Missing(String),
}

impl Baseline {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Baseline::Satisfied)
    }
}

/// Objects a unit leaves behind once applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaExpectation {
    pub tables: Vec<String>,
    pub columns: Vec<(String, String)>,
    pub indexes: Vec<String>,
    pub absent_columns: Vec<(String, String)>,
}

impl SchemaExpectation {
    pub fn from_static(
        tables: &[&str],
        columns: &[(&str, &str)],
        indexes: &[&str],
        absent_columns: &[(&str, &str)],
    ) -> Self {
        let pairs = |list: &[(&str, &str)]| {
            list.iter()
                .map(|(t, c)| (t.to_string(), c.to_string()))
                .collect::<Vec<_>>()
        };
        Self {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            columns: pairs(columns),
            indexes: indexes.iter().map(|i| i.to_string()).collect(),
            absent_columns: pairs(absent_columns),
        }
    }

    /// Reads `-- @baseline` header annotations from a script:
    ///
    /// ```sql
    /// -- @baseline table hours
    /// -- @baseline column hours.start_date
    /// -- @baseline index idx_hours_document
    /// -- @baseline absent-column hours.work_date
    /// ```
    ///
    /// Malformed annotations are ignored with a warning.
    pub fn parse_annotations(sql: &str) -> Self {
        let mut expectation = Self::default();
        for line in sql.lines() {
            let Some(rest) = line.trim().strip_prefix("-- @baseline") else {
                continue;
            };
            let mut parts = rest.split_whitespace();
            let (Some(kind), Some(target)) = (parts.next(), parts.next()) else {
                tracing::warn!(annotation = line.trim(), "[Baseline] 忽略不完整的基线注解");
                continue;
            };
            match kind {
                "table" => expectation.tables.push(target.to_string()),
                "index" => expectation.indexes.push(target.to_string()),
                "column" | "absent-column" => {
                    let Some((table, column)) = target.split_once('.') else {
                        tracing::warn!(annotation = line.trim(), "[Baseline] 列注解需要 table.column 格式");
                        continue;
                    };
                    let pair = (table.to_string(), column.to_string());
                    if kind == "column" {
                        expectation.columns.push(pair);
                    } else {
                        expectation.absent_columns.push(pair);
                    }
                }
                other => {
                    tracing::warn!(kind = other, "[Baseline] 未知的基线注解类型");
                }
            }
        }
        expectation
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.columns.is_empty()
            && self.indexes.is_empty()
            && self.absent_columns.is_empty()
    }

    pub fn evaluate(&self, snapshot: &SchemaSnapshot) -> Baseline {
        if self.is_empty() {
            return Baseline::Undeclared;
        }
        if let Some(table) = self.tables.iter().find(|t| !snapshot.has_table(t)) {
            return Baseline::Missing(format!("Table '{}' not found", table));
        }
        if let Some((table, column)) = self
            .columns
            .iter()
            .find(|(t, c)| !snapshot.has_column(t, c))
        {
            return Baseline::Missing(format!("Column '{}.{}' not found", table, column));
        }
        if let Some(index) = self.indexes.iter().find(|i| !snapshot.has_index(i)) {
            return Baseline::Missing(format!("Index '{}' not found", index));
        }
        if let Some((table, column)) = self
            .absent_columns
            .iter()
            .find(|(t, c)| snapshot.has_column(t, c))
        {
            return Baseline::Missing(format!("Column '{}.{}' still present", table, column));
        }
        Baseline::Satisfied
    }
}

// ============================================================================
// Detector
// ============================================================================

/// 基线检测器
pub struct BaselineDetector;

impl BaselineDetector {
    /// True only when the unit declares a predicate and it holds against a
    /// snapshot captured now. Never mutates the database.
    pub fn is_baselined(
        conn: &Connection,
        migration: &RegisteredMigration,
    ) -> Result<bool, MigrationError> {
        let unit = migration.unit();
        if !unit.declares_baseline() {
            tracing::debug!(key = migration.key(), "[Baseline] 无基线谓词，直接执行");
            return Ok(false);
        }

        let snapshot = capture_for(conn, migration.key())?;
        match unit.baseline(&snapshot) {
            Baseline::Satisfied => {
                tracing::info!(
                    key = migration.key(),
                    ordinal = migration.ordinal(),
                    "[Baseline] 目标对象已存在，补记账本"
                );
                Ok(true)
            }
            Baseline::Missing(reason) => {
                tracing::debug!(key = migration.key(), reason = %reason, "[Baseline] 基线不满足");
                Ok(false)
            }
            Baseline::Undeclared => Ok(false),
        }
    }
}

/// Captures a snapshot, attributing introspection failures to the unit.
pub(crate) fn capture_for(conn: &Connection, key: &str) -> Result<SchemaSnapshot, MigrationError> {
    SchemaSnapshot::capture(conn).map_err(|e| {
        MigrationError::Execution(ExecutionError {
            key: key.to_string(),
            statement: None,
            source: anyhow::Error::new(e).context("schema introspection failed").into(),
        })
    })
}

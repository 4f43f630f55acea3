//! # Migration Definitions (迁移定义)
//!
//! The capability interface every migration unit implements, plus the three
//! unit kinds the engine ships with:
//!
//! - [`SqlMigration`]: embedded SQL script (`include_str!`), const-constructible
//! - [`FnMigration`]: forward action written in Rust, for steps SQLite cannot
//!   guard in plain SQL (conditional `ALTER TABLE`)
//! - [`ScriptFileMigration`]: `.sql` file discovered on disk, read on first use
//!
//! ## 设计原则
//!
//! - `forward` must be idempotent; the double-run tests enforce it
//! - Expected objects double as the baseline predicate and as post-execution
//!   verification
//! - Ordinals are never stored on the unit; the registry derives them from the key

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use rusqlite::Connection;

use super::baseline::{Baseline, SchemaExpectation, SchemaSnapshot};

// ============================================================================
// MigrationUnit
// ============================================================================

/// A self-describing schema change.
pub trait MigrationUnit: Send + Sync {
    /// Canonical ledger key (the `NNN_description` filename).
    fn key(&self) -> &str;

    /// Applies the change. Must succeed on a database that already contains
    /// the unit's target objects.
    fn forward(&self, conn: &mut MigrationConn<'_>) -> anyhow::Result<()>;

    /// Whether [`MigrationUnit::baseline`] can ever report `Satisfied`.
    /// Checked first so units without a predicate skip introspection.
    fn declares_baseline(&self) -> bool {
        false
    }

    /// Read-only check of the unit's objects against a fresh snapshot.
    fn baseline(&self, _snapshot: &SchemaSnapshot) -> Baseline {
        Baseline::Undeclared
    }

    /// SQL text of the unit, when it is script-backed.
    fn script(&self) -> anyhow::Result<Option<&str>> {
        Ok(None)
    }
}

// ============================================================================
// MigrationConn
// ============================================================================

/// Connection handle given to forward actions.
///
/// Remembers the statement that failed so a failure can be reported together with
/// the SQL that caused it. Transaction control statements are refused: a unit
/// runs inside the run's savepoints and must not end them.
pub struct MigrationConn<'c> {
    conn: &'c Connection,
    failed: Option<String>,
    executed: usize,
}

impl<'c> MigrationConn<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            failed: None,
            executed: 0,
        }
    }

    /// Executes a single statement.
    pub fn execute<P: rusqlite::Params>(&mut self, sql: &str, params: P) -> rusqlite::Result<usize> {
        if let Err(err) = refuse_transaction_control(sql) {
            self.failed = Some(sql.trim().to_string());
            return Err(err);
        }
        match self.conn.execute(sql, params) {
            Ok(changed) => {
                self.failed = None;
                self.executed += 1;
                Ok(changed)
            }
            Err(err) => {
                self.failed = Some(sql.trim().to_string());
                Err(err)
            }
        }
    }

    /// Executes a script statement by statement.
    pub fn execute_script(&mut self, script: &str) -> rusqlite::Result<()> {
        for statement in split_statements(script) {
            if let Err(err) = refuse_transaction_control(&statement)
                .and_then(|_| self.conn.execute_batch(&statement))
            {
                self.failed = Some(statement);
                return Err(err);
            }
            self.failed = None;
            self.executed += 1;
        }
        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> rusqlite::Result<bool> {
        super::baseline::table_exists(self.conn, table)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> rusqlite::Result<bool> {
        super::baseline::column_exists(self.conn, table, column)
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Connection {
        self.conn
    }

    /// Statement that failed, if the last statement did not complete.
    pub(crate) fn failing_statement(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    pub fn statements_executed(&self) -> usize {
        self.executed
    }
}

const TRANSACTION_KEYWORDS: [&str; 6] = ["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"];

/// Leading keyword of a statement that opens or closes a transaction or
/// savepoint, if any. Comments are expected to be stripped already.
pub(crate) fn transaction_keyword(statement: &str) -> Option<&'static str> {
    let first = statement
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()?;
    TRANSACTION_KEYWORDS
        .iter()
        .copied()
        .find(|kw| first.eq_ignore_ascii_case(kw))
}

fn refuse_transaction_control(sql: &str) -> rusqlite::Result<()> {
    let found = split_statements(sql)
        .iter()
        .find_map(|statement| transaction_keyword(statement));
    match found {
        Some(keyword) => Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_AUTH),
            Some(format!("{} is not allowed inside a migration unit", keyword)),
        )),
        None => Ok(()),
    }
}

/// Splits a SQL script into statements.
///
/// Comments are dropped. A `;` ends a statement only when SQLite's own
/// tokenizer (`sqlite3_complete`) agrees, so semicolons inside string
/// literals, quoted identifiers and trigger bodies do not split.
pub(crate) fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                // '' inside a literal is an escaped quote
                if chars.peek() == Some(&q) {
                    current.push(q);
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '[' => {
                quote = Some(']');
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
                current.push(' ');
            }
            ';' => {
                current.push(c);
                if is_complete(&current) {
                    push_statement(&mut statements, current.trim_end().trim_end_matches(';'));
                    current.clear();
                }
            }
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

fn is_complete(sql: &str) -> bool {
    let Ok(text) = CString::new(sql) else {
        // interior NUL: let SQLite reject the statement itself
        return true;
    };
    // SAFETY: `text` is a valid NUL-terminated string that outlives the call;
    // sqlite3_complete only reads it.
    unsafe { rusqlite::ffi::sqlite3_complete(text.as_ptr()) != 0 }
}

// ============================================================================
// SqlMigration
// ============================================================================

/// Embedded SQL migration.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    /// 规范文件名（如 "001_initial.sql"）
    pub key: &'static str,
    /// SQL 内容（include_str! 嵌入）
    pub sql: &'static str,
    /// 迁移后必须存在的表
    pub expected_tables: &'static [&'static str],
    /// 迁移后必须存在的列 (table, column)
    pub expected_columns: &'static [(&'static str, &'static str)],
    /// 迁移后必须存在的索引
    pub expected_indexes: &'static [&'static str],
    /// 迁移后必须不存在的列 (table, column)
    pub absent_columns: &'static [(&'static str, &'static str)],
}

impl SqlMigration {
    pub const fn new(key: &'static str, sql: &'static str) -> Self {
        Self {
            key,
            sql,
            expected_tables: &[],
            expected_columns: &[],
            expected_indexes: &[],
            absent_columns: &[],
        }
    }

    pub const fn with_expected_tables(mut self, tables: &'static [&'static str]) -> Self {
        self.expected_tables = tables;
        self
    }

    pub const fn with_expected_columns(
        mut self,
        columns: &'static [(&'static str, &'static str)],
    ) -> Self {
        self.expected_columns = columns;
        self
    }

    pub const fn with_expected_indexes(mut self, indexes: &'static [&'static str]) -> Self {
        self.expected_indexes = indexes;
        self
    }

    pub const fn with_absent_columns(
        mut self,
        columns: &'static [(&'static str, &'static str)],
    ) -> Self {
        self.absent_columns = columns;
        self
    }

    pub fn expectation(&self) -> SchemaExpectation {
        SchemaExpectation::from_static(
            self.expected_tables,
            self.expected_columns,
            self.expected_indexes,
            self.absent_columns,
        )
    }
}

impl MigrationUnit for SqlMigration {
    fn key(&self) -> &str {
        self.key
    }

    fn forward(&self, conn: &mut MigrationConn<'_>) -> anyhow::Result<()> {
        conn.execute_script(self.sql)
            .with_context(|| format!("executing script {}", self.key))
    }

    fn declares_baseline(&self) -> bool {
        !self.expectation().is_empty()
    }

    fn baseline(&self, snapshot: &SchemaSnapshot) -> Baseline {
        self.expectation().evaluate(snapshot)
    }

    fn script(&self) -> anyhow::Result<Option<&str>> {
        Ok(Some(self.sql))
    }
}

// ============================================================================
// FnMigration
// ============================================================================

pub type ForwardFn = fn(&mut MigrationConn<'_>) -> anyhow::Result<()>;
pub type BaselineFn = fn(&SchemaSnapshot) -> Baseline;

/// Migration whose forward action is Rust code.
#[derive(Clone, Copy)]
pub struct FnMigration {
    key: &'static str,
    forward: ForwardFn,
    baseline: Option<BaselineFn>,
}

impl FnMigration {
    pub const fn new(key: &'static str, forward: ForwardFn) -> Self {
        Self {
            key,
            forward,
            baseline: None,
        }
    }

    pub const fn with_baseline(mut self, baseline: BaselineFn) -> Self {
        self.baseline = Some(baseline);
        self
    }
}

impl std::fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMigration")
            .field("key", &self.key)
            .field("baseline", &self.baseline.is_some())
            .finish()
    }
}

impl MigrationUnit for FnMigration {
    fn key(&self) -> &str {
        self.key
    }

    fn forward(&self, conn: &mut MigrationConn<'_>) -> anyhow::Result<()> {
        (self.forward)(conn)
    }

    fn declares_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    fn baseline(&self, snapshot: &SchemaSnapshot) -> Baseline {
        match self.baseline {
            Some(check) => check(snapshot),
            None => Baseline::Undeclared,
        }
    }
}

// ============================================================================
// ScriptFileMigration
// ============================================================================

/// `.sql` file discovered on disk. Only the path is read at discovery; the
/// body is loaded on first use and cached.
///
/// Header annotations (`-- @baseline table hours`, ...) declare the
/// baseline predicate, see [`SchemaExpectation::parse_annotations`].
#[derive(Debug)]
pub struct ScriptFileMigration {
    key: String,
    path: PathBuf,
    sql: OnceLock<String>,
}

impl ScriptFileMigration {
    pub fn new(key: impl Into<String>, path: PathBuf) -> Self {
        Self {
            key: key.into(),
            path,
            sql: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.sql.get().is_some()
    }

    fn load(&self) -> anyhow::Result<&str> {
        if let Some(sql) = self.sql.get() {
            return Ok(sql);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading migration script {}", self.path.display()))?;
        Ok(self.sql.get_or_init(|| text))
    }

    fn expectation(&self) -> Option<SchemaExpectation> {
        match self.load() {
            Ok(sql) => Some(SchemaExpectation::parse_annotations(sql)),
            Err(err) => {
                // Without a readable script there is no predicate; forward
                // will surface the read error.
                tracing::warn!(
                    key = %self.key,
                    error = %err,
                    "[Migration] 无法读取迁移脚本，按无基线谓词处理"
                );
                None
            }
        }
    }
}

impl MigrationUnit for ScriptFileMigration {
    fn key(&self) -> &str {
        &self.key
    }

    fn forward(&self, conn: &mut MigrationConn<'_>) -> anyhow::Result<()> {
        let sql = self.load()?;
        conn.execute_script(sql)
            .with_context(|| format!("executing script {}", self.path.display()))
    }

    fn declares_baseline(&self) -> bool {
        self.expectation().map(|e| !e.is_empty()).unwrap_or(false)
    }

    fn baseline(&self, snapshot: &SchemaSnapshot) -> Baseline {
        match self.expectation() {
            Some(expectation) => expectation.evaluate(snapshot),
            None => Baseline::Undeclared,
        }
    }

    fn script(&self) -> anyhow::Result<Option<&str>> {
        self.load().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_handles_comments_and_literals() {
        let script = "
            -- header; with a semicolon
            CREATE TABLE IF NOT EXISTS a (id INTEGER PRIMARY KEY, note TEXT DEFAULT 'x;y');
            /* block; comment */
            INSERT INTO a (note) VALUES ('it''s; fine');
        ";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS a"));
        assert!(statements[0].contains("'x;y'"));
        assert_eq!(statements[1], "INSERT INTO a (note) VALUES ('it''s; fine')");
    }

    #[test]
    fn test_split_statements_keeps_trigger_body_together() {
        let script = "
            CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, updated_at TEXT);
            CREATE TRIGGER IF NOT EXISTS trg_t_touch AFTER UPDATE ON t
            BEGIN
                UPDATE t SET updated_at = 'now' WHERE id = NEW.id;
            END;
            CREATE INDEX IF NOT EXISTS idx_t ON t(updated_at);
        ";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3);
        assert!(statements[1].starts_with("CREATE TRIGGER"));
        assert!(statements[1].ends_with("END"));
    }

    #[test]
    fn test_split_statements_keeps_case_end_inside_trigger() {
        let script = "
            CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, a INTEGER, flag INTEGER);
            CREATE TRIGGER IF NOT EXISTS trg_t_flag AFTER INSERT ON t
            BEGIN
                UPDATE t SET flag = CASE WHEN NEW.a > 0 THEN 1 ELSE 0 END WHERE id = NEW.id;
            END;
            INSERT INTO t (a) VALUES (5);
        ";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3, "{:?}", statements);
        assert!(statements[1].contains("ELSE 0 END WHERE id = NEW.id;"));
        assert!(statements[1].ends_with("END"));

        let conn = Connection::open_in_memory().unwrap();
        let mut mconn = MigrationConn::new(&conn);
        mconn.execute_script(script).unwrap();
        let flag: i64 = conn.query_row("SELECT flag FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(flag, 1);
    }

    #[test]
    fn test_transaction_control_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("SAVEPOINT outer_scope").unwrap();
        let mut mconn = MigrationConn::new(&conn);

        let err = mconn
            .execute_script("CREATE TABLE IF NOT EXISTS b (id INTEGER);\nCOMMIT;")
            .unwrap_err();
        assert!(err.to_string().contains("COMMIT is not allowed inside a migration unit"));
        assert_eq!(mconn.failing_statement(), Some("COMMIT"));

        assert!(mconn.execute("/* done */ END", []).is_err());
        assert!(mconn.execute("release outer_scope", []).is_err());
        assert!(!conn.is_autocommit(), "outer savepoint must still be open");

        assert_eq!(transaction_keyword("BEGIN IMMEDIATE"), Some("BEGIN"));
        assert_eq!(transaction_keyword("ROLLBACK TO sp"), Some("ROLLBACK"));
        assert_eq!(transaction_keyword("UPDATE t SET x = 1"), None);
        assert_eq!(transaction_keyword("ENDPOINTS"), None);
    }

    #[test]
    fn test_migration_conn_reports_failing_statement() {
        let conn = Connection::open_in_memory().unwrap();
        let mut mconn = MigrationConn::new(&conn);

        mconn
            .execute_script("CREATE TABLE IF NOT EXISTS a (id INTEGER);")
            .unwrap();
        assert_eq!(mconn.failing_statement(), None);

        let err = mconn.execute_script("CREATE TABLE b (id INTEGER); SELEC nonsense;");
        assert!(err.is_err());
        assert_eq!(mconn.failing_statement(), Some("SELEC nonsense"));
        assert_eq!(mconn.statements_executed(), 2);
    }

    #[test]
    fn test_sql_migration_without_expectations_has_no_predicate() {
        let unit = SqlMigration::new("007_touch.sql", "SELECT 1;");
        assert!(!unit.declares_baseline());

        let unit = unit.with_expected_tables(&["customers"]);
        assert!(unit.declares_baseline());
    }

    #[test]
    fn test_script_file_loads_lazily() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("001_init.sql");
        std::fs::write(
            &path,
            "-- @baseline table widgets\nCREATE TABLE IF NOT EXISTS widgets (id INTEGER);\n",
        )
        .unwrap();

        let unit = ScriptFileMigration::new("001_init.sql", path);
        assert!(!unit.is_loaded());
        assert!(unit.declares_baseline());
        assert!(unit.is_loaded());

        let conn = Connection::open_in_memory().unwrap();
        let mut mconn = MigrationConn::new(&conn);
        unit.forward(&mut mconn).unwrap();
        assert!(mconn.table_exists("widgets").unwrap());
    }

    #[test]
    fn test_script_file_missing_has_no_predicate_and_fails_forward() {
        let unit = ScriptFileMigration::new("001_gone.sql", PathBuf::from("/nonexistent/001_gone.sql"));
        assert!(!unit.declares_baseline());

        let conn = Connection::open_in_memory().unwrap();
        let mut mconn = MigrationConn::new(&conn);
        let err = unit.forward(&mut mconn).unwrap_err();
        assert!(err.to_string().contains("reading migration script"));
    }
}

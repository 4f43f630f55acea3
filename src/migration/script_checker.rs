//! # 迁移脚本静态检查器
//!
//! Flags SQL that would break the double-run contract before it ever reaches
//! a user database. Only the script text is analysed; no connection needed.
//!
//! ## 检测规则
//!
//! | rule                | level   | pattern                                        |
//! |---------------------|---------|------------------------------------------------|
//! | `idempotent_create` | error   | `CREATE TABLE` without `IF NOT EXISTS`         |
//! | `idempotent_index`  | error   | `CREATE [UNIQUE] INDEX` without `IF NOT EXISTS`|
//! | `idempotent_trigger`| error   | `CREATE TRIGGER` without `IF NOT EXISTS`       |
//! | `idempotent_drop`   | error   | `DROP TABLE` / `DROP INDEX` without `IF EXISTS`|
//! | `transaction_control` | error | `BEGIN` / `COMMIT` / `END` / `ROLLBACK` / `SAVEPOINT` / `RELEASE` |
//! | `header_comment`    | warning | script does not start with a `--` comment      |
//!
//! A table rebuild (`DROP TABLE IF EXISTS x_new; CREATE TABLE x_new ...;
//! DROP TABLE x; ALTER TABLE x_new RENAME TO x`) is recognised and allowed.
//!
//! Any rule except `transaction_control` can be skipped with
//! `-- @skip-check: <rule>` (or `all`). The executor refuses those statements
//! at run time regardless.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::definitions::{split_statements, transaction_keyword};

// ============================================================================
// 预编译正则表达式
// ============================================================================

static RE_ALL_CREATES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CREATE\s+(?:TEMP\s+|TEMPORARY\s+)?TABLE\s+(\w+)").unwrap());

static RE_ALL_INDEXES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CREATE\s+(?:UNIQUE\s+)?INDEX\s+(\w+)").unwrap());

static RE_ALL_TRIGGERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CREATE\s+(?:TEMP\s+|TEMPORARY\s+)?TRIGGER\s+(\w+)").unwrap()
});

static RE_ALL_DROPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DROP\s+(TABLE|INDEX)\s+(\w+)").unwrap());

/// Checker output. `passed` is false as soon as one error is recorded.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub warnings: Vec<CheckWarning>,
    pub errors: Vec<CheckError>,
}

impl CheckResult {
    fn new() -> Self {
        Self {
            passed: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, warning: CheckWarning) {
        self.warnings.push(warning);
    }

    fn add_error(&mut self, error: CheckError) {
        self.passed = false;
        self.errors.push(error);
    }
}

/// 检查警告
#[derive(Debug, Clone)]
pub struct CheckWarning {
    pub rule: &'static str,
    pub message: String,
    pub suggestion: String,
}

/// 检查错误
#[derive(Debug, Clone)]
pub struct CheckError {
    pub rule: &'static str,
    pub message: String,
    pub suggestion: String,
}

/// 迁移脚本检查器
#[derive(Default)]
pub struct MigrationScriptChecker {
    skipped_rules: HashSet<String>,
}

impl MigrationScriptChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, script_name: &str, sql: &str) -> CheckResult {
        let mut result = CheckResult::new();

        self.parse_skip_markers(sql);
        let normalized = normalize_sql(sql);

        if !self.is_skipped("header_comment") {
            check_header_comment(script_name, sql, &mut result);
        }
        if !self.is_skipped("idempotent_create") {
            check_idempotent_create(script_name, &normalized, &mut result);
        }
        if !self.is_skipped("idempotent_index") {
            check_guarded_create(
                script_name,
                &normalized,
                &RE_ALL_INDEXES,
                "INDEX",
                "idempotent_index",
                &mut result,
            );
        }
        if !self.is_skipped("idempotent_trigger") {
            check_guarded_create(
                script_name,
                &normalized,
                &RE_ALL_TRIGGERS,
                "TRIGGER",
                "idempotent_trigger",
                &mut result,
            );
        }
        if !self.is_skipped("idempotent_drop") {
            check_idempotent_drop(script_name, &normalized, &mut result);
        }
        check_transaction_control(script_name, sql, &mut result);

        result
    }

    fn parse_skip_markers(&mut self, sql: &str) {
        self.skipped_rules.clear();
        for line in sql.lines() {
            if let Some(rule) = line.trim().strip_prefix("-- @skip-check:") {
                self.skipped_rules.insert(rule.trim().to_string());
            }
        }
    }

    fn is_skipped(&self, rule: &str) -> bool {
        self.skipped_rules.contains(rule) || self.skipped_rules.contains("all")
    }
}

/// Drops comments, collapses whitespace, uppercases.
fn normalize_sql(sql: &str) -> String {
    let mut stripped = String::with_capacity(sql.len());
    let mut in_block_comment = false;

    for line in sql.lines() {
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
            } else if c == '-' && chars.peek() == Some(&'-') {
                break;
            } else if c == '/' && chars.peek() == Some(&'*') {
                chars.next();
                in_block_comment = true;
            } else {
                stripped.push(c);
            }
        }
        stripped.push(' ');
    }

    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn check_header_comment(script_name: &str, sql: &str, result: &mut CheckResult) {
    let first = sql.lines().map(str::trim).find(|l| !l.is_empty());
    if !matches!(first, Some(line) if line.starts_with("--")) {
        result.add_warning(CheckWarning {
            rule: "header_comment",
            message: format!("[{}] 脚本缺少头部注释说明", script_name),
            suggestion: "在第一行添加: -- NNN: <本迁移的作用>".to_string(),
        });
    }
}

/// `CREATE TABLE` must be guarded, except for a rebuild target that the
/// script drops with `DROP TABLE IF EXISTS` first.
fn check_idempotent_create(script_name: &str, normalized: &str, result: &mut CheckResult) {
    for cap in RE_ALL_CREATES.captures_iter(normalized) {
        let Some(name) = cap.get(1) else { continue };
        let table = name.as_str();
        if table == "IF" {
            continue;
        }
        let pre_cleaned = normalized[..name.start()]
            .contains(&format!("DROP TABLE IF EXISTS {}", table));
        if pre_cleaned {
            continue;
        }

        let table_lower = table.to_lowercase();
        result.add_error(CheckError {
            rule: "idempotent_create",
            message: format!(
                "[{}] CREATE TABLE {} 未使用 IF NOT EXISTS，重复执行会失败",
                script_name, table_lower
            ),
            suggestion: format!("改为: CREATE TABLE IF NOT EXISTS {} (...)", table_lower),
        });
    }
}

fn check_guarded_create(
    script_name: &str,
    normalized: &str,
    pattern: &Regex,
    object: &str,
    rule: &'static str,
    result: &mut CheckResult,
) {
    // A guarded create matches with "IF" as the object name.
    for cap in pattern.captures_iter(normalized) {
        let Some(name) = cap.get(1) else { continue };
        if name.as_str() == "IF" {
            continue;
        }
        let name_lower = name.as_str().to_lowercase();
        result.add_error(CheckError {
            rule,
            message: format!(
                "[{}] CREATE {} {} 未使用 IF NOT EXISTS",
                script_name, object, name_lower
            ),
            suggestion: format!("改为: CREATE {} IF NOT EXISTS {} ...", object, name_lower),
        });
    }
}

/// `DROP` must be guarded, except for the original table of a rebuild that
/// renames a replacement back into place.
fn check_idempotent_drop(script_name: &str, normalized: &str, result: &mut CheckResult) {
    for cap in RE_ALL_DROPS.captures_iter(normalized) {
        let (Some(kind), Some(name)) = (cap.get(1), cap.get(2)) else {
            continue;
        };
        let name = name.as_str();
        if name == "IF" {
            continue;
        }
        if kind.as_str() == "TABLE" && normalized.contains(&format!("RENAME TO {}", name)) {
            continue;
        }

        let name_lower = name.to_lowercase();
        result.add_error(CheckError {
            rule: "idempotent_drop",
            message: format!(
                "[{}] DROP {} {} 未使用 IF EXISTS",
                script_name,
                kind.as_str(),
                name_lower
            ),
            suggestion: format!("改为: DROP {} IF EXISTS {}", kind.as_str(), name_lower),
        });
    }
}

/// Units run inside the run's savepoints; ending them would commit earlier
/// units of a run that is about to abort.
fn check_transaction_control(script_name: &str, sql: &str, result: &mut CheckResult) {
    for statement in split_statements(sql) {
        let Some(keyword) = transaction_keyword(&statement) else {
            continue;
        };
        result.add_error(CheckError {
            rule: "transaction_control",
            message: format!(
                "[{}] 脚本包含事务控制语句 {}，迁移单元不能自行结束事务",
                script_name, keyword
            ),
            suggestion: format!("删除 {} 语句；每个迁移单元已由执行器包在保存点中", keyword),
        });
    }
}

// ============================================================================
// 便捷函数
// ============================================================================

/// 检查单个迁移脚本
pub fn check_migration_script(script_name: &str, sql: &str) -> CheckResult {
    MigrationScriptChecker::new().check(script_name, sql)
}

/// Renders a failed check for test assertions and the `check` command.
pub fn format_check_report(script_name: &str, result: &CheckResult) -> String {
    let mut msg = format!("迁移脚本 {} 检查结果:\n", script_name);
    for error in &result.errors {
        msg.push_str(&format!("  ✗ [{}] {}\n", error.rule, error.message));
        msg.push_str(&format!("    建议: {}\n", error.suggestion));
    }
    for warning in &result.warnings {
        msg.push_str(&format!("  ! [{}] {}\n", warning.rule, warning.message));
        msg.push_str(&format!("    建议: {}\n", warning.suggestion));
    }
    if !result.passed {
        msg.push_str("如果确认无问题，可在脚本中添加: -- @skip-check: <rule_name>\n");
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unguarded_create_is_error() {
        let sql = "-- 001: customers\nCREATE TABLE customers (id INTEGER PRIMARY KEY);";
        let result = check_migration_script("001_initial.sql", sql);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.rule == "idempotent_create"));
    }

    #[test]
    fn test_guarded_script_passes() {
        let sql = r#"
            -- 004: events
            CREATE TABLE IF NOT EXISTS events (id INTEGER PRIMARY KEY, title TEXT);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_title ON events(title);
            CREATE TRIGGER IF NOT EXISTS trg_events_touch AFTER UPDATE ON events
            BEGIN
                UPDATE events SET title = NEW.title WHERE id = NEW.id;
            END;
            DROP INDEX IF EXISTS idx_events_old;
        "#;
        let result = check_migration_script("004_create_events_table.sql", sql);
        assert!(result.passed, "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_unguarded_index_trigger_and_drop() {
        let sql = r#"
            -- 009: misc
            CREATE INDEX idx_a ON a(x);
            CREATE TRIGGER trg_a AFTER INSERT ON a BEGIN SELECT 1; END;
            DROP TABLE legacy;
            DROP INDEX idx_old;
        "#;
        let result = check_migration_script("009_misc.sql", sql);
        let rules: Vec<&str> = result.errors.iter().map(|e| e.rule).collect();
        assert!(rules.contains(&"idempotent_index"));
        assert!(rules.contains(&"idempotent_trigger"));
        assert_eq!(rules.iter().filter(|r| **r == "idempotent_drop").count(), 2);
    }

    #[test]
    fn test_table_rebuild_is_allowed() {
        let sql = r#"
            -- 006: rebuild hours
            DROP TABLE IF EXISTS hours_new;
            CREATE TABLE hours_new (id INTEGER PRIMARY KEY, start_date DATE);
            INSERT INTO hours_new (id, start_date) SELECT id, work_date FROM hours;
            DROP TABLE hours;
            ALTER TABLE hours_new RENAME TO hours;
        "#;
        let result = check_migration_script("006_rebuild_hours.sql", sql);
        assert!(result.passed, "{:?}", result.errors);
    }

    #[test]
    fn test_keywords_in_comments_are_ignored() {
        let sql = "-- CREATE TABLE foo (id INTEGER);\n/* DROP TABLE bar; */\nSELECT 1;";
        let result = check_migration_script("007_noop.sql", sql);
        assert!(result.passed);
    }

    #[test]
    fn test_skip_markers() {
        let sql = "-- @skip-check: idempotent_create\nCREATE TABLE foo (id INTEGER);";
        let result = check_migration_script("008_foo.sql", sql);
        assert!(result.passed);

        let sql = "-- @skip-check: all\nCREATE TABLE foo (id INTEGER);\nDROP TABLE bar;";
        let result = check_migration_script("008_foo.sql", sql);
        assert!(result.passed);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_transaction_control_is_error_and_not_skippable() {
        let sql = "-- @skip-check: all\nCREATE TABLE IF NOT EXISTS b (id INTEGER);\nCOMMIT;\nbegin transaction;";
        let result = check_migration_script("002_b.sql", sql);
        assert!(!result.passed);
        let rules: Vec<&str> = result.errors.iter().map(|e| e.rule).collect();
        assert_eq!(rules, vec!["transaction_control", "transaction_control"]);
        assert!(result.errors[0].message.contains("COMMIT"));
        assert!(result.errors[1].message.contains("BEGIN"));
    }

    #[test]
    fn test_trigger_end_is_not_transaction_control() {
        let sql = r#"
            -- 011: flags
            CREATE TRIGGER IF NOT EXISTS trg_t_flag AFTER INSERT ON t
            BEGIN
                UPDATE t SET flag = CASE WHEN NEW.a > 0 THEN 1 ELSE 0 END WHERE id = NEW.id;
            END;
        "#;
        let result = check_migration_script("011_flags.sql", sql);
        assert!(result.passed, "{}", format_check_report("011_flags.sql", &result));
    }

    #[test]
    fn test_missing_header_is_warning() {
        let result = check_migration_script("010_x.sql", "CREATE TABLE IF NOT EXISTS x (id INTEGER);");
        assert!(result.passed);
        assert!(result.warnings.iter().any(|w| w.rule == "header_comment"));
        assert!(format_check_report("010_x.sql", &result).contains("header_comment"));
    }
}

//! # Job Manager 迁移集合
//!
//! The application's shipped schema history, embedded at compile time.
//!
//! | key | kind | objects |
//! |-----|------|---------|
//! | `001_initial.sql` | SQL | customers, documents, items, hours, ... |
//! | `002_create_auth_tables.sql` | SQL | users, roles, permissions, audit_logs |
//! | `003_update_hours_table` | code | hours.work_date → start_date / end_date |
//! | `004_create_events_table.sql` | SQL | events |
//! | `005_create_org_calendar_tables.sql` | SQL | org, acct_trans, calendar_entry_* |

use anyhow::Context;

use super::baseline::{Baseline, SchemaExpectation, SchemaSnapshot};
use super::definitions::{FnMigration, MigrationConn, SqlMigration};
use super::registry::MigrationRegistry;
use super::RegistryError;

// ============================================================================
// 迁移定义
// ============================================================================

pub const V001_INITIAL: SqlMigration = SqlMigration::new(
    "001_initial.sql",
    include_str!("../../migrations/job_manager/001_initial.sql"),
)
.with_expected_tables(&[
    "customers",
    "addresses",
    "documents",
    "document_addresses",
    "requests",
    "quotes",
    "jobs",
    "invoices",
    "items",
    "steps",
    "settings",
    "crews",
    "hours",
]);

pub const V002_AUTH: SqlMigration = SqlMigration::new(
    "002_create_auth_tables.sql",
    include_str!("../../migrations/job_manager/002_create_auth_tables.sql"),
)
.with_expected_tables(&[
    "users",
    "roles",
    "permissions",
    "user_roles",
    "role_permissions",
    "audit_logs",
]);

pub const V003_HOURS: FnMigration =
    FnMigration::new("003_update_hours_table", update_hours_table).with_baseline(hours_updated);

pub const V004_EVENTS: SqlMigration = SqlMigration::new(
    "004_create_events_table.sql",
    include_str!("../../migrations/job_manager/004_create_events_table.sql"),
)
.with_expected_tables(&["events"]);

pub const V005_ORG_CALENDAR: SqlMigration = SqlMigration::new(
    "005_create_org_calendar_tables.sql",
    include_str!("../../migrations/job_manager/005_create_org_calendar_tables.sql"),
)
.with_expected_tables(&[
    "org",
    "org_address",
    "acct_trans",
    "calendar_entry_status",
    "calendar_entry_order",
])
.with_expected_columns(&[
    ("org", "org_id"),
    ("org_address", "orgid"),
    ("acct_trans", "transid"),
    ("calendar_entry_status", "status_id"),
    ("calendar_entry_order", "order_id"),
    ("calendar_entry_order", "status_id"),
]);

/// Keys written by older releases (script filenames and module names),
/// mapped to their canonical keys.
pub const LEGACY_KEY_ALIASES: &[(&str, &str)] = &[
    ("001_initial.py", "001_initial.sql"),
    ("initial_001", "001_initial.sql"),
    ("002_create_auth_tables.py", "002_create_auth_tables.sql"),
    ("create_auth_tables_002", "002_create_auth_tables.sql"),
    ("003_update_hours_table.py", "003_update_hours_table"),
    ("update_hours_table_003", "003_update_hours_table"),
    ("004_create_events_table.py", "004_create_events_table.sql"),
    ("create_events_table_004", "004_create_events_table.sql"),
];

/// Built-in registry.
pub fn registry() -> Result<MigrationRegistry, RegistryError> {
    MigrationRegistry::builder()
        .register(V001_INITIAL)
        .register(V002_AUTH)
        .register(V003_HOURS)
        .register(V004_EVENTS)
        .register(V005_ORG_CALENDAR)
        .aliases(LEGACY_KEY_ALIASES)
        .build()
}

// ============================================================================
// 003: hours.work_date → start_date / end_date
// ============================================================================

fn hours_expectation() -> SchemaExpectation {
    SchemaExpectation::from_static(
        &["hours"],
        &[("hours", "start_date"), ("hours", "end_date")],
        &[],
        &[("hours", "work_date")],
    )
}

fn hours_updated(snapshot: &SchemaSnapshot) -> Baseline {
    hours_expectation().evaluate(snapshot)
}

/// SQLite has no `ADD COLUMN IF NOT EXISTS`; every step is guarded by
/// column introspection instead.
pub fn update_hours_table(conn: &mut MigrationConn<'_>) -> anyhow::Result<()> {
    if !conn.table_exists("hours")? {
        anyhow::bail!("table 'hours' does not exist");
    }

    for column in ["start_date", "end_date"] {
        if !conn.column_exists("hours", column)? {
            conn.execute(&format!("ALTER TABLE hours ADD COLUMN {} DATE", column), [])
                .with_context(|| format!("adding hours.{}", column))?;
        }
    }

    if conn.column_exists("hours", "work_date")? {
        let copied = conn
            .execute(
                "UPDATE hours SET start_date = work_date, end_date = work_date
                 WHERE work_date IS NOT NULL AND start_date IS NULL AND end_date IS NULL",
                [],
            )
            .context("copying hours.work_date")?;
        conn.execute("ALTER TABLE hours DROP COLUMN work_date", [])
            .context("dropping hours.work_date")?;
        tracing::debug!(rows = copied, "[Migration] hours.work_date 已迁移到 start_date/end_date");
    }
    Ok(())
}

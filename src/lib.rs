// Job Manager schema migrator library entry
// 启动时调用 bootstrap::MigrationBootstrap，在任何数据访问对象构建之前完成迁移。

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod migration;


pub use bootstrap::{apply_pending_migrations, failure_notice, MigrationBootstrap, MigrationSource};
pub use config::EngineConfig;
pub use migration::{MigrationError, MigrationRegistry, MigrationRunner, RunReport, RunStatus};

/// Opens the application database the way the application does.
pub fn open_database(path: &std::path::Path) -> anyhow::Result<rusqlite::Connection> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("enabling foreign keys")?;
    Ok(conn)
}

/// Opens an existing database without write access. Used by read-only
/// commands; a missing file is an error rather than a new empty database.
pub fn open_database_read_only(path: &std::path::Path) -> anyhow::Result<rusqlite::Connection> {
    use anyhow::Context;
    use rusqlite::OpenFlags;

    if !path.is_file() {
        anyhow::bail!("database {} does not exist", path.display());
    }
    rusqlite::Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("opening database {} read-only", path.display()))
}

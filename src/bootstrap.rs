//! # Migration Bootstrap (启动迁移入口)
//!
//! The single entry point application startup calls before constructing any
//! data-access object. A failed run must stop startup; [`failure_notice`]
//! produces the message to show instead of the UI.
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let mut bootstrap = MigrationBootstrap::new(MigrationSource::Builtin, handle.log_path());
//! let report = bootstrap.apply_pending_migrations(&conn);
//! if let Some(notice) = bootstrap.failure_notice(&report) {
//!     return Err(anyhow::anyhow!(notice));
//! }
//! ```

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::migration::{job_manager, MigrationError, MigrationRegistry, MigrationRunner, RunReport};

/// Where the registry comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    /// The embedded job-manager set.
    Builtin,
    /// `NNN_description.sql` files in a directory.
    Directory(PathBuf),
}

impl MigrationSource {
    pub fn from_dir(dir: Option<PathBuf>) -> Self {
        dir.map_or(MigrationSource::Builtin, MigrationSource::Directory)
    }

    pub fn load(&self) -> Result<MigrationRegistry, MigrationError> {
        let registry = match self {
            MigrationSource::Builtin => job_manager::registry()?,
            MigrationSource::Directory(dir) => {
                MigrationRegistry::scan_dir(dir, job_manager::LEGACY_KEY_ALIASES)?
            }
        };
        Ok(registry)
    }
}

/// Process-scoped bootstrap context.
///
/// Holds the guard that keeps migrations from running twice in one process;
/// a repeated call returns the first run's report.
pub struct MigrationBootstrap {
    source: MigrationSource,
    log_path: PathBuf,
    migrations_attempted: bool,
    last_report: Option<RunReport>,
}

impl MigrationBootstrap {
    pub fn new(source: MigrationSource, log_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            log_path: log_path.into(),
            migrations_attempted: false,
            last_report: None,
        }
    }

    pub fn migrations_attempted(&self) -> bool {
        self.migrations_attempted
    }

    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Loads the registry and runs it once for this process.
    pub fn apply_pending_migrations(&mut self, conn: &Connection) -> RunReport {
        if let Some(report) = self.reentrant_report() {
            return report;
        }
        self.migrations_attempted = true;

        let report = match self.source.load() {
            Ok(registry) => MigrationRunner::new(&registry).run(conn),
            Err(err) => {
                tracing::error!(
                    error = %err,
                    causes = ?crate::migration::error_chain(&err),
                    "❌ [Bootstrap] 迁移注册表无效，未访问数据库"
                );
                RunReport::from_error(&err)
            }
        };
        self.finish(report)
    }

    /// Runs an already built registry once for this process.
    pub fn apply_registry(&mut self, conn: &Connection, registry: &MigrationRegistry) -> RunReport {
        if let Some(report) = self.reentrant_report() {
            return report;
        }
        self.migrations_attempted = true;
        let report = MigrationRunner::new(registry).run(conn);
        self.finish(report)
    }

    /// Notice to show instead of the UI, or `None` when startup may continue.
    pub fn failure_notice(&self, report: &RunReport) -> Option<String> {
        failure_notice(report, &self.log_path)
    }

    fn reentrant_report(&self) -> Option<RunReport> {
        if !self.migrations_attempted {
            return None;
        }
        tracing::info!("[Bootstrap] 本进程已执行过迁移，跳过");
        self.last_report.clone()
    }

    fn finish(&mut self, report: RunReport) -> RunReport {
        tracing::info!(
            run_id = %report.run_id,
            summary = %report.summary(),
            "[Bootstrap] 迁移检查结束"
        );
        self.last_report = Some(report.clone());
        report
    }
}

/// Runs `registry` against `conn` without a process guard.
pub fn apply_pending_migrations(conn: &Connection, registry: &MigrationRegistry) -> RunReport {
    MigrationRunner::new(registry).run(conn)
}

/// User-facing failure text for an aborted run.
pub fn failure_notice(report: &RunReport, log_path: &Path) -> Option<String> {
    if report.is_committed() {
        return None;
    }
    let reason = report
        .error
        .as_ref()
        .map(|f| f.message.as_str())
        .unwrap_or("unknown error");
    let outcome = if report.partially_applied {
        format!(
            "The database upgrade stopped part-way; {} migration(s) of this run remained applied.",
            report.applied_keys.len() + report.backfilled_keys.len()
        )
    } else {
        "The database could not be upgraded and was left unchanged.".to_string()
    };
    Some(format!(
        "{}\n\
         Reason: {}\n\
         Details were written to {}",
        outcome,
        reason,
        log_path.display()
    ))
}

//! Tracing setup: plain-text file log plus stderr.
//!
//! The file is what the failure notice points users at, so it always gets
//! the full causal chain of a failed run.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "migrations.log";

/// Where this process logs.
#[derive(Debug, Clone)]
pub struct LogHandle {
    log_path: PathBuf,
    /// False when a global subscriber was already installed.
    installed: bool,
}

impl LogHandle {
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Installs the global subscriber. A second call keeps the existing one.
///
/// `default_level` applies unless `RUST_LOG` is set.
pub fn init_logging(log_dir: &Path, default_level: &str) -> anyhow::Result<LogHandle> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer(Mutex::new(file)))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(path = %log_path.display(), "[Logging] 日志系统已初始化");
    }
    Ok(LogHandle {
        log_path,
        installed,
    })
}

/// Plain-text layer for the log file the failure notice points at.
pub(crate) fn file_layer<S, W>(writer: W) -> fmt::Layer<S, DefaultFields, Format, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use rusqlite::Connection;

    use crate::migration::{MigrationRegistry, MigrationRunner, RunStatus, SqlMigration};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_file_log_has_one_entry_per_unit_outcome() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::registry().with(file_layer(move || writer.clone()));

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY);")
            .unwrap();
        let registry = MigrationRegistry::builder()
            .register(
                SqlMigration::new(
                    "001_customers.sql",
                    "CREATE TABLE IF NOT EXISTS customers (id INTEGER PRIMARY KEY);",
                )
                .with_expected_tables(&["customers"]),
            )
            .register(SqlMigration::new(
                "002_crews.sql",
                "CREATE TABLE IF NOT EXISTS crews (id INTEGER PRIMARY KEY);",
            ))
            .register(SqlMigration::new(
                "003_settings.sql",
                "INSERT INTO settings_typo (id) VALUES (1);",
            ))
            .build()
            .unwrap();

        let report = tracing::subscriber::with_default(subscriber, || {
            MigrationRunner::new(&registry).run(&conn)
        });
        assert_eq!(report.status, RunStatus::Aborted);

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let line_with = |needle: &str| {
            output
                .lines()
                .find(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("no log line with {}:\n{}", needle, output))
                .to_string()
        };

        assert!(line_with(r#"outcome="backfilled""#).contains(r#"key="001_customers.sql""#));
        assert!(line_with(r#"outcome="applied""#).contains(r#"key="002_crews.sql""#));
        let failed = line_with(r#"outcome="failed""#);
        assert!(failed.contains(r#"key="003_settings.sql""#));
        assert!(failed.contains(r#"statement="INSERT INTO settings_typo (id) VALUES (1)""#));
        assert!(failed.contains("no such table: settings_typo"));
        assert!(failed.contains(&report.run_id.to_string()));
        assert!(!output.contains('\u{1b}'), "file log must not contain ANSI escapes");
    }

    #[test]
    fn test_init_creates_log_file_and_is_reentrant() {
        let dir = tempfile::TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");

        let first = init_logging(&log_dir, "debug").unwrap();
        assert!(first.log_path().ends_with("logs/migrations.log"));
        assert!(first.log_path().exists());

        let second = init_logging(&log_dir, "debug").unwrap();
        assert!(!second.installed());
        assert_eq!(first.log_path(), second.log_path());
    }
}

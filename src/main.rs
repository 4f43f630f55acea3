//! schema-migrator - bring a job-manager database up to the current schema

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use schema_migrator::migration::script_checker::format_check_report;
use schema_migrator::migration::{LedgerRecord, SchemaLedger};
use schema_migrator::{
    logging, open_database, open_database_read_only, EngineConfig, MigrationBootstrap,
    MigrationSource,
};

/// Job Manager schema migrator
#[derive(Parser, Debug)]
#[command(name = "schema-migrator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database file (overrides configuration)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Directory of NNN_description.sql scripts (overrides configuration)
    #[arg(short, long, global = true)]
    migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Apply pending migrations (default)
    Apply,
    /// Show registered migrations and the ledger
    Status,
    /// Lint migration scripts for non-idempotent SQL
    Check,
}

#[derive(Serialize)]
struct StatusEntry<'a> {
    ordinal: u32,
    key: &'a str,
    applied: bool,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    database: String,
    migrations: Vec<StatusEntry<'a>>,
    ledger: Vec<LedgerRecord>,
    orphans: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut cfg = EngineConfig::load()?;
    if let Some(database) = cli.database {
        cfg.database_path = database;
    }
    if cli.migrations_dir.is_some() {
        cfg.migrations_dir = cli.migrations_dir;
    }
    let log = logging::init_logging(&cfg.log_dir, &cfg.log_level)?;
    let source = MigrationSource::from_dir(cfg.migrations_dir.clone());

    match cli.command.unwrap_or(Command::Apply) {
        Command::Apply => apply(&cfg, source, log.log_path().to_path_buf()),
        Command::Status => status(&cfg, &source),
        Command::Check => check(&source),
    }
}

fn apply(cfg: &EngineConfig, source: MigrationSource, log_path: PathBuf) -> Result<ExitCode> {
    let conn = open_database(&cfg.database_path)?;
    let mut bootstrap = MigrationBootstrap::new(source, log_path);
    let report = bootstrap.apply_pending_migrations(&conn);

    println!("{}", serde_json::to_string_pretty(&report)?);
    match bootstrap.failure_notice(&report) {
        Some(notice) => {
            eprintln!("{}", notice);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

fn status(cfg: &EngineConfig, source: &MigrationSource) -> Result<ExitCode> {
    let registry = source.load()?;
    let conn = open_database_read_only(&cfg.database_path)?;

    let ledger = if SchemaLedger::exists(&conn)? {
        SchemaLedger::load_records(&conn).context("reading ledger")?
    } else {
        Vec::new()
    };

    let applied: Vec<&str> = ledger
        .iter()
        .filter_map(|r| registry.resolve_key(&r.key))
        .collect();
    let orphans = ledger
        .iter()
        .filter(|r| registry.resolve_key(&r.key).is_none())
        .map(|r| r.key.clone())
        .collect();
    let migrations = registry
        .load_ordered()
        .iter()
        .map(|m| StatusEntry {
            ordinal: m.ordinal(),
            key: m.key(),
            applied: applied.contains(&m.key()),
        })
        .collect();

    let report = StatusReport {
        database: cfg.database_path.display().to_string(),
        migrations,
        ledger,
        orphans,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn check(source: &MigrationSource) -> Result<ExitCode> {
    let registry = source.load()?;
    let mut failed = false;
    for (key, result) in registry.lint()? {
        if !result.passed {
            failed = true;
        }
        if !result.passed || !result.warnings.is_empty() {
            print!("{}", format_check_report(&key, &result));
        }
    }
    if failed {
        Ok(ExitCode::FAILURE)
    } else {
        println!("All {} migrations passed.", registry.len());
        Ok(ExitCode::SUCCESS)
    }
}

//! # Migration Runner (迁移运行器)
//!
//! Orchestrates one run: registry → ledger → baseline detector → executor,
//! all-or-nothing.
//!
//! ## 状态机
//!
//! ```text
//! Idle → Scanning → Pending(n) → Applying(i) → Committed
//!            │           │             └──────→ Aborted
//!            └───────────┴→ Committed (no-op) / Aborted
//! ```
//!
//! Every unit of the run executes inside one outer savepoint. A failure at
//! unit k rolls back the outer savepoint, undoing units 1..k-1 of this run
//! (executed or backfilled). Units committed by earlier runs are never touched.

use std::fmt;
use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use super::baseline::BaselineDetector;
use super::executor::{Outcome, Savepoint, TransactionalExecutor};
use super::ledger::SchemaLedger;
use super::registry::{MigrationRegistry, RegisteredMigration};
use super::{error_chain, LedgerError, MigrationError};

const RUN_SAVEPOINT: &str = "migration_run";

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scanning,
    /// Number of pending units.
    Pending(usize),
    /// 1-based position of the unit being processed.
    Applying(usize),
    Committed,
    Aborted,
}

impl RunState {
    fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Scanning) => true,
            (Scanning, Pending(_) | Committed | Aborted) => true,
            (Pending(n), Applying(1)) => n > 0,
            (Applying(i), Applying(j)) => j == i + 1,
            (Applying(_), Committed | Aborted) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Scanning => write!(f, "scanning"),
            RunState::Pending(n) => write!(f, "pending({})", n),
            RunState::Applying(i) => write!(f, "applying({})", i),
            RunState::Committed => write!(f, "committed"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Registry,
    Ledger,
    DuplicateLedgerKey,
    Execution,
}

/// Serializable view of the error that aborted a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub key: Option<String>,
    pub statement: Option<String>,
    pub message: String,
    /// Full causal chain, outermost first.
    pub causes: Vec<String>,
}

impl From<&MigrationError> for RunFailure {
    fn from(err: &MigrationError) -> Self {
        let kind = match err {
            MigrationError::Registry(_) => FailureKind::Registry,
            MigrationError::Ledger(_) => FailureKind::Ledger,
            MigrationError::DuplicateLedgerKey { .. } => FailureKind::DuplicateLedgerKey,
            MigrationError::Execution(_) => FailureKind::Execution,
        };
        let statement = match err {
            MigrationError::Execution(e) => e.statement.clone(),
            _ => None,
        };
        Self {
            kind,
            key: err.key().map(str::to_string),
            statement,
            message: err.to_string(),
            causes: error_chain(err),
        }
    }
}

/// Result of one run. Binary: committed or aborted.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub applied_keys: Vec<String>,
    pub backfilled_keys: Vec<String>,
    /// Keys processed by this run and then undone by the abort.
    pub rolled_back_keys: Vec<String>,
    /// The run's transaction was ended before the abort could undo it;
    /// `applied_keys` / `backfilled_keys` then list what stayed committed.
    pub partially_applied: bool,
    pub error: Option<RunFailure>,
    pub duration_ms: u64,
}

impl RunReport {
    /// Aborted report for a failure raised before the run could start,
    /// such as a malformed registry.
    pub fn from_error(err: &MigrationError) -> Self {
        Self::aborted(Uuid::new_v4(), err, Vec::new(), 0)
    }

    fn aborted(run_id: Uuid, err: &MigrationError, rolled_back_keys: Vec<String>, duration_ms: u64) -> Self {
        Self {
            run_id,
            status: RunStatus::Aborted,
            applied_keys: Vec::new(),
            backfilled_keys: Vec::new(),
            rolled_back_keys,
            partially_applied: false,
            error: Some(RunFailure::from(err)),
            duration_ms,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == RunStatus::Committed
    }

    /// One-line description for logs and the CLI.
    pub fn summary(&self) -> String {
        match (&self.status, &self.error) {
            (RunStatus::Aborted, Some(failure)) => format!("aborted: {}", failure.message),
            (RunStatus::Aborted, None) => "aborted".to_string(),
            (RunStatus::Committed, _)
                if self.applied_keys.is_empty() && self.backfilled_keys.is_empty() =>
            {
                "up to date".to_string()
            }
            (RunStatus::Committed, _) => format!(
                "committed: {} applied, {} backfilled",
                self.applied_keys.len(),
                self.backfilled_keys.len()
            ),
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// 迁移运行器
pub struct MigrationRunner<'r> {
    registry: &'r MigrationRegistry,
    state: RunState,
    run_id: Uuid,
}

impl<'r> MigrationRunner<'r> {
    pub fn new(registry: &'r MigrationRegistry) -> Self {
        Self {
            registry,
            state: RunState::Idle,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Brings the database up to date. Never panics on database errors; all
    /// failures end in an aborted report.
    pub fn run(&mut self, conn: &Connection) -> RunReport {
        if self.state != RunState::Idle {
            self.run_id = Uuid::new_v4();
            self.state = RunState::Idle;
        }
        let span = tracing::info_span!("migration_run", run_id = %self.run_id);
        let _enter = span.enter();
        let started = Instant::now();

        tracing::info!(
            registered = self.registry.len(),
            "🚀 [MigrationRunner] 开始迁移检查"
        );
        self.transition(RunState::Scanning);

        let pending = match self.scan(conn) {
            Ok(pending) => pending,
            Err(err) => return self.abort(&err, None, Vec::new(), started),
        };

        if pending.is_empty() {
            self.transition(RunState::Committed);
            let report = self.committed(Vec::new(), Vec::new(), started);
            tracing::info!("✅ [MigrationRunner] 数据库已是最新，无需迁移");
            return report;
        }

        tracing::info!(
            pending = pending.len(),
            keys = ?pending.iter().map(|m| m.key()).collect::<Vec<_>>(),
            "📋 [MigrationRunner] 待处理迁移"
        );
        self.transition(RunState::Pending(pending.len()));

        let outer = match Savepoint::open(conn, RUN_SAVEPOINT) {
            Ok(sp) => sp,
            Err(e) => {
                let err = MigrationError::from(LedgerError::new("open run savepoint", e));
                return self.abort(&err, None, Vec::new(), started);
            }
        };

        let mut applied = Vec::new();
        let mut backfilled = Vec::new();

        for (i, migration) in pending.iter().copied().enumerate() {
            self.transition(RunState::Applying(i + 1));

            match Self::process(conn, migration) {
                Ok(Outcome::Applied) => applied.push(migration.key().to_string()),
                Ok(Outcome::Backfilled) => backfilled.push(migration.key().to_string()),
                Err(err) => {
                    if conn.is_autocommit() {
                        outer.abandon();
                        return self.abort_partial(&err, migration, applied, backfilled, started);
                    }
                    if let Err(rb) = outer.rollback() {
                        tracing::error!(error = %rb, "[MigrationRunner] 外层保存点回滚失败");
                    }
                    let rolled_back = applied.into_iter().chain(backfilled).collect();
                    return self.abort(&err, Some(migration), rolled_back, started);
                }
            }
        }

        if let Err(e) = outer.release() {
            let err = MigrationError::from(LedgerError::new("commit run", e));
            let rolled_back = applied.into_iter().chain(backfilled).collect();
            return self.abort(&err, None, rolled_back, started);
        }

        self.transition(RunState::Committed);
        let report = self.committed(applied, backfilled, started);
        tracing::info!(
            applied = report.applied_keys.len(),
            backfilled = report.backfilled_keys.len(),
            duration_ms = report.duration_ms,
            "🏁 [MigrationRunner] 迁移完成"
        );
        report
    }

    /// Pending units in ordinal order.
    fn scan(&self, conn: &Connection) -> Result<Vec<&'r RegisteredMigration>, MigrationError> {
        SchemaLedger::ensure_exists(conn)?;
        let applied = SchemaLedger::load_applied(conn, self.registry)?;
        tracing::debug!(applied = applied.len(), "[MigrationRunner] 已读取账本");

        Ok(self
            .registry
            .load_ordered()
            .iter()
            .filter(|m| !applied.contains(m.key()))
            .collect())
    }

    fn process(conn: &Connection, migration: &RegisteredMigration) -> Result<Outcome, MigrationError> {
        if BaselineDetector::is_baselined(conn, migration)? {
            TransactionalExecutor::backfill(conn, migration)
        } else {
            TransactionalExecutor::apply(conn, migration)
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run state transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(from = %self.state, to = %next, "[MigrationRunner] 状态变更");
        self.state = next;
    }

    fn committed(&self, applied: Vec<String>, backfilled: Vec<String>, started: Instant) -> RunReport {
        RunReport {
            run_id: self.run_id,
            status: RunStatus::Committed,
            applied_keys: applied,
            backfilled_keys: backfilled,
            rolled_back_keys: Vec::new(),
            partially_applied: false,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn abort(
        &mut self,
        err: &MigrationError,
        failed: Option<&RegisteredMigration>,
        rolled_back: Vec<String>,
        started: Instant,
    ) -> RunReport {
        self.transition(RunState::Aborted);
        let report = RunReport::aborted(
            self.run_id,
            err,
            rolled_back,
            started.elapsed().as_millis() as u64,
        );

        let statement = report.error.as_ref().and_then(|f| f.statement.as_deref());
        let causes = error_chain(err);
        tracing::error!(
            key = failed.map(|m| m.key()),
            ordinal = failed.map(|m| m.ordinal()),
            outcome = "failed",
            statement = statement,
            error = %err,
            causes = ?causes,
            rolled_back = ?report.rolled_back_keys,
            "❌ [MigrationRunner] 迁移失败，本次运行已全部回滚"
        );
        report
    }

    /// Abort after the run's transaction was closed underneath it: nothing
    /// can be rolled back, so the report lists what stayed committed.
    fn abort_partial(
        &mut self,
        err: &MigrationError,
        failed: &RegisteredMigration,
        applied: Vec<String>,
        backfilled: Vec<String>,
        started: Instant,
    ) -> RunReport {
        self.transition(RunState::Aborted);
        let mut report = RunReport::aborted(
            self.run_id,
            err,
            Vec::new(),
            started.elapsed().as_millis() as u64,
        );
        report.partially_applied = true;
        report.applied_keys = applied;
        report.backfilled_keys = backfilled;

        tracing::error!(
            key = failed.key(),
            ordinal = failed.ordinal(),
            outcome = "failed",
            error = %err,
            causes = ?error_chain(err),
            committed = ?report.applied_keys,
            backfilled = ?report.backfilled_keys,
            "❌ [MigrationRunner] 迁移失败，且运行事务已被提前结束，部分变更已提交"
        );
        report
    }
}

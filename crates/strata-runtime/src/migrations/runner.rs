//! Migration runner with advisory locking.
//!
//! Only one runner may work against a database at a time. The lock is taken
//! without blocking; contention is reported as `RunnerBusy` and is the one
//! error a caller should retry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::config::MigrationsConfig;
use strata_core::error::{Result, StrataError};
use strata_core::schema::{MigrationScript, OperationSet};

use super::executor::OperationExecutor;
use super::history::{HistoryRecord, HistoryStore, DEFAULT_HISTORY_TABLE};
use super::registry::MigrationRegistry;
use crate::driver::Connection;

/// Default advisory lock name.
pub const DEFAULT_LOCK_NAME: &str = "strata_migrations";

/// How far to migrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The newest registered migration.
    Latest,
    /// Before the first migration.
    Zero,
    /// A specific migration id, inclusive.
    Id(String),
}

impl Target {
    pub fn id(id: impl Into<String>) -> Self {
        Target::Id(id.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Runner lifecycle for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Planning,
    Executing,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub history_table: String,
    pub lock_name: String,
    /// Collect statements instead of executing them.
    pub dry_run: bool,
    /// Checked before each script starts.
    pub cancel: Option<CancellationToken>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            dry_run: false,
            cancel: None,
        }
    }
}

impl RunnerOptions {
    pub fn from_config(config: &MigrationsConfig) -> Self {
        Self {
            history_table: config.history_table.clone(),
            lock_name: config.lock_name.clone(),
            ..Default::default()
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Statements one script would run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMigration {
    pub id: String,
    pub statements: Vec<String>,
}

/// Outcome of an `up_to`, `down_to` or `revert` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub direction: Direction,
    /// Ids applied or reverted, in execution order.
    pub executed: Vec<String>,
    /// Filled only in dry-run mode.
    pub dry_run_statements: Vec<PlannedMigration>,
}

impl MigrationReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            executed: Vec::new(),
            dry_run_statements: Vec::new(),
        }
    }

    /// Whether the call had nothing to do.
    pub fn is_empty(&self) -> bool {
        self.executed.is_empty() && self.dry_run_statements.is_empty()
    }
}

/// One row of `status()`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatus {
    pub id: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Applies and reverts registered migrations against one connection.
pub struct MigrationRunner<'r, C: Connection> {
    conn: C,
    registry: &'r MigrationRegistry,
    history: HistoryStore,
    executor: OperationExecutor,
    options: RunnerOptions,
    state: RunnerState,
}

impl<'r, C: Connection> MigrationRunner<'r, C> {
    pub fn new(conn: C, registry: &'r MigrationRegistry, options: RunnerOptions) -> Self {
        Self {
            conn,
            registry,
            history: HistoryStore::new(options.history_table.clone()),
            executor: OperationExecutor::new(),
            options,
            state: RunnerState::Idle,
        }
    }

    /// Outcome of the most recent script, or `Idle` if none ran.
    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_connection(self) -> C {
        self.conn
    }

    /// Apply every unapplied migration up to and including `target`.
    pub async fn up_to(&mut self, target: Target) -> Result<MigrationReport> {
        self.acquire_lock().await?;
        let result = self.up_inner(&target).await;
        self.release_lock().await;
        result
    }

    /// Revert applied migrations newer than `target`, newest first.
    pub async fn down_to(&mut self, target: Target) -> Result<MigrationReport> {
        self.acquire_lock().await?;
        let result = self.down_inner(&target).await;
        self.release_lock().await;
        result
    }

    /// Revert exactly `id`, which must be the most recently applied migration.
    pub async fn revert(&mut self, id: &str) -> Result<MigrationReport> {
        self.acquire_lock().await?;
        let result = self.revert_inner(id).await;
        self.release_lock().await;
        result
    }

    /// Revert the most recently applied migration, if any.
    pub async fn revert_latest(&mut self) -> Result<MigrationReport> {
        self.acquire_lock().await?;
        let result = self.revert_latest_inner().await;
        self.release_lock().await;
        result
    }

    /// Every registered migration with its applied state, ascending by id.
    pub async fn status(&mut self) -> Result<Vec<MigrationStatus>> {
        let applied: HashMap<String, DateTime<Utc>> = self
            .history
            .applied(&mut self.conn)
            .await?
            .into_iter()
            .map(|r| (r.migration_id, r.applied_at))
            .collect();

        for id in applied.keys().filter(|id| !self.registry.contains(id)) {
            warn!("Applied migration {} is not in the registry", id);
        }

        Ok(self
            .registry
            .all()
            .map(|script| {
                let applied_at = applied.get(script.id()).copied();
                MigrationStatus {
                    id: script.id().to_string(),
                    applied: applied_at.is_some(),
                    applied_at,
                }
            })
            .collect())
    }

    async fn acquire_lock(&mut self) -> Result<()> {
        debug!("Acquiring migration lock {}", self.options.lock_name);
        if !self.conn.try_acquire_lock(&self.options.lock_name).await? {
            return Err(StrataError::RunnerBusy(self.options.lock_name.clone()));
        }
        debug!("Migration lock acquired");
        Ok(())
    }

    async fn release_lock(&mut self) {
        match self.conn.release_lock(&self.options.lock_name).await {
            Ok(()) => debug!("Migration lock released"),
            Err(e) => warn!("Failed to release migration lock: {}", e),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.options.cancel {
            Some(token) if token.is_cancelled() => {
                info!("Migration run cancelled");
                Err(StrataError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    /// Read history for planning. A dry run never creates the history table.
    async fn plan_start(&mut self) -> Result<Vec<HistoryRecord>> {
        self.state = RunnerState::Planning;
        if !self.options.dry_run {
            self.history.ensure_initialized(&mut self.conn).await?;
        }
        let applied = self.history.applied(&mut self.conn).await?;
        debug!(
            "Already applied migrations: {:?}",
            applied.iter().map(|r| &r.migration_id).collect::<Vec<_>>()
        );
        Ok(applied)
    }

    async fn up_inner(&mut self, target: &Target) -> Result<MigrationReport> {
        let applied = self.plan_start().await?;
        let registry = self.registry;
        let mut report = MigrationReport::new(Direction::Up);

        let upper = match target {
            Target::Zero => return Ok(report),
            Target::Latest => match registry.latest() {
                Some(script) => script.id(),
                None => return Ok(report),
            },
            Target::Id(id) => registry.find(id)?.id(),
        };

        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.migration_id.as_str()).collect();
        let newest_applied = applied_ids.iter().max().copied();

        let pending: Vec<&MigrationScript> = registry
            .all()
            .filter(|s| s.id() <= upper && !applied_ids.contains(s.id()))
            .collect();
        debug!("{} pending migrations up to {}", pending.len(), upper);

        for script in pending {
            self.check_cancelled()?;
            if newest_applied.is_some_and(|newest| script.id() < newest) {
                warn!(
                    "Applying {} after newer migration {}",
                    script.id(),
                    newest_applied.unwrap_or_default()
                );
            }
            self.step(script, Direction::Up, &mut report).await?;
        }

        Ok(report)
    }

    async fn down_inner(&mut self, target: &Target) -> Result<MigrationReport> {
        let applied = self.plan_start().await?;
        let registry = self.registry;
        let report = MigrationReport::new(Direction::Down);

        let floor = match target {
            Target::Latest => return Ok(report),
            Target::Zero => None,
            // The target itself may still be pending.
            Target::Id(id) => Some(registry.find(id)?.id()),
        };

        self.revert_selected(
            &applied,
            |id| floor.map_or(true, |floor| id > floor),
            report,
        )
        .await
    }

    async fn revert_inner(&mut self, id: &str) -> Result<MigrationReport> {
        let applied = self.plan_start().await?;
        let report = MigrationReport::new(Direction::Down);

        match applied.last() {
            Some(latest) if latest.migration_id == id => {}
            Some(latest) if applied.iter().any(|r| r.migration_id == id) => {
                return Err(StrataError::OutOfOrderRevert {
                    requested: id.to_string(),
                    latest: latest.migration_id.clone(),
                })
            }
            _ => return Err(StrataError::NotApplied(id.to_string())),
        }

        self.revert_selected(&applied, |applied_id| applied_id == id, report)
            .await
    }

    async fn revert_latest_inner(&mut self) -> Result<MigrationReport> {
        let applied = self.plan_start().await?;
        let report = MigrationReport::new(Direction::Down);
        let Some(latest) = applied.last().map(|r| r.migration_id.clone()) else {
            return Ok(report);
        };
        self.revert_selected(&applied, |id| id == latest, report)
            .await
    }

    /// Revert the selected migrations in reverse application order.
    ///
    /// The selection must form a suffix of the application order: a
    /// migration that stays applied may not have been applied after one
    /// being reverted.
    async fn revert_selected(
        &mut self,
        applied: &[HistoryRecord],
        selected: impl Fn(&str) -> bool,
        mut report: MigrationReport,
    ) -> Result<MigrationReport> {
        let registry = self.registry;
        let first = applied
            .iter()
            .position(|r| selected(&r.migration_id))
            .unwrap_or(applied.len());
        let suffix = &applied[first..];

        if let Some(kept) = suffix.iter().find(|r| !selected(&r.migration_id)) {
            debug!("{} was applied after {}", kept.migration_id, applied[first].migration_id);
            return Err(StrataError::OutOfOrderRevert {
                requested: applied[first].migration_id.clone(),
                latest: applied
                    .last()
                    .map(|r| r.migration_id.clone())
                    .unwrap_or_default(),
            });
        }

        let scripts = suffix
            .iter()
            .rev()
            .map(|r| registry.find(&r.migration_id))
            .collect::<Result<Vec<_>>>()?;
        debug!("{} migrations to revert", scripts.len());

        for script in scripts {
            self.check_cancelled()?;
            self.step(script, Direction::Down, &mut report).await?;
        }

        Ok(report)
    }

    async fn step(
        &mut self,
        script: &MigrationScript,
        direction: Direction,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let operations = match direction {
            Direction::Up => &script.up,
            Direction::Down => &script.down,
        };

        if self.options.dry_run {
            let statements = self
                .executor
                .plan(self.conn.dialect(), operations)
                .map_err(|e| StrataError::in_migration(script.id(), e))?;
            report.dry_run_statements.push(PlannedMigration {
                id: script.id().to_string(),
                statements,
            });
            return Ok(());
        }

        self.run_in_transaction(script.id(), operations, direction)
            .await?;
        report.executed.push(script.id().to_string());
        Ok(())
    }

    /// Run one script and its history write in a single transaction.
    async fn run_in_transaction(
        &mut self,
        id: &str,
        operations: &OperationSet,
        direction: Direction,
    ) -> Result<()> {
        match direction {
            Direction::Up => info!("Applying migration: {}", id),
            Direction::Down => info!("Reverting migration: {}", id),
        }
        self.state = RunnerState::Executing;
        let start = Instant::now();

        self.conn
            .begin_transaction()
            .await
            .map_err(|e| StrataError::in_migration(id, e))?;

        let result = match self.executor.execute(&mut self.conn, operations).await {
            Ok(_) => match direction {
                Direction::Up => self.history.record_applied(&mut self.conn, id).await,
                Direction::Down => self.history.record_reverted(&mut self.conn, id).await,
            },
            Err(e) => Err(e),
        };

        let result = match result {
            Ok(()) => self.conn.commit().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.state = RunnerState::Committed;
                info!(
                    "Migration {}: {} ({}ms)",
                    if direction == Direction::Up { "applied" } else { "reverted" },
                    id,
                    start.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.conn.rollback().await {
                    warn!("Rollback of {} failed: {}", id, rollback);
                }
                self.state = RunnerState::RolledBack;
                error!("Migration {} failed: {}", id, e);
                Err(StrataError::in_migration(id, e))
            }
        }
    }
}

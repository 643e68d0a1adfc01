//! Orchestration of migration runs.
//!
//! A run moves one migration at a time through validate, back up,
//! apply, record. Applying and recording are separate transactions on
//! purpose: a crash between the two leaves the schema ahead of the
//! record, and the next run's reconciliation reports that instead of
//! quietly re-running or skipping the migration.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sea_query::Iden;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use strata_core::{
    describe_state, validate, validate_operations, Catalog, DowngradeTarget, Migration, Operation,
    Revision, RevisionGraph, RevisionId, Risk, Target, TransformSpec, ValidationReport,
};
use tracing::{debug, info, warn};

use crate::backup::{
    BackupManager, RestoreConfirmation, RestoreOutcome, SnapshotHandle, SnapshotScope,
};
use crate::config::StrataConfig;
use crate::ddl;
use crate::error::{Error, Result};
use crate::lock;
use crate::rebuild::{self, RebuildReport};
use crate::schema;
use crate::sql::{StrataLock, StrataRevision, StrataRevisionLog};
use crate::store::{self, AppliedRevision, Direction, LogEntry};

/// When the runner snapshots before applying a migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupPolicy {
    /// Snapshot ahead of anything transformational or destructive,
    /// skip it for purely additive migrations.
    #[default]
    Auto,
    Always,
    Never,
}

/// Knobs for one upgrade or downgrade run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Refuse destructive or irreversible migrations outright instead
    /// of backing up and proceeding. Meant for unattended runs.
    pub strict: bool,
    pub backup: BackupPolicy,
}

/// One operation inside a plan, with the SQL it compiles down to when
/// it is a single statement. Rebuilds and transforms have no single
/// statement to show.
#[derive(Debug, Clone)]
pub struct PlanOperation {
    pub summary: String,
    pub sql: Option<Vec<String>>,
}

/// One migration inside a plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub report: ValidationReport,
    pub operations: Vec<PlanOperation>,
    /// What the default backup policy would snapshot first.
    pub snapshot: Option<SnapshotScope>,
}

/// Everything a run would do, computed without changing anything.
#[derive(Debug, Clone)]
pub struct Plan {
    pub direction: Direction,
    pub steps: Vec<PlanStep>,
}

/// Lock row as reported by `status`.
#[derive(Debug, Clone)]
pub struct LockState {
    pub held_by: String,
    pub since: DateTime<Utc>,
}

/// Recorded checksum versus what the live schema hashes to.
#[derive(Debug, Clone)]
pub struct SchemaMismatch {
    pub recorded: String,
    pub expected: String,
    pub observed: String,
}

/// Where a database stands relative to the catalog.
#[derive(Debug)]
pub struct StatusReport {
    /// Revisions recorded as applied. Empty means unmigrated; more
    /// than one means a branch was applied without a merge revision.
    pub current: Vec<AppliedRevision>,
    /// Migrations between the recorded state and the catalog head, in
    /// apply order. Empty when the catalog itself is divergent.
    pub pending: Vec<Revision>,
    pub catalog_heads: Vec<RevisionId>,
    /// The catalog or the recorded history has more than one head.
    pub divergent: bool,
    pub mismatch: Option<SchemaMismatch>,
    pub lock: Option<LockState>,
}

/// One migration a run carried through all of its phases.
#[derive(Debug)]
pub struct StepOutcome {
    pub revision: RevisionId,
    pub label: String,
    pub risk: Risk,
    pub snapshot: Option<SnapshotHandle>,
    pub rebuilds: Vec<RebuildReport>,
}

/// What a completed run did.
#[derive(Debug)]
pub struct RunReport {
    pub direction: Direction,
    pub steps: Vec<StepOutcome>,
}

/// Lifecycle of a single migration inside a run, logged at every
/// transition so an interrupted run shows where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Validating,
    BackingUp,
    Applying,
    Recording,
    RollingBack,
    Failed,
    Idle,
}

fn enter(phase: Phase) {
    debug!(?phase, "migration phase");
}

/// A resolved migration ready to run: its description, the operations
/// for the chosen direction, and the pre-flight report over exactly
/// those operations.
struct Step {
    revision: Revision,
    operations: Vec<Operation>,
    report: ValidationReport,
    kind: StepKind,
}

enum StepKind {
    Apply,
    Revert { parents: Vec<Revision> },
}

/// Drives migrations against one SQLite database.
///
/// A runner owns the catalog and a connection pool. Every run borrows a
/// single connection for its whole lifetime so the advisory lock, the
/// pragmas and the transactions all happen on the same session.
pub struct Runner {
    pool: SqlitePool,
    database_path: PathBuf,
    catalog: Catalog,
    config: StrataConfig,
}

impl Runner {
    pub fn new(pool: SqlitePool, database_path: impl Into<PathBuf>, catalog: Catalog) -> Self {
        Self {
            pool,
            database_path: database_path.into(),
            catalog,
            config: StrataConfig::default(),
        }
    }

    /// Replace the default configuration.
    pub fn with_config(mut self, config: StrataConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Backup manager bound to this runner's database and backup
    /// directory.
    pub fn backup_manager(&self) -> BackupManager {
        BackupManager::new(&self.database_path, &self.config.backup_dir)
    }

    /// Apply every migration between the recorded state and `target`.
    ///
    /// Each migration runs through validate, back up, apply, record. A
    /// failure restores the snapshot when one was taken and surfaces as
    /// [`Error::ApplyFailed`]; migrations recorded before the failure
    /// stay recorded. The advisory lock is held for the whole run.
    pub async fn upgrade(&self, target: &Target, options: &RunOptions) -> Result<RunReport> {
        let graph = RevisionGraph::new(&self.catalog)?;
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        store::init(conn).await?;
        lock::init(conn).await?;

        let owner = self.lock_owner();
        lock::acquire(conn, &owner).await?;

        let result = self.run_upgrade(conn, &graph, target, options).await;

        finish(result, lock::release(conn, &owner).await)
    }

    /// Revert migrations until the database sits at `target`.
    ///
    /// The whole path is checked for irreversible migrations before
    /// anything runs. Down operations get the same treatment as up
    /// ones: they are classified, risky steps are snapshotted first,
    /// and every revert lands in the audit log.
    pub async fn downgrade(
        &self,
        target: &DowngradeTarget,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let graph = RevisionGraph::new(&self.catalog)?;
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        store::init(conn).await?;
        lock::init(conn).await?;

        let owner = self.lock_owner();
        lock::acquire(conn, &owner).await?;

        let result = self.run_downgrade(conn, &graph, target, options).await;

        finish(result, lock::release(conn, &owner).await)
    }

    /// What `upgrade` would do, without taking the lock or changing
    /// anything.
    pub async fn plan(&self, target: &Target) -> Result<Plan> {
        let graph = RevisionGraph::new(&self.catalog)?;
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        let current = self.current_heads(conn).await?;
        let path = graph.upgrade_path(&current, target)?;

        let mut steps = Vec::with_capacity(path.len());
        for id in &path {
            let migration = self.require(id)?;
            let operations = migration.up();
            steps.push(plan_step(validate(migration), &operations));
        }

        Ok(Plan {
            direction: Direction::Up,
            steps,
        })
    }

    /// What `downgrade` would do. Fails up front when the path crosses
    /// an irreversible migration.
    pub async fn plan_downgrade(&self, target: &DowngradeTarget) -> Result<Plan> {
        let graph = RevisionGraph::new(&self.catalog)?;
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        let current = self.current_heads(conn).await?;
        let path = graph.downgrade_path(&current, target)?;

        let mut steps = Vec::with_capacity(path.len());
        for id in &path {
            let migration = self.require(id)?;
            let operations = migration.down().unwrap_or_default();
            let report = validate_operations(
                migration.revision(),
                migration.label(),
                &operations,
                false,
            );
            steps.push(plan_step(report, &operations));
        }

        Ok(Plan {
            direction: Direction::Down,
            steps,
        })
    }

    /// Where the database stands: recorded heads, pending migrations,
    /// checksum agreement, lock state. Read-only; checking status never
    /// creates the engine's tables.
    pub async fn status(&self) -> Result<StatusReport> {
        let graph = RevisionGraph::new(&self.catalog)?;
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        let current = if schema::table_exists(conn, &StrataRevision::Table.to_string()).await? {
            store::heads(conn).await?
        } else {
            Vec::new()
        };
        let current_ids: Vec<RevisionId> =
            current.iter().map(|row| row.revision.clone()).collect();

        let observed = schema::checksum(conn).await?;
        let expected = newest(&current)
            .map(|row| row.checksum.clone())
            .unwrap_or_else(schema::empty_checksum);
        let mismatch = if expected == observed {
            None
        } else {
            Some(SchemaMismatch {
                recorded: describe_state(&current_ids),
                expected,
                observed,
            })
        };

        let pending = match graph.upgrade_path(&current_ids, &Target::Latest) {
            Ok(path) => {
                let mut revisions = Vec::with_capacity(path.len());
                for id in &path {
                    revisions.push(self.require(id)?.describe());
                }
                revisions
            }
            Err(strata_core::Error::DivergentHistory { .. }) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let lock = if schema::table_exists(conn, &StrataLock::Table.to_string()).await? {
            lock::holder(conn)
                .await?
                .map(|(held_by, since)| LockState { held_by, since })
        } else {
            None
        };

        let catalog_heads = graph.heads();
        let divergent = catalog_heads.len() > 1 || current.len() > 1;

        Ok(StatusReport {
            current,
            pending,
            catalog_heads,
            divergent,
            mismatch,
            lock,
        })
    }

    /// Audit trail, newest first.
    pub async fn history(&self, limit: Option<u64>) -> Result<Vec<LogEntry>> {
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        if !schema::table_exists(conn, &StrataRevisionLog::Table.to_string()).await? {
            return Ok(Vec::new());
        }

        store::history(conn, limit).await
    }

    /// Overwrite the recorded state with `revision`, or with the
    /// unmigrated sentinel when `None`.
    ///
    /// The schema itself is not touched; the live checksum becomes the
    /// new expectation. This is the operator's answer to a
    /// reconciliation mismatch, so it deliberately skips the mismatch
    /// check a normal run would make.
    pub async fn stamp(&self, revision: Option<&RevisionId>) -> Result<()> {
        let described = match revision {
            Some(id) => Some(self.require(id)?.describe()),
            None => None,
        };

        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        store::init(conn).await?;
        lock::init(conn).await?;

        let owner = self.lock_owner();
        lock::acquire(conn, &owner).await?;

        let result = self.run_stamp(conn, described.as_ref()).await;

        finish(result, lock::release(conn, &owner).await)
    }

    /// Pre-flight reports for every migration in the catalog, in
    /// catalog order. Also checks the revision graph is well formed.
    pub fn validate_catalog(&self) -> Result<Vec<ValidationReport>> {
        RevisionGraph::new(&self.catalog)?;

        Ok(self
            .catalog
            .iter()
            .map(|migration| validate(migration))
            .collect())
    }

    /// Take a snapshot outside of any migration run.
    pub async fn snapshot(&self, scope: SnapshotScope) -> Result<SnapshotHandle> {
        let mut conn = self.pool.acquire().await?;

        self.backup_manager().snapshot(&mut conn, scope).await
    }

    /// Snapshots on disk, oldest first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        self.backup_manager().list()
    }

    /// Restore a snapshot under the advisory lock, so a restore can
    /// never race a migration run.
    pub async fn restore(
        &self,
        handle: &SnapshotHandle,
        confirmation: RestoreConfirmation,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        lock::init(conn).await?;

        let owner = self.lock_owner();
        lock::acquire(conn, &owner).await?;

        let result = self
            .backup_manager()
            .restore(conn, handle, confirmation)
            .await;

        finish(result, lock::release(conn, &owner).await)
    }

    /// Clear an advisory lock left behind by a crashed run. Returns
    /// whether a holder was actually cleared.
    pub async fn unlock(&self) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let conn = &mut *conn;

        lock::init(conn).await?;
        let cleared = lock::force_release(conn).await?;

        if cleared {
            warn!("migration lock forcibly released");
        }

        Ok(cleared)
    }

    async fn run_upgrade(
        &self,
        conn: &mut SqliteConnection,
        graph: &RevisionGraph,
        target: &Target,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let mut current = self.reconcile(conn).await?;
        let path = graph.upgrade_path(&current, target)?;

        if path.is_empty() {
            info!(target = %target, "nothing to apply");
            return Ok(RunReport {
                direction: Direction::Up,
                steps: Vec::new(),
            });
        }

        info!(
            migrations = path.len(),
            from = %describe_state(&current),
            target = %target,
            "upgrading"
        );

        let target_label = target.to_string();
        let mut steps = Vec::with_capacity(path.len());

        for id in &path {
            let migration = self.require(id)?;
            let step = Step {
                revision: migration.describe(),
                operations: migration.up(),
                report: validate(migration),
                kind: StepKind::Apply,
            };

            steps.push(
                self.run_step(conn, step, options, &target_label, &mut current)
                    .await?,
            );
        }

        Ok(RunReport {
            direction: Direction::Up,
            steps,
        })
    }

    async fn run_downgrade(
        &self,
        conn: &mut SqliteConnection,
        graph: &RevisionGraph,
        target: &DowngradeTarget,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let mut current = self.reconcile(conn).await?;
        let path = graph.downgrade_path(&current, target)?;

        if path.is_empty() {
            info!(target = %target, "nothing to revert");
            return Ok(RunReport {
                direction: Direction::Down,
                steps: Vec::new(),
            });
        }

        info!(
            migrations = path.len(),
            from = %describe_state(&current),
            target = %target,
            "downgrading"
        );

        let target_label = target.to_string();
        let mut steps = Vec::with_capacity(path.len());

        for id in &path {
            let migration = self.require(id)?;
            let revision = migration.describe();
            let Some(operations) = migration.down() else {
                return Err(strata_core::Error::IrreversibleMigration {
                    revision: revision.id,
                }
                .into());
            };

            let report = validate_operations(
                revision.id.clone(),
                revision.label.clone(),
                &operations,
                false,
            );

            let mut parents = Vec::with_capacity(revision.parents.len());
            for parent in &revision.parents {
                parents.push(self.require(parent)?.describe());
            }

            let step = Step {
                revision,
                operations,
                report,
                kind: StepKind::Revert { parents },
            };

            steps.push(
                self.run_step(conn, step, options, &target_label, &mut current)
                    .await?,
            );
        }

        Ok(RunReport {
            direction: Direction::Down,
            steps,
        })
    }

    /// Compare the recorded state against the live schema before
    /// touching anything. A disagreement means migrations ran outside
    /// the engine, or a previous run crashed between applying and
    /// recording; only an operator can decide which side is right.
    async fn reconcile(&self, conn: &mut SqliteConnection) -> Result<Vec<RevisionId>> {
        let rows = store::heads(conn).await?;
        let observed = schema::checksum(conn).await?;

        if rows.is_empty() {
            let expected = schema::empty_checksum();
            if observed != expected {
                return Err(Error::ReconciliationMismatch {
                    recorded: "unmigrated".to_owned(),
                    expected,
                    observed,
                });
            }
            return Ok(Vec::new());
        }

        let ids: Vec<RevisionId> = rows.iter().map(|row| row.revision.clone()).collect();

        // The newest head carries the checksum of the schema as it
        // stands now.
        let mut latest = &rows[0];
        for row in &rows[1..] {
            if row.applied_at > latest.applied_at {
                latest = row;
            }
        }

        if latest.checksum != observed {
            return Err(Error::ReconciliationMismatch {
                recorded: describe_state(&ids),
                expected: latest.checksum.clone(),
                observed,
            });
        }

        if ids.len() > 1 {
            warn!(
                heads = %describe_state(&ids),
                "database records multiple heads; apply a merge revision or downgrade to resolve"
            );
        }

        Ok(ids)
    }

    async fn run_step(
        &self,
        conn: &mut SqliteConnection,
        step: Step,
        options: &RunOptions,
        target_label: &str,
        current: &mut Vec<RevisionId>,
    ) -> Result<StepOutcome> {
        let Step {
            revision,
            operations,
            report,
            kind,
        } = step;

        enter(Phase::Validating);
        for finding in &report.findings {
            debug!(revision = %revision.id, kind = ?finding.kind, "{}", finding.detail);
        }
        if options.strict && matches!(kind, StepKind::Apply) {
            report.ensure_unblocked()?;
        }

        let snapshot = if self.should_snapshot(&report, options) {
            enter(Phase::BackingUp);
            let scope = snapshot_scope(&operations);
            Some(self.backup_manager().snapshot(conn, scope).await?)
        } else {
            None
        };

        enter(Phase::Applying);
        info!(
            revision = %revision.id,
            label = %revision.label,
            risk = ?report.risk,
            "applying"
        );

        match self.apply_and_record(conn, &revision, &operations, &kind).await {
            Ok(rebuilds) => {
                match &kind {
                    StepKind::Apply => {
                        current.retain(|id| !revision.parents.contains(id));
                        current.push(revision.id.clone());
                    }
                    StepKind::Revert { parents } => {
                        current.retain(|id| *id != revision.id);
                        for parent in parents {
                            if !current.contains(&parent.id) {
                                current.push(parent.id.clone());
                            }
                        }
                    }
                }

                enter(Phase::Idle);

                Ok(StepOutcome {
                    revision: revision.id,
                    label: revision.label,
                    risk: report.risk,
                    snapshot,
                    rebuilds,
                })
            }
            Err(err) => {
                let restore = match &snapshot {
                    Some(handle) => {
                        enter(Phase::RollingBack);
                        warn!(
                            revision = %revision.id,
                            error = %err,
                            "apply failed, restoring snapshot"
                        );

                        let confirmation = RestoreConfirmation::acknowledge_data_loss(handle);
                        match self.backup_manager().restore(conn, handle, confirmation).await {
                            Ok(()) => RestoreOutcome::Restored {
                                handle: handle.id.clone(),
                            },
                            Err(restore_err) => RestoreOutcome::RestoreFailed {
                                handle: handle.id.clone(),
                                error: restore_err.to_string(),
                            },
                        }
                    }
                    None => RestoreOutcome::NotAttempted,
                };

                enter(Phase::Failed);

                Err(Error::ApplyFailed {
                    revision: revision.id,
                    current: describe_state(current),
                    target: target_label.to_owned(),
                    source: Box::new(err),
                    restore,
                })
            }
        }
    }

    /// Apply the operations, then record the transition. Recording is
    /// covered by the same failure handling as applying: if it fails,
    /// the snapshot restore puts data and record back in agreement.
    async fn apply_and_record(
        &self,
        conn: &mut SqliteConnection,
        revision: &Revision,
        operations: &[Operation],
        kind: &StepKind,
    ) -> Result<Vec<RebuildReport>> {
        let rebuilds = self.apply_operations(conn, operations).await?;

        enter(Phase::Recording);
        let checksum = schema::checksum(conn).await?;
        match kind {
            StepKind::Apply => store::record_applied(conn, revision, &checksum).await?,
            StepKind::Revert { parents } => {
                store::record_reverted(conn, revision, parents, &checksum).await?
            }
        }

        Ok(rebuilds)
    }

    async fn apply_operations(
        &self,
        conn: &mut SqliteConnection,
        operations: &[Operation],
    ) -> Result<Vec<RebuildReport>> {
        let transactional = operations.iter().all(|operation| {
            !matches!(
                operation,
                Operation::RebuildTable(_) | Operation::Transform(_)
            )
        });

        let mut rebuilds = Vec::new();

        if transactional {
            // Plain DDL throughout: one transaction, all or nothing.
            let mut txn = conn.begin().await?;
            for operation in operations {
                if let Some(present) = already_present(&mut *txn, operation).await? {
                    warn!("{present} already exists, skipping");
                    continue;
                }
                for sql in ddl::render(operation).unwrap_or_default() {
                    debug!(%sql, "ddl");
                    sqlx::query(&sql).execute(&mut *txn).await?;
                }
            }
            txn.commit().await?;

            return Ok(rebuilds);
        }

        // Rebuilds and transforms manage their own commit points, so
        // the migration as a whole cannot be a single transaction.
        // Plain operations in between run one statement at a time.
        for operation in operations {
            match operation {
                Operation::RebuildTable(spec) => {
                    rebuilds.push(rebuild::execute(conn, spec, &self.config).await?);
                }
                Operation::Transform(spec) => {
                    self.run_transform(conn, spec).await?;
                }
                other => {
                    if let Some(present) = already_present(conn, other).await? {
                        warn!("{present} already exists, skipping");
                        continue;
                    }
                    for sql in ddl::render(other).unwrap_or_default() {
                        debug!(%sql, "ddl");
                        sqlx::query(&sql).execute(&mut *conn).await?;
                    }
                }
            }
        }

        Ok(rebuilds)
    }

    /// Run a data transform until its remaining-rows query reaches
    /// zero, committing after every batch. Each batch must shrink the
    /// remaining count, otherwise the statement and the predicate
    /// disagree and looping would never end.
    async fn run_transform(
        &self,
        conn: &mut SqliteConnection,
        spec: &TransformSpec,
    ) -> Result<u64> {
        let mut remaining = self.remaining_rows(conn, spec).await?;
        let mut batches = 0u64;

        while remaining > 0 {
            let mut txn = conn.begin().await?;
            sqlx::query(&spec.statement).execute(&mut *txn).await?;
            txn.commit().await?;
            batches += 1;

            let next = self.remaining_rows(conn, spec).await?;
            if next >= remaining {
                return Err(Error::TransformStalled(format!(
                    "{}: a batch left {next} of {remaining} rows unprocessed",
                    spec.description
                )));
            }
            remaining = next;
        }

        debug!(transform = %spec.description, batches, "transform drained");

        Ok(batches)
    }

    async fn remaining_rows(
        &self,
        conn: &mut SqliteConnection,
        spec: &TransformSpec,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&spec.remaining)
            .fetch_one(&mut *conn)
            .await?;

        Ok(count)
    }

    async fn run_stamp(
        &self,
        conn: &mut SqliteConnection,
        revision: Option<&Revision>,
    ) -> Result<()> {
        let observed = schema::checksum(conn).await?;
        store::stamp(conn, revision, &observed).await?;

        info!(
            revision = revision.map(|revision| revision.id.as_str()).unwrap_or("unmigrated"),
            "recorded state overwritten"
        );

        Ok(())
    }

    async fn current_heads(&self, conn: &mut SqliteConnection) -> Result<Vec<RevisionId>> {
        if !schema::table_exists(conn, &StrataRevision::Table.to_string()).await? {
            return Ok(Vec::new());
        }

        Ok(store::heads(conn)
            .await?
            .into_iter()
            .map(|row| row.revision)
            .collect())
    }

    fn should_snapshot(&self, report: &ValidationReport, options: &RunOptions) -> bool {
        match options.backup {
            BackupPolicy::Always => true,
            BackupPolicy::Never => false,
            BackupPolicy::Auto => report.risk > Risk::Additive,
        }
    }

    fn lock_owner(&self) -> String {
        self.config
            .lock_owner
            .clone()
            .unwrap_or_else(lock::default_owner)
    }

    fn require(&self, id: &RevisionId) -> Result<&dyn Migration> {
        self.catalog.get(id).ok_or_else(|| {
            strata_core::Error::InvalidCatalog(format!("revision `{id}` is not in the catalog"))
                .into()
        })
    }
}

fn plan_step(report: ValidationReport, operations: &[Operation]) -> PlanStep {
    let snapshot = (report.risk > Risk::Additive).then(|| snapshot_scope(operations));

    let operations = operations
        .iter()
        .map(|operation| PlanOperation {
            summary: operation.to_string(),
            sql: ddl::render(operation),
        })
        .collect();

    PlanStep {
        report,
        operations,
        snapshot,
    }
}

/// Tables a snapshot must cover for these operations. Any operation
/// with unbounded reach widens the scope to the whole database, as
/// does a created table: it is not in the snapshot, and a targeted
/// restore could not remove it again.
fn snapshot_scope(operations: &[Operation]) -> SnapshotScope {
    let mut tables = BTreeSet::new();

    for operation in operations {
        if matches!(operation, Operation::CreateTable(_)) {
            return SnapshotScope::Database;
        }

        match operation.tables_touched() {
            None => return SnapshotScope::Database,
            Some(touched) => tables.extend(touched),
        }
    }

    if tables.is_empty() {
        SnapshotScope::Database
    } else {
        SnapshotScope::Tables(tables.into_iter().collect())
    }
}

/// Target of an additive operation that already exists in the live
/// schema, usually via a stamped out-of-band change. The caller skips
/// the operation instead of letting SQLite fail on the duplicate.
async fn already_present(
    conn: &mut SqliteConnection,
    operation: &Operation,
) -> Result<Option<String>> {
    match operation {
        Operation::CreateTable(spec) => {
            if schema::table_exists(conn, &spec.name).await? {
                return Ok(Some(format!("table `{}`", spec.name)));
            }
        }
        Operation::AddColumn { table, column } => {
            if schema::column_exists(conn, table, &column.name).await? {
                return Ok(Some(format!("column `{}` on `{table}`", column.name)));
            }
        }
        Operation::CreateIndex(spec) => {
            if schema::index_exists(conn, &spec.name).await? {
                return Ok(Some(format!("index `{}`", spec.name)));
            }
        }
        _ => {}
    }

    Ok(None)
}

fn newest(rows: &[AppliedRevision]) -> Option<&AppliedRevision> {
    rows.iter().max_by_key(|row| row.applied_at)
}

/// Combine a run result with the lock release that follows it. The
/// run's own error wins; a release failure on top of it is only
/// logged.
fn finish<T>(result: Result<T>, released: Result<()>) -> Result<T> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!(error = %release_err, "lock release failed after a failed run");
            Err(err)
        }
    }
}

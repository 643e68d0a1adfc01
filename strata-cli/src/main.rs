//! Command line front end for the strata migration engine.
//!
//! Subcommands:
//! - `status`: where the database stands relative to the migration directory
//! - `upgrade` / `downgrade`: move the schema forward or back
//! - `validate`: classify every migration without a database
//! - `backup` / `restore` / `snapshots`: snapshot management
//! - `history`: the audit log of applied and reverted migrations
//! - `stamp`: overwrite the recorded revision after manual repair
//! - `unlock`: clear a lock left behind by a crashed run

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing_subscriber::EnvFilter;

use strata::{
    validate, BackupManager, BackupPolicy, Catalog, ConfigBuilder, CoreError, Direction,
    DowngradeTarget, Error, FileMigration, Plan, Result, RestoreConfirmation, RevisionGraph,
    RevisionId, Risk, RunOptions, RunReport, Runner, SnapshotScope, StatusReport, Target,
    ValidationReport,
};

/// Versioned schema migrations for SQLite
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Versioned schema migrations for SQLite")]
#[command(version)]
struct App {
    /// Path to the SQLite database file
    #[arg(long, env = "STRATA_DATABASE", default_value = "strata.db", global = true)]
    database: PathBuf,

    /// Directory holding one JSON migration file per revision
    #[arg(long, env = "STRATA_MIGRATIONS", default_value = "migrations", global = true)]
    migrations: PathBuf,

    /// Directory where snapshots are written
    #[arg(long, env = "STRATA_BACKUP_DIR", global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show current revision, pending migrations and lock state
    Status,

    /// Apply pending migrations
    Upgrade {
        /// Stop at this revision instead of the latest
        #[arg(long)]
        to: Option<String>,

        /// Print what would run without running it
        #[arg(long)]
        dry_run: bool,

        /// Refuse destructive or irreversible migrations outright
        #[arg(long)]
        strict: bool,

        /// When to snapshot before a migration
        #[arg(long, value_enum, default_value_t = BackupChoice::Auto)]
        backup: BackupChoice,
    },

    /// Revert applied migrations
    Downgrade {
        /// Revert everything applied after this revision
        #[arg(long, conflicts_with_all = ["steps", "base"])]
        to: Option<String>,

        /// Revert this many revisions
        #[arg(long, conflicts_with = "base")]
        steps: Option<usize>,

        /// Revert everything, back to an empty schema
        #[arg(long)]
        base: bool,

        /// Print what would run without running it
        #[arg(long)]
        dry_run: bool,

        /// When to snapshot before a revert
        #[arg(long, value_enum, default_value_t = BackupChoice::Auto)]
        backup: BackupChoice,
    },

    /// Classify migrations without touching the database
    Validate {
        /// Validate one migration file instead of the whole catalog
        #[arg(long)]
        file: Option<PathBuf>,

        /// Exit non-zero when any migration would be blocked
        #[arg(long)]
        strict: bool,
    },

    /// Snapshot the whole database, or only the given tables
    Backup {
        /// Table to include; repeat for several, omit for the whole
        /// database
        #[arg(long)]
        table: Vec<String>,
    },

    /// Overwrite current data with a snapshot's contents
    Restore {
        /// Snapshot id, as printed by `snapshots`
        id: String,

        /// Acknowledge that current data will be overwritten
        #[arg(long)]
        confirm: bool,
    },

    /// List snapshots on disk
    Snapshots,

    /// Show the audit log, newest first
    History {
        /// Only the most recent entries
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Record the live schema as a revision without running anything
    Stamp {
        /// Revision id, or `unmigrated` to clear the recorded state
        revision: String,
    },

    /// Clear a migration lock left behind by a crashed run
    Unlock,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackupChoice {
    /// Snapshot only ahead of risky migrations
    Auto,
    Always,
    Never,
}

impl From<BackupChoice> for BackupPolicy {
    fn from(choice: BackupChoice) -> Self {
        match choice {
            BackupChoice::Auto => BackupPolicy::Auto,
            BackupChoice::Always => BackupPolicy::Always,
            BackupChoice::Never => BackupPolicy::Never,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let app = App::parse();

    match app.run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

impl App {
    async fn run(self) -> Result<u8> {
        let App {
            database,
            migrations,
            backup_dir,
            command,
        } = self;

        let mut builder = ConfigBuilder::new();
        if let Some(dir) = backup_dir {
            builder = builder.backup_dir(dir);
        }
        let config = builder.build();

        // Snapshot listing works without a catalog or a connection.
        if let Command::Snapshots = command {
            let manager = BackupManager::new(&database, &config.backup_dir);
            return list_snapshots(&manager);
        }

        // Validation is pure; no database involved.
        if let Command::Validate { file, strict } = &command {
            let reports = match file {
                Some(path) => vec![validate(&FileMigration::load(path)?)],
                None => {
                    let catalog = Catalog::load_dir(&migrations)?;
                    RevisionGraph::new(&catalog)?;
                    catalog.iter().map(validate).collect()
                }
            };

            let mut blocked = false;
            for report in &reports {
                print_validation(report);
                blocked = blocked || report.is_blocking();
            }

            return Ok(if *strict && blocked { 4 } else { 0 });
        }

        let catalog = load_catalog(&migrations, &command)?;

        let pool = connect(&database).await?;
        let runner = Runner::new(pool, &database, catalog).with_config(config);

        match command {
            Command::Status => {
                let report = runner.status().await?;
                print_status(&database, &report);

                if report.mismatch.is_some() {
                    return Ok(7);
                }
                if report.divergent {
                    return Ok(3);
                }
                Ok(0)
            }
            Command::Upgrade {
                to,
                dry_run,
                strict,
                backup,
            } => {
                let target = match to {
                    Some(revision) => Target::Revision(RevisionId::from(revision)),
                    None => Target::Latest,
                };

                if dry_run {
                    print_plan(&runner.plan(&target).await?);
                    return Ok(0);
                }

                let options = RunOptions {
                    strict,
                    backup: backup.into(),
                };
                print_run(&runner.upgrade(&target, &options).await?);
                Ok(0)
            }
            Command::Downgrade {
                to,
                steps,
                base,
                dry_run,
                backup,
            } => {
                let target = if base {
                    DowngradeTarget::Base
                } else if let Some(steps) = steps {
                    DowngradeTarget::Steps(steps)
                } else if let Some(revision) = to {
                    DowngradeTarget::Revision(RevisionId::from(revision))
                } else {
                    App::command()
                        .error(
                            clap::error::ErrorKind::MissingRequiredArgument,
                            "one of --to, --steps or --base is required",
                        )
                        .exit()
                };

                if dry_run {
                    print_plan(&runner.plan_downgrade(&target).await?);
                    return Ok(0);
                }

                let options = RunOptions {
                    strict: false,
                    backup: backup.into(),
                };
                print_run(&runner.downgrade(&target, &options).await?);
                Ok(0)
            }
            Command::Backup { table } => {
                let scope = if table.is_empty() {
                    SnapshotScope::Database
                } else {
                    SnapshotScope::Tables(table)
                };

                let handle = runner.snapshot(scope).await?;
                println!("snapshot {} written to {}", handle.id, handle.path.display());
                Ok(0)
            }
            Command::Restore { id, confirm } => {
                if !confirm {
                    return Err(Error::RestoreBlocked(
                        "restoring overwrites current data, re-run with --confirm".to_owned(),
                    ));
                }

                let manager = runner.backup_manager();
                let handle = manager.load(&id)?;
                let confirmation = RestoreConfirmation::acknowledge_data_loss(&handle);
                runner.restore(&handle, confirmation).await?;

                println!("restored snapshot {}", handle.id);
                Ok(0)
            }
            Command::History { limit } => {
                for entry in runner.history(limit).await? {
                    println!(
                        "{}  {:<5}  {}  {}",
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.direction.as_str(),
                        entry.revision,
                        entry.label,
                    );
                }
                Ok(0)
            }
            Command::Stamp { revision } => {
                let target = if revision == "unmigrated" {
                    None
                } else {
                    Some(RevisionId::from(revision.as_str()))
                };

                runner.stamp(target.as_ref()).await?;
                println!("recorded state set to {revision}");
                Ok(0)
            }
            Command::Unlock => {
                if runner.unlock().await? {
                    println!("lock cleared");
                } else {
                    println!("lock was not held");
                }
                Ok(0)
            }
            Command::Snapshots | Command::Validate { .. } => Ok(0),
        }
    }
}

/// Commands that plan or record migrations need the migration files;
/// the purely operational ones work against whatever is on disk.
fn load_catalog(path: &Path, command: &Command) -> Result<Catalog> {
    let required = matches!(
        command,
        Command::Status
            | Command::Upgrade { .. }
            | Command::Downgrade { .. }
            | Command::Stamp { .. }
    );

    if !required && !path.is_dir() {
        return Ok(Catalog::new());
    }

    Ok(Catalog::load_dir(path)?)
}

async fn connect(database: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(database)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn list_snapshots(manager: &BackupManager) -> Result<u8> {
    let handles = manager.list()?;

    if handles.is_empty() {
        println!("no snapshots");
        return Ok(0);
    }

    for handle in handles {
        println!(
            "{}  {}  {}",
            handle.id,
            handle.created_at.format("%Y-%m-%d %H:%M:%S"),
            scope_label(&handle.scope),
        );
    }

    Ok(0)
}

fn print_status(database: &Path, report: &StatusReport) {
    println!("database: {}", database.display());

    if report.current.is_empty() {
        println!("current: unmigrated");
    } else {
        for row in &report.current {
            println!(
                "current: {} ({}) applied {}",
                row.revision,
                row.label,
                row.applied_at.format("%Y-%m-%d %H:%M:%S"),
            );
        }
    }

    if report.pending.is_empty() {
        println!("pending: none");
    } else {
        println!("pending: {} migration(s)", report.pending.len());
        for revision in &report.pending {
            println!("  {} ({})", revision.id, revision.label);
        }
    }

    if report.divergent {
        let heads = report
            .catalog_heads
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!("divergent history: heads {heads}, a merge revision is required");
    }

    if let Some(lock) = &report.lock {
        println!(
            "lock: held by {} since {}",
            lock.held_by,
            lock.since.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    match &report.mismatch {
        Some(mismatch) => println!(
            "schema: MISMATCH, recorded {} expects {} but the live schema hashes to {}",
            mismatch.recorded, mismatch.expected, mismatch.observed,
        ),
        None => println!("schema: checksum ok"),
    }
}

fn print_plan(plan: &Plan) {
    if plan.steps.is_empty() {
        println!("nothing to do");
        return;
    }

    let verb = match plan.direction {
        Direction::Up => "apply",
        _ => "revert",
    };

    for step in &plan.steps {
        println!(
            "{verb} {} ({}) [{}]",
            step.report.revision,
            step.report.label,
            risk_label(step.report.risk),
        );

        if let Some(scope) = &step.snapshot {
            println!("  snapshot first: {}", scope_label(scope));
        }
        for finding in &step.report.findings {
            println!("  ! {}", finding.detail);
        }
        for operation in &step.operations {
            match &operation.sql {
                Some(statements) => {
                    for sql in statements {
                        println!("  {sql};");
                    }
                }
                None => println!("  {}", operation.summary),
            }
        }
    }
}

fn print_run(report: &RunReport) {
    if report.steps.is_empty() {
        println!("nothing to do");
        return;
    }

    let verb = match report.direction {
        Direction::Up => "applied",
        _ => "reverted",
    };

    for step in &report.steps {
        let mut line = format!(
            "{verb} {} ({}) [{}]",
            step.revision,
            step.label,
            risk_label(step.risk),
        );
        if let Some(snapshot) = &step.snapshot {
            line.push_str(&format!(", snapshot {}", snapshot.id));
        }
        println!("{line}");

        for rebuild in &step.rebuilds {
            println!(
                "  rebuilt {}: {} rows copied, {} orphaned rows excluded",
                rebuild.table, rebuild.rows_copied, rebuild.orphans.count,
            );
        }
    }
}

fn print_validation(report: &ValidationReport) {
    println!(
        "{} ({}) [{}]",
        report.revision,
        report.label,
        risk_label(report.risk),
    );

    for finding in &report.findings {
        println!("  {}", finding.detail);
    }
}

fn risk_label(risk: Risk) -> &'static str {
    match risk {
        Risk::Additive => "additive",
        Risk::Transformational => "transformational",
        Risk::Destructive => "destructive",
    }
}

fn scope_label(scope: &SnapshotScope) -> String {
    match scope {
        SnapshotScope::Database => "whole database".to_owned(),
        SnapshotScope::Tables(tables) => tables.join(", "),
    }
}

fn exit_code(error: &Error) -> u8 {
    match error {
        Error::Core(core) => match core {
            CoreError::DivergentHistory { .. } => 3,
            CoreError::ValidationBlocked { .. } => 4,
            CoreError::IrreversibleMigration { .. } => 5,
            CoreError::UnreachableRevision { .. } => 9,
            _ => 1,
        },
        Error::Sqlx(_) => 2,
        Error::MigrationInProgress { .. } => 6,
        Error::ReconciliationMismatch { .. } => 7,
        Error::BackupFailed(_) | Error::RestoreBlocked(_) => 8,
        _ => 1,
    }
}

//! Snapshot and restore of the target database.
//!
//! Artifacts are plain SQLite files living outside the live database, a
//! sibling JSON manifest maps handle to artifact unambiguously. A
//! snapshot either completes or leaves nothing behind: everything is
//! written to a `.part` path first and the rename to the final name is
//! the commit point. Snapshots are never deleted by the engine; only an
//! operator discards them.
//!
//! Restoring is destructive to current state by design, so it demands a
//! [`RestoreConfirmation`] minted for the exact snapshot being restored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, ExprTrait, Order, Query};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use sqlx::sqlite::SqliteConnectOptions;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::schema;
use crate::sql::{build_sqlx, quote_ident, quote_literal};

/// What a snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotScope {
    /// The whole database file, engine bookkeeping included.
    Database,
    /// A bounded set of user tables.
    Tables(Vec<String>),
}

/// A completed snapshot: the handle callers keep to restore later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub scope: SnapshotScope,
    pub path: PathBuf,
}

/// Proof that the caller understands a restore overwrites current data.
///
/// A confirmation is bound to one snapshot; restoring with a token
/// minted for a different handle is refused.
pub struct RestoreConfirmation {
    id: String,
}

impl RestoreConfirmation {
    pub fn acknowledge_data_loss(handle: &SnapshotHandle) -> Self {
        Self {
            id: handle.id.clone(),
        }
    }
}

/// How a failed migration's automatic restore ended, carried inside
/// `ApplyFailed` so the operator sees both failures in one report.
#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    NotAttempted,
    Restored { handle: String },
    RestoreFailed { handle: String, error: String },
}

impl std::fmt::Display for RestoreOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreOutcome::NotAttempted => f.write_str(
                "no snapshot was taken, the schema is as the failure left it and requires manual inspection",
            ),
            RestoreOutcome::Restored { handle } => {
                write!(f, "database restored from snapshot `{handle}`")
            }
            RestoreOutcome::RestoreFailed { handle, error } => write!(
                f,
                "restore from snapshot `{handle}` failed ({error}), manual intervention required"
            ),
        }
    }
}

/// Creates and restores snapshots for one database file.
pub struct BackupManager {
    database_path: PathBuf,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(database_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Snapshot the database, or just the given tables when the blast
    /// radius is bounded. Runs alongside read traffic; only other
    /// migration runs are excluded, by the runner's advisory lock.
    pub async fn snapshot(
        &self,
        conn: &mut SqliteConnection,
        scope: SnapshotScope,
    ) -> Result<SnapshotHandle> {
        std::fs::create_dir_all(&self.backup_dir)?;

        let id = Ulid::new().to_string();
        let part = self.backup_dir.join(format!("{id}.db.part"));
        let artifact = self.backup_dir.join(format!("{id}.db"));
        let manifest = self.backup_dir.join(format!("{id}.json"));

        debug!(id, ?scope, "writing snapshot");

        let written = match &scope {
            SnapshotScope::Database => self.snapshot_database(conn, &part).await,
            SnapshotScope::Tables(tables) => self.snapshot_tables(conn, tables, &part).await,
        };

        if let Err(err) = written {
            let _ = std::fs::remove_file(&part);
            return Err(match err {
                Error::BackupFailed(message) => Error::BackupFailed(message),
                other => Error::BackupFailed(other.to_string()),
            });
        }

        let handle = SnapshotHandle {
            id: id.clone(),
            created_at: Utc::now(),
            scope,
            path: artifact.clone(),
        };

        // Manifest first, artifact rename last: a handle is only valid
        // once both files exist under their final names.
        let committed = std::fs::write(&manifest, serde_json::to_vec_pretty(&handle)?)
            .map_err(Error::from)
            .and_then(|()| std::fs::rename(&part, &artifact).map_err(Error::from));

        if let Err(err) = committed {
            let _ = std::fs::remove_file(&part);
            let _ = std::fs::remove_file(&manifest);
            return Err(Error::BackupFailed(err.to_string()));
        }

        info!(id, path = %artifact.display(), "snapshot complete");

        Ok(handle)
    }

    async fn snapshot_database(&self, conn: &mut SqliteConnection, part: &Path) -> Result<()> {
        let sql = format!("VACUUM INTO {}", quote_literal(&part.to_string_lossy()));
        sqlx::query(&sql).execute(&mut *conn).await?;

        Ok(())
    }

    async fn snapshot_tables(
        &self,
        conn: &mut SqliteConnection,
        tables: &[String],
        part: &Path,
    ) -> Result<()> {
        if tables.is_empty() {
            return Err(Error::BackupFailed("empty table scope".to_owned()));
        }

        // Collect DDL from the live database up front so the artifact
        // connection only replays statements.
        let mut creates = Vec::with_capacity(tables.len());

        for table in tables {
            let Some(sql) = schema::table_sql(conn, table).await? else {
                return Err(Error::BackupFailed(format!(
                    "table `{table}` does not exist"
                )));
            };

            let indexes = schema::index_statements(conn, table).await?;
            creates.push((table.clone(), sql, indexes));
        }

        let options = SqliteConnectOptions::new()
            .filename(part)
            .create_if_missing(true)
            .foreign_keys(false);

        let mut artifact = SqliteConnection::connect_with(&options).await?;

        let attach = format!(
            "ATTACH DATABASE {} AS src",
            quote_literal(&self.database_path.to_string_lossy())
        );
        sqlx::query(&attach).execute(&mut artifact).await?;

        for (table, create, indexes) in &creates {
            sqlx::query(create).execute(&mut artifact).await?;

            let copy = format!(
                "INSERT INTO {name} SELECT * FROM src.{name}",
                name = quote_ident(table)
            );
            sqlx::query(&copy).execute(&mut artifact).await?;

            for index in indexes {
                sqlx::query(index).execute(&mut artifact).await?;
            }
        }

        sqlx::query("DETACH DATABASE src")
            .execute(&mut artifact)
            .await?;
        artifact.close().await?;

        Ok(())
    }

    /// Replace the covered tables with the snapshot's contents.
    ///
    /// The copy-back runs in one transaction on the live connection, so
    /// a failed restore leaves the database exactly as it was. The
    /// advisory lock row is never restored; lock state belongs to the
    /// live run, not to data.
    pub async fn restore(
        &self,
        conn: &mut SqliteConnection,
        handle: &SnapshotHandle,
        confirmation: RestoreConfirmation,
    ) -> Result<()> {
        if confirmation.id != handle.id {
            return Err(Error::RestoreBlocked(format!(
                "confirmation token was minted for snapshot `{}`, not `{}`",
                confirmation.id, handle.id
            )));
        }

        if !handle.path.is_file() {
            return Err(Error::RestoreBlocked(format!(
                "snapshot artifact `{}` is missing",
                handle.path.display()
            )));
        }

        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;

        let attach = format!(
            "ATTACH DATABASE {} AS snap",
            quote_literal(&handle.path.to_string_lossy())
        );
        sqlx::query(&attach).execute(&mut *conn).await?;

        let outcome = self.copy_back(conn, handle).await;

        // Detach and re-enable enforcement whether or not the copy
        // succeeded; both are outside any transaction by now.
        if let Err(err) = sqlx::query("DETACH DATABASE snap").execute(&mut *conn).await {
            warn!(error = %err, "could not detach snapshot database");
        }

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await?;

        match outcome {
            Ok(()) => {
                info!(id = handle.id, "restore complete");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn copy_back(&self, conn: &mut SqliteConnection, handle: &SnapshotHandle) -> Result<()> {
        let snapshot_tables = self.snapshot_tables_present(conn).await?;

        let replace: Vec<String> = match &handle.scope {
            SnapshotScope::Tables(tables) => tables.clone(),
            // Whole-database restores also rewind the revision store,
            // but never the advisory lock row.
            SnapshotScope::Database => snapshot_tables.clone(),
        };

        let mut txn = conn.begin().await?;

        if matches!(handle.scope, SnapshotScope::Database) {
            // Tables created after the snapshot have no counterpart in
            // the artifact and would survive the rewind; drop them.
            for table in schema::user_tables(&mut *txn).await? {
                if !snapshot_tables.contains(&table) {
                    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&table));
                    sqlx::query(&sql).execute(&mut *txn).await?;
                }
            }
        }

        for table in &replace {
            if !snapshot_tables.contains(table) {
                return Err(Error::RestoreBlocked(format!(
                    "snapshot does not contain table `{table}`"
                )));
            }

            let drop = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
            sqlx::query(&drop).execute(&mut *txn).await?;

            let Some(create) = attached_object_sql(&mut txn, "table", table).await? else {
                return Err(Error::RestoreBlocked(format!(
                    "snapshot has no DDL for table `{table}`"
                )));
            };

            sqlx::query(&create).execute(&mut *txn).await?;

            let copy = format!(
                "INSERT INTO {name} SELECT * FROM snap.{name}",
                name = quote_ident(table)
            );
            sqlx::query(&copy).execute(&mut *txn).await?;

            for index in attached_index_statements(&mut txn, table).await? {
                sqlx::query(&index).execute(&mut *txn).await?;
            }
        }

        txn.commit().await?;

        Ok(())
    }

    /// Tables stored inside the attached snapshot, lock row excluded.
    async fn snapshot_tables_present(&self, conn: &mut SqliteConnection) -> Result<Vec<String>> {
        let statement = Query::select()
            .column(Alias::new("name"))
            .from((Alias::new("snap"), Alias::new("sqlite_master")))
            .and_where(Expr::col(Alias::new("type")).eq("table"))
            .order_by(Alias::new("name"), Order::Asc)
            .to_owned();

        let (sql, values) = build_sqlx(&statement);

        let rows = sqlx::query_as_with::<_, (String,), _>(&sql, values)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(name,)| name)
            .filter(|name| !name.starts_with("sqlite_") && name != "strata_lock")
            .collect())
    }

    /// Load a handle by id from its manifest.
    pub fn load(&self, id: &str) -> Result<SnapshotHandle> {
        let manifest = self.backup_dir.join(format!("{id}.json"));

        let content = std::fs::read_to_string(&manifest).map_err(|_| {
            Error::RestoreBlocked(format!(
                "no snapshot `{id}` under {}",
                self.backup_dir.display()
            ))
        })?;

        let handle: SnapshotHandle = serde_json::from_str(&content)?;

        if !handle.path.is_file() {
            return Err(Error::RestoreBlocked(format!(
                "snapshot artifact `{}` is missing",
                handle.path.display()
            )));
        }

        Ok(handle)
    }

    /// All snapshots with an intact artifact, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotHandle>> {
        let mut handles = Vec::new();

        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(handles),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let path = entry?.path();

            if path.extension().is_some_and(|ext| ext == "json") {
                let content = std::fs::read_to_string(&path)?;

                match serde_json::from_str::<SnapshotHandle>(&content) {
                    Ok(handle) if handle.path.is_file() => handles.push(handle),
                    Ok(handle) => {
                        warn!(id = handle.id, "snapshot manifest without artifact, skipping")
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "unreadable manifest"),
                }
            }
        }

        handles.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(handles)
    }
}

async fn attached_object_sql(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    kind: &str,
    name: &str,
) -> Result<Option<String>> {
    let statement = Query::select()
        .column(Alias::new("sql"))
        .from((Alias::new("snap"), Alias::new("sqlite_master")))
        .and_where(Expr::col(Alias::new("type")).eq(kind))
        .and_where(Expr::col(Alias::new("name")).eq(name))
        .limit(1)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let row = sqlx::query_as_with::<_, (Option<String>,), _>(&sql, values)
        .fetch_optional(&mut **txn)
        .await?;

    Ok(row.and_then(|(sql,)| sql))
}

async fn attached_index_statements(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
) -> Result<Vec<String>> {
    let statement = Query::select()
        .columns([Alias::new("name"), Alias::new("sql")])
        .from((Alias::new("snap"), Alias::new("sqlite_master")))
        .and_where(Expr::col(Alias::new("type")).eq("index"))
        .and_where(Expr::col(Alias::new("tbl_name")).eq(table))
        .order_by(Alias::new("name"), Order::Asc)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let rows = sqlx::query_as_with::<_, (String, Option<String>), _>(&sql, values)
        .fetch_all(&mut **txn)
        .await?;

    Ok(rows
        .into_iter()
        .filter(|(name, _)| !name.starts_with("sqlite_"))
        .filter_map(|(_, sql)| sql)
        .collect())
}

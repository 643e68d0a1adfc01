//! Revision bookkeeping inside the target database.
//!
//! `strata_revision` holds the current head rows, `strata_revision_log`
//! is an append-only audit trail. Every mutation here runs in its own
//! transaction: recording a revision is the final atomic step of a
//! migration, deliberately separate from the apply transaction so that
//! a crash in between is detectable at next startup instead of being
//! silently absorbed.

use chrono::{DateTime, Utc};
use sea_query::{Expr, ExprTrait, OnConflict, Order, Query};
use sqlx::{Connection, SqliteConnection};
use strata_core::{Revision, RevisionId};

use crate::error::{Error, Result};
use crate::sql::{
    build_ddl, build_sqlx, create_revision_log_table, create_revision_table, StrataRevision,
    StrataRevisionLog,
};

/// What kind of transition a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    /// Operator override: the store was pointed at a revision without
    /// running any operations.
    Stamp,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Stamp => "stamp",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "stamp" => Some(Direction::Stamp),
            _ => None,
        }
    }
}

/// One current head row of the revision store.
#[derive(Debug, Clone)]
pub struct AppliedRevision {
    pub revision: RevisionId,
    pub label: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// One row of the audit trail.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub revision: RevisionId,
    pub direction: Direction,
    pub label: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

pub(crate) async fn init(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(&build_ddl(&create_revision_table()))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&build_ddl(&create_revision_log_table()))
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Current head rows, ordered by revision id. At rest this is zero or
/// one row; more than one means divergent history was recorded.
pub(crate) async fn heads(conn: &mut SqliteConnection) -> Result<Vec<AppliedRevision>> {
    let statement = Query::select()
        .columns([
            StrataRevision::Revision,
            StrataRevision::Label,
            StrataRevision::Checksum,
            StrataRevision::AppliedAt,
        ])
        .from(StrataRevision::Table)
        .order_by(StrataRevision::Revision, Order::Asc)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let rows =
        sqlx::query_as_with::<_, (String, String, String, DateTime<Utc>), _>(&sql, values)
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(revision, label, checksum, applied_at)| AppliedRevision {
            revision: RevisionId::new(revision),
            label,
            checksum,
            applied_at,
        })
        .collect())
}

/// Record a successful upgrade: the migration's parents stop being
/// heads, the migration becomes one, and the trail gets an `up` entry.
/// One transaction, so the store can never hold a half-recorded state.
pub(crate) async fn record_applied(
    conn: &mut SqliteConnection,
    revision: &Revision,
    checksum: &str,
) -> Result<()> {
    let now = Utc::now();
    let mut txn = conn.begin().await?;

    if !revision.parents.is_empty() {
        let statement = Query::delete()
            .from_table(StrataRevision::Table)
            .and_where(
                Expr::col(StrataRevision::Revision)
                    .is_in(revision.parents.iter().map(|parent| parent.as_str())),
            )
            .to_owned();

        let (sql, values) = build_sqlx(&statement);
        sqlx::query_with(&sql, values).execute(&mut *txn).await?;
    }

    let statement = Query::insert()
        .into_table(StrataRevision::Table)
        .columns([
            StrataRevision::Revision,
            StrataRevision::Label,
            StrataRevision::Checksum,
            StrataRevision::AppliedAt,
        ])
        .values_panic([
            revision.id.as_str().into(),
            revision.label.as_str().into(),
            checksum.into(),
            now.into(),
        ])
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    sqlx::query_with(&sql, values).execute(&mut *txn).await?;

    log_transition(&mut txn, &revision.id, Direction::Up, &revision.label, checksum, now).await?;

    txn.commit().await?;

    Ok(())
}

/// Record a successful downgrade: the reverted revision stops being a
/// head and each of its parents is reinstated. Reverting a merge
/// revision reinstates both parents, which `status` will then flag as
/// divergent until the remaining branch is also walked back.
pub(crate) async fn record_reverted(
    conn: &mut SqliteConnection,
    reverted: &Revision,
    parents: &[Revision],
    checksum: &str,
) -> Result<()> {
    let now = Utc::now();
    let mut txn = conn.begin().await?;

    let statement = Query::delete()
        .from_table(StrataRevision::Table)
        .and_where(Expr::col(StrataRevision::Revision).eq(reverted.id.as_str()))
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    sqlx::query_with(&sql, values).execute(&mut *txn).await?;

    for parent in parents {
        let statement = Query::insert()
            .into_table(StrataRevision::Table)
            .columns([
                StrataRevision::Revision,
                StrataRevision::Label,
                StrataRevision::Checksum,
                StrataRevision::AppliedAt,
            ])
            .values_panic([
                parent.id.as_str().into(),
                parent.label.as_str().into(),
                checksum.into(),
                now.into(),
            ])
            .on_conflict(
                OnConflict::column(StrataRevision::Revision)
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();

        let (sql, values) = build_sqlx(&statement);
        sqlx::query_with(&sql, values).execute(&mut *txn).await?;
    }

    log_transition(&mut txn, &reverted.id, Direction::Down, &reverted.label, checksum, now)
        .await?;

    txn.commit().await?;

    Ok(())
}

/// Operator override for reconciliation: replace whatever the store
/// says with the given revision (or the unmigrated state) without
/// running any operations.
pub(crate) async fn stamp(
    conn: &mut SqliteConnection,
    revision: Option<&Revision>,
    checksum: &str,
) -> Result<()> {
    let now = Utc::now();
    let mut txn = conn.begin().await?;

    let statement = Query::delete()
        .from_table(StrataRevision::Table)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    sqlx::query_with(&sql, values).execute(&mut *txn).await?;

    let (id, label) = match revision {
        Some(revision) => {
            let statement = Query::insert()
                .into_table(StrataRevision::Table)
                .columns([
                    StrataRevision::Revision,
                    StrataRevision::Label,
                    StrataRevision::Checksum,
                    StrataRevision::AppliedAt,
                ])
                .values_panic([
                    revision.id.as_str().into(),
                    revision.label.as_str().into(),
                    checksum.into(),
                    now.into(),
                ])
                .to_owned();

            let (sql, values) = build_sqlx(&statement);
            sqlx::query_with(&sql, values).execute(&mut *txn).await?;

            (revision.id.clone(), revision.label.clone())
        }
        None => (RevisionId::new("unmigrated"), "unmigrated".to_owned()),
    };

    log_transition(&mut txn, &id, Direction::Stamp, &label, checksum, now).await?;

    txn.commit().await?;

    Ok(())
}

/// Audit trail, most recent first.
pub(crate) async fn history(
    conn: &mut SqliteConnection,
    limit: Option<u64>,
) -> Result<Vec<LogEntry>> {
    let mut statement = Query::select()
        .columns([
            StrataRevisionLog::Id,
            StrataRevisionLog::Revision,
            StrataRevisionLog::Direction,
            StrataRevisionLog::Label,
            StrataRevisionLog::Checksum,
            StrataRevisionLog::AppliedAt,
        ])
        .from(StrataRevisionLog::Table)
        .order_by(StrataRevisionLog::Id, Order::Desc)
        .to_owned();

    if let Some(limit) = limit {
        statement.limit(limit);
    }

    let (sql, values) = build_sqlx(&statement);

    let rows = sqlx::query_as_with::<
        _,
        (i64, String, String, String, String, DateTime<Utc>),
        _,
    >(&sql, values)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(id, revision, direction, label, checksum, applied_at)| {
            let direction = Direction::from_str(&direction).ok_or_else(|| {
                Error::Sqlx(sqlx::Error::Decode(
                    format!("unknown log direction `{direction}`").into(),
                ))
            })?;

            Ok(LogEntry {
                id,
                revision: RevisionId::new(revision),
                direction,
                label,
                checksum,
                applied_at,
            })
        })
        .collect()
}

async fn log_transition(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    revision: &RevisionId,
    direction: Direction,
    label: &str,
    checksum: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let statement = Query::insert()
        .into_table(StrataRevisionLog::Table)
        .columns([
            StrataRevisionLog::Revision,
            StrataRevisionLog::Direction,
            StrataRevisionLog::Label,
            StrataRevisionLog::Checksum,
            StrataRevisionLog::AppliedAt,
        ])
        .values_panic([
            revision.as_str().into(),
            direction.as_str().into(),
            label.into(),
            checksum.into(),
            at.into(),
        ])
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    sqlx::query_with(&sql, values).execute(&mut **txn).await?;

    Ok(())
}

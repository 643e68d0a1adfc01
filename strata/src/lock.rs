//! Exclusive advisory lock scoped to the target database.
//!
//! The lock is a single guarded row inside the database itself, so it
//! fences out other processes and other machines, not just other tasks
//! in this process. Acquisition is a compare-and-set style `UPDATE` and
//! never blocks: a second runner fails fast with `MigrationInProgress`.

use chrono::{DateTime, Utc};
use sea_query::{Expr, ExprTrait, OnConflict, Query};
use sqlx::SqliteConnection;
use tracing::warn;

use crate::error::{Error, Result};
use crate::sql::{build_ddl, build_sqlx, create_lock_table, StrataLock};

pub(crate) async fn init(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(&build_ddl(&create_lock_table()))
        .execute(&mut *conn)
        .await?;

    let statement = Query::insert()
        .into_table(StrataLock::Table)
        .columns([StrataLock::Id, StrataLock::LockedBy, StrataLock::LockedAt])
        .values_panic([
            1.into(),
            Option::<String>::None.into(),
            Option::<DateTime<Utc>>::None.into(),
        ])
        .on_conflict(OnConflict::column(StrataLock::Id).do_nothing().to_owned())
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    Ok(())
}

/// Take the lock or fail fast with the current holder.
pub(crate) async fn acquire(conn: &mut SqliteConnection, owner: &str) -> Result<()> {
    // Two attempts: the second one covers the race where the holder
    // releases between our failed update and the holder read.
    for _ in 0..2 {
        let statement = Query::update()
            .table(StrataLock::Table)
            .values([
                (StrataLock::LockedBy, owner.into()),
                (StrataLock::LockedAt, Utc::now().into()),
            ])
            .and_where(Expr::col(StrataLock::Id).eq(1))
            .and_where(Expr::col(StrataLock::LockedBy).is_null())
            .to_owned();

        let (sql, values) = build_sqlx(&statement);
        let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        if let Some((held_by, since)) = holder(conn).await? {
            return Err(Error::MigrationInProgress { held_by, since });
        }
    }

    Err(Error::MigrationInProgress {
        held_by: "unknown".to_owned(),
        since: Utc::now(),
    })
}

/// Release the lock held by `owner`. A no-op release is logged rather
/// than failed: the run it would fail already succeeded, and the lock
/// state says an operator force-released in the meantime.
pub(crate) async fn release(conn: &mut SqliteConnection, owner: &str) -> Result<()> {
    let statement = Query::update()
        .table(StrataLock::Table)
        .values([
            (StrataLock::LockedBy, Option::<String>::None.into()),
            (StrataLock::LockedAt, Option::<DateTime<Utc>>::None.into()),
        ])
        .and_where(Expr::col(StrataLock::Id).eq(1))
        .and_where(Expr::col(StrataLock::LockedBy).eq(owner))
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    if result.rows_affected() == 0 {
        warn!(owner, "lock was not held at release time");
    }

    Ok(())
}

/// Clear the lock regardless of holder. For operator recovery after a
/// crashed run left the lock behind. Returns whether it was held.
pub(crate) async fn force_release(conn: &mut SqliteConnection) -> Result<bool> {
    let statement = Query::update()
        .table(StrataLock::Table)
        .values([
            (StrataLock::LockedBy, Option::<String>::None.into()),
            (StrataLock::LockedAt, Option::<DateTime<Utc>>::None.into()),
        ])
        .and_where(Expr::col(StrataLock::Id).eq(1))
        .and_where(Expr::col(StrataLock::LockedBy).is_not_null())
        .to_owned();

    let (sql, values) = build_sqlx(&statement);
    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    Ok(result.rows_affected() > 0)
}

/// Current holder and acquisition time, if the lock is taken.
pub(crate) async fn holder(
    conn: &mut SqliteConnection,
) -> Result<Option<(String, DateTime<Utc>)>> {
    let statement = Query::select()
        .columns([StrataLock::LockedBy, StrataLock::LockedAt])
        .from(StrataLock::Table)
        .and_where(Expr::col(StrataLock::Id).eq(1))
        .and_where(Expr::col(StrataLock::LockedBy).is_not_null())
        .limit(1)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let row = sqlx::query_as_with::<_, (String, Option<DateTime<Utc>>), _>(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|(held_by, since)| (held_by, since.unwrap_or_else(Utc::now))))
}

/// Lock holder label for this process when none is configured.
pub(crate) fn default_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_owned());
    format!("{host}:{}", std::process::id())
}

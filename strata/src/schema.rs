//! Live-schema introspection over `sqlite_master`.
//!
//! Everything the engine knows about the observed schema comes from
//! here: which user tables exist, their DDL readback, and the SHA-256
//! fingerprint used for startup reconciliation. Engine bookkeeping
//! tables and in-flight rebuild artifacts are never part of the user
//! schema.

use sea_query::{Alias, Expr, ExprTrait, Order, Query};
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::rebuild::{DISPLACED_SUFFIX, SHADOW_SUFFIX};
use crate::sql::{build_sqlx, quote_ident};

/// Table prefix reserved for the engine's own bookkeeping.
pub(crate) const ENGINE_PREFIX: &str = "strata_";

/// One row of `sqlite_master`: object kind, name, owning table, DDL.
#[derive(Debug, Clone)]
pub(crate) struct SchemaObject {
    pub kind: String,
    pub name: String,
    pub table: String,
    pub sql: Option<String>,
}

fn is_user_object(name: &str, table: &str) -> bool {
    for candidate in [name, table] {
        if candidate.starts_with("sqlite_")
            || candidate.starts_with(ENGINE_PREFIX)
            || candidate.ends_with(SHADOW_SUFFIX)
            || candidate.ends_with(DISPLACED_SUFFIX)
        {
            return false;
        }
    }

    true
}

/// Every user-owned schema object, ordered by `(type, name)` so the
/// result is stable across connections.
pub(crate) async fn user_objects(conn: &mut SqliteConnection) -> Result<Vec<SchemaObject>> {
    let statement = Query::select()
        .columns([
            Alias::new("type"),
            Alias::new("name"),
            Alias::new("tbl_name"),
            Alias::new("sql"),
        ])
        .from(Alias::new("sqlite_master"))
        .order_by(Alias::new("type"), Order::Asc)
        .order_by(Alias::new("name"), Order::Asc)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let rows = sqlx::query_as_with::<_, (String, String, String, Option<String>), _>(&sql, values)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .filter(|(_, name, table, _)| is_user_object(name, table))
        .map(|(kind, name, table, sql)| SchemaObject {
            kind,
            name,
            table,
            sql,
        })
        .collect())
}

/// Names of all user tables, in name order.
pub(crate) async fn user_tables(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    Ok(user_objects(conn)
        .await?
        .into_iter()
        .filter(|object| object.kind == "table")
        .map(|object| object.name)
        .collect())
}

pub(crate) async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    Ok(object_sql(conn, "table", name).await?.is_some())
}

pub(crate) async fn index_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    Ok(object_sql(conn, "index", name).await?.is_some())
}

/// Reports false for a missing table as well as a missing column.
pub(crate) async fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<bool> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));

    let rows = sqlx::query_as::<_, (i64, String, String, i64, Option<String>, i64)>(&sql)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows.into_iter().any(|(_, name, ..)| name == column))
}

/// DDL readback for one table, as SQLite stores it.
pub(crate) async fn table_sql(conn: &mut SqliteConnection, name: &str) -> Result<Option<String>> {
    object_sql(conn, "table", name).await
}

async fn object_sql(
    conn: &mut SqliteConnection,
    kind: &str,
    name: &str,
) -> Result<Option<String>> {
    let statement = Query::select()
        .column(Alias::new("sql"))
        .from(Alias::new("sqlite_master"))
        .and_where(Expr::col(Alias::new("type")).eq(kind))
        .and_where(Expr::col(Alias::new("name")).eq(name))
        .limit(1)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let row = sqlx::query_as_with::<_, (Option<String>,), _>(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|(sql,)| sql.unwrap_or_default()))
}

/// `CREATE INDEX` statements for the user indexes of one table.
/// Auto-created indexes have no stored DDL and are skipped; SQLite
/// recreates those with the table's constraints.
pub(crate) async fn index_statements(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>> {
    let statement = Query::select()
        .columns([Alias::new("name"), Alias::new("sql")])
        .from(Alias::new("sqlite_master"))
        .and_where(Expr::col(Alias::new("type")).eq("index"))
        .and_where(Expr::col(Alias::new("tbl_name")).eq(table))
        .order_by(Alias::new("name"), Order::Asc)
        .to_owned();

    let (sql, values) = build_sqlx(&statement);

    let rows = sqlx::query_as_with::<_, (String, Option<String>), _>(&sql, values)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .filter(|(name, _)| !name.starts_with("sqlite_"))
        .filter_map(|(_, sql)| sql)
        .collect())
}

/// SHA-256 fingerprint of the user schema.
///
/// Hashes the `(type, name, tbl_name, sql)` rows of every user object in
/// a stable order, so two databases with structurally identical user
/// schemas produce the same value regardless of what the engine's own
/// tables or any snapshot history look like.
pub async fn checksum(conn: &mut SqliteConnection) -> Result<String> {
    let mut hasher = Sha256::new();

    for object in user_objects(conn).await? {
        hasher.update(object.kind.as_bytes());
        hasher.update([0]);
        hasher.update(object.name.as_bytes());
        hasher.update([0]);
        hasher.update(object.table.as_bytes());
        hasher.update([0]);
        hasher.update(object.sql.as_deref().unwrap_or_default().as_bytes());
        hasher.update([b'\n']);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Checksum of an empty user schema, what an unmigrated database is
/// expected to hash to.
pub(crate) fn empty_checksum() -> String {
    format!("{:x}", Sha256::new().finalize())
}

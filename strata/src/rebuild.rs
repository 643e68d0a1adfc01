//! Shadow-table rebuild for constraint changes SQLite cannot ALTER in
//! place, the canonical case being a changed `ON DELETE` action on an
//! existing foreign key.
//!
//! The sequence is: create a shadow table with the target schema, copy
//! rows over in bounded batches, then swap the shadow in under one
//! transaction that renames the original aside, verifies row count and
//! constraint satisfaction, drops the displaced original and recreates
//! its indexes on the rebuilt table.
//! Rows violating the target constraints are never dropped silently:
//! they are excluded from the copy and reported, or they abort the
//! rebuild, depending on the spec's orphan disposition.
//!
//! A crash between copy and swap leaves the shadow table behind; the
//! next run detects it by its naming convention, discards it and starts
//! over, so rows are never duplicated. The swap itself is transactional
//! and either happens completely or not at all.

use std::collections::HashSet;

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use strata_core::{OrphanDisposition, RebuildSpec, TableSpec};
use tracing::{debug, info, warn};

use crate::config::StrataConfig;
use crate::ddl;
use crate::error::{Error, Result};
use crate::schema;
use crate::sql::{build_ddl, quote_ident};

/// Name suffix of the in-progress shadow table.
pub(crate) const SHADOW_SUFFIX: &str = "__rebuild";

/// Name suffix the original table carries inside the swap transaction.
pub(crate) const DISPLACED_SUFFIX: &str = "__displaced";

/// Rows of the original table that violate the target constraints.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    /// Exact number of violating rows.
    pub count: u64,
    /// Their rowids, capped at the configured report limit.
    pub rowids: Vec<i64>,
}

/// What a completed rebuild did.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub table: String,
    pub rows_copied: u64,
    pub orphans: OrphanReport,
}

/// Rebuild one table into the target shape.
///
/// Failure at any step leaves the original table untouched; the shadow
/// is dropped during cleanup.
pub(crate) async fn execute(
    conn: &mut SqliteConnection,
    spec: &RebuildSpec,
    config: &StrataConfig,
) -> Result<RebuildReport> {
    let table = spec.table.name.as_str();
    let shadow = format!("{table}{SHADOW_SUFFIX}");

    if !schema::table_exists(conn, table).await? {
        return Err(Error::Rebuild(format!(
            "table `{table}` does not exist"
        )));
    }

    if schema::table_exists(conn, &shadow).await? {
        warn!(table, shadow, "discarding stale shadow table from an interrupted rebuild");
        let sql = format!("DROP TABLE {}", quote_ident(&shadow));
        sqlx::query(&sql).execute(&mut *conn).await?;
    }

    let create = build_ddl(&ddl::create_table_named(&spec.table, &shadow));
    sqlx::query(&create).execute(&mut *conn).await?;

    match run(conn, spec, &shadow, config).await {
        Ok(report) => Ok(report),
        Err(err) => {
            let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&shadow));
            let _ = sqlx::query(&sql).execute(&mut *conn).await;
            Err(err)
        }
    }
}

async fn run(
    conn: &mut SqliteConnection,
    spec: &RebuildSpec,
    shadow: &str,
    config: &StrataConfig,
) -> Result<RebuildReport> {
    let table = spec.table.name.as_str();

    let columns = copy_columns(conn, &spec.table).await?;
    let indexes = schema::index_statements(conn, table).await?;
    let valid = valid_predicate(&spec.table);

    let orphans = scan_orphans(conn, table, valid.as_deref(), config.orphan_report_limit).await?;

    if orphans.count > 0 && spec.orphans == OrphanDisposition::Fail {
        return Err(Error::Rebuild(format!(
            "{} rows of `{table}` violate the target constraints and the rebuild is set to fail on orphans (rowids {:?}{})",
            orphans.count,
            orphans.rowids,
            if (orphans.rowids.len() as u64) < orphans.count { ", list truncated" } else { "" },
        )));
    }

    let rows_copied = copy_rows(
        conn,
        table,
        shadow,
        &columns,
        valid.as_deref(),
        config.batch_size,
    )
    .await?;

    swap_and_verify(conn, table, shadow, rows_copied, orphans.count, &indexes).await?;

    info!(table, rows_copied, orphans = orphans.count, "table rebuilt");

    Ok(RebuildReport {
        table: table.to_owned(),
        rows_copied,
        orphans,
    })
}

/// Columns present in both the original table and the target spec, in
/// target order. New columns fill from their defaults, removed columns
/// are left behind.
async fn copy_columns(conn: &mut SqliteConnection, target: &TableSpec) -> Result<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(&target.name));

    let rows = sqlx::query_as::<_, (i64, String, String, i64, Option<String>, i64)>(&sql)
        .fetch_all(&mut *conn)
        .await?;

    let existing: HashSet<String> = rows.into_iter().map(|(_, name, ..)| name).collect();

    let columns: Vec<String> = target
        .columns
        .iter()
        .map(|column| column.name.clone())
        .filter(|name| existing.contains(name))
        .collect();

    if columns.is_empty() {
        return Err(Error::Rebuild(format!(
            "target shape of `{}` shares no columns with the existing table",
            target.name
        )));
    }

    Ok(columns)
}

/// SQL predicate satisfied by rows that meet every target foreign key,
/// `None` when the target declares none. A row with any NULL key column
/// holds no reference, mirroring SQLite's own enforcement.
fn valid_predicate(target: &TableSpec) -> Option<String> {
    if target.foreign_keys.is_empty() {
        return None;
    }

    let table = quote_ident(&target.name);
    let mut clauses = Vec::with_capacity(target.foreign_keys.len());

    for fk in &target.foreign_keys {
        let mut parts: Vec<String> = fk
            .columns
            .iter()
            .map(|column| format!("{table}.{} IS NULL", quote_ident(column)))
            .collect();

        let matches = fk
            .columns
            .iter()
            .zip(&fk.parent_columns)
            .map(|(column, parent)| {
                format!(
                    "fk_parent.{} = {table}.{}",
                    quote_ident(parent),
                    quote_ident(column)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        parts.push(format!(
            "EXISTS (SELECT 1 FROM {} fk_parent WHERE {matches})",
            quote_ident(&fk.parent_table)
        ));

        clauses.push(format!("({})", parts.join(" OR ")));
    }

    Some(clauses.join(" AND "))
}

async fn scan_orphans(
    conn: &mut SqliteConnection,
    table: &str,
    valid: Option<&str>,
    limit: usize,
) -> Result<OrphanReport> {
    let Some(valid) = valid else {
        return Ok(OrphanReport {
            count: 0,
            rowids: Vec::new(),
        });
    };

    let count_sql = format!(
        "SELECT COUNT(*) FROM {} WHERE NOT ({valid})",
        quote_ident(table)
    );
    let (count,): (i64,) = sqlx::query_as(&count_sql).fetch_one(&mut *conn).await?;

    if count == 0 {
        return Ok(OrphanReport {
            count: 0,
            rowids: Vec::new(),
        });
    }

    let ids_sql = format!(
        "SELECT rowid FROM {} WHERE NOT ({valid}) ORDER BY rowid LIMIT {limit}",
        quote_ident(table)
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&ids_sql).fetch_all(&mut *conn).await?;

    debug!(table, count, "rows violating target constraints");

    Ok(OrphanReport {
        count: count as u64,
        rowids: rows.into_iter().map(|(rowid,)| rowid).collect(),
    })
}

/// Copy valid rows into the shadow in rowid order, one transaction per
/// batch so a cancellation or crash loses at most one batch.
async fn copy_rows(
    conn: &mut SqliteConnection,
    table: &str,
    shadow: &str,
    columns: &[String],
    valid: Option<&str>,
    batch_size: u32,
) -> Result<u64> {
    let quoted_table = quote_ident(table);
    let quoted_shadow = quote_ident(shadow);

    let column_list = columns
        .iter()
        .map(|name| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let select_list = columns
        .iter()
        .map(|name| format!("{quoted_table}.{}", quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut copied: u64 = 0;
    let mut last: Option<i64> = None;

    loop {
        // Upper bound of the next window, by rowid. NULL means no rows
        // are left past the last window.
        let boundary_sql = match last {
            None => format!(
                "SELECT MAX(rowid) FROM (SELECT rowid FROM {quoted_table} ORDER BY rowid LIMIT {batch_size})"
            ),
            Some(last) => format!(
                "SELECT MAX(rowid) FROM (SELECT rowid FROM {quoted_table} WHERE rowid > {last} ORDER BY rowid LIMIT {batch_size})"
            ),
        };

        let (upper,): (Option<i64>,) = sqlx::query_as(&boundary_sql).fetch_one(&mut *conn).await?;

        let Some(upper) = upper else {
            break;
        };

        let mut range = match last {
            None => format!("{quoted_table}.rowid <= {upper}"),
            Some(last) => format!("{quoted_table}.rowid > {last} AND {quoted_table}.rowid <= {upper}"),
        };

        if let Some(valid) = valid {
            range = format!("{range} AND {valid}");
        }

        let copy_sql = format!(
            "INSERT INTO {quoted_shadow} ({column_list}) SELECT {select_list} FROM {quoted_table} WHERE {range}"
        );

        let mut txn = conn.begin().await?;
        let result = sqlx::query(&copy_sql).execute(&mut *txn).await?;
        txn.commit().await?;

        copied += result.rows_affected();
        last = Some(upper);
    }

    Ok(copied)
}

/// Rename the original aside, rename the shadow in, verify, then drop
/// the displaced original and restore its indexes. One transaction: a
/// failed verification rolls the whole swap back.
async fn swap_and_verify(
    conn: &mut SqliteConnection,
    table: &str,
    shadow: &str,
    rows_copied: u64,
    orphan_count: u64,
    indexes: &[String],
) -> Result<()> {
    let displaced = format!("{table}{DISPLACED_SUFFIX}");

    // Renames must not rewrite the foreign key clauses of referencing
    // tables; those clauses name the original table and must still do
    // so once the shadow has taken that name.
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA legacy_alter_table = ON")
        .execute(&mut *conn)
        .await?;

    let swapped = swap(
        conn,
        table,
        shadow,
        &displaced,
        rows_copied,
        orphan_count,
        indexes,
    )
    .await;

    sqlx::query("PRAGMA legacy_alter_table = OFF")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    swapped
}

async fn swap(
    conn: &mut SqliteConnection,
    table: &str,
    shadow: &str,
    displaced: &str,
    rows_copied: u64,
    orphan_count: u64,
    indexes: &[String],
) -> Result<()> {
    let mut txn = conn.begin().await?;

    let rename_out = build_ddl(&ddl::rename_table(table, displaced));
    sqlx::query(&rename_out).execute(&mut *txn).await?;

    let rename_in = build_ddl(&ddl::rename_table(shadow, table));
    sqlx::query(&rename_in).execute(&mut *txn).await?;

    // The displaced table is frozen inside this transaction, so the
    // count equation catches rows written between copy batches.
    let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(displaced));
    let (original_count,): (i64,) = sqlx::query_as(&count_sql).fetch_one(&mut *txn).await?;

    if original_count as u64 != rows_copied + orphan_count {
        return Err(Error::Rebuild(format!(
            "row count changed during rebuild of `{table}`: {original_count} rows in the original, {rows_copied} copied plus {orphan_count} orphans"
        )));
    }

    let check_sql = format!("PRAGMA foreign_key_check({})", quote_ident(table));
    let violations = sqlx::query(&check_sql).fetch_all(&mut *txn).await?;

    if !violations.is_empty() {
        return Err(Error::Rebuild(format!(
            "{} foreign key violations in the rebuilt `{table}`",
            violations.len()
        )));
    }

    let drop_sql = format!("DROP TABLE {}", quote_ident(displaced));
    sqlx::query(&drop_sql).execute(&mut *txn).await?;

    // The original's indexes went down with the displaced table. Index
    // names are database-global, so recreating them must follow the
    // drop. An index on a column the target shape removed fails here
    // and rolls the whole swap back.
    for index in indexes {
        sqlx::query(index).execute(&mut *txn).await?;
    }

    txn.commit().await?;

    Ok(())
}

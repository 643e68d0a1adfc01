//! Identifiers and statement plumbing for the engine's own tables.
//!
//! The engine keeps its bookkeeping inside the target database so that
//! revision tracking travels with the database it describes. All three
//! tables are prefixed `strata_` and are excluded from schema
//! checksums, backups of user tables, and rebuild planning.

use sea_query::{ColumnDef, Expr, ExprTrait, Iden, SqliteQueryBuilder, Table, TableCreateStatement};
use sea_query_binder::{SqlxBinder, SqlxValues};

/// Column identifiers for the `strata_revision` table.
///
/// Used with sea-query for type-safe SQL query construction.
///
/// One row per current head revision. At rest this table holds exactly
/// one row (or none, for an unmigrated database); more than one row
/// means an unmerged branch was applied and the engine refuses to run.
///
/// # Columns
///
/// - `Revision` - Revision identifier (primary key)
/// - `Label` - Human-readable migration label
/// - `Checksum` - SHA-256 of the user schema right after this revision was recorded
/// - `AppliedAt` - When the revision was recorded
#[derive(Iden, Clone, Copy)]
pub enum StrataRevision {
    /// The table name: `strata_revision`
    Table,
    /// Revision identifier (primary key)
    Revision,
    /// Human-readable label
    Label,
    /// Schema checksum at recording time
    Checksum,
    /// Recording timestamp
    AppliedAt,
}

/// Column identifiers for the `strata_revision_log` table.
///
/// Used with sea-query for type-safe SQL query construction.
///
/// Append-only audit trail of every recorded transition, including
/// downgrades and operator stamps. Never consulted for planning; it
/// exists for `history` output and post-incident review.
///
/// # Columns
///
/// - `Id` - Monotonic row id
/// - `Revision` - Revision the transition recorded
/// - `Direction` - One of `up`, `down`, `stamp`
/// - `Label` - Label at the time of the transition
/// - `Checksum` - Schema checksum right after the transition
/// - `AppliedAt` - When the transition was recorded
#[derive(Iden, Clone, Copy)]
pub enum StrataRevisionLog {
    /// The table name: `strata_revision_log`
    Table,
    /// Monotonic row id
    Id,
    /// Revision identifier
    Revision,
    /// Transition direction: `up`, `down` or `stamp`
    Direction,
    /// Label at transition time
    Label,
    /// Schema checksum after the transition
    Checksum,
    /// Transition timestamp
    AppliedAt,
}

/// Column identifiers for the `strata_lock` table.
///
/// Used with sea-query for type-safe SQL query construction.
///
/// Single-row advisory lock scoped to the database, not the process.
/// Acquisition is a guarded `UPDATE ... WHERE locked_by IS NULL`, so two
/// concurrent runners cannot both win.
#[derive(Iden, Clone, Copy)]
pub enum StrataLock {
    /// The table name: `strata_lock`
    Table,
    /// Always `1`; the table holds exactly one row
    Id,
    /// Holder label, `NULL` when the lock is free
    LockedBy,
    /// When the current holder acquired the lock
    LockedAt,
}

/// Render a DML statement for SQLite with its bind values.
pub(crate) fn build_sqlx<S: SqlxBinder>(statement: &S) -> (String, SqlxValues) {
    statement.build_sqlx(SqliteQueryBuilder)
}

/// Double-quote an identifier for the statements sea-query cannot
/// express (`ATTACH`, `VACUUM INTO`, cross-schema row copies).
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, for file paths in `ATTACH` and
/// `VACUUM INTO`.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a DDL statement for SQLite.
pub(crate) fn build_ddl<S: sea_query::SchemaStatementBuilder>(statement: &S) -> String {
    statement.to_string(SqliteQueryBuilder)
}

pub(crate) fn create_revision_table() -> TableCreateStatement {
    Table::create()
        .table(StrataRevision::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(StrataRevision::Revision)
                .text()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(StrataRevision::Label).text().not_null())
        .col(ColumnDef::new(StrataRevision::Checksum).text().not_null())
        .col(
            ColumnDef::new(StrataRevision::AppliedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
}

pub(crate) fn create_revision_log_table() -> TableCreateStatement {
    Table::create()
        .table(StrataRevisionLog::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(StrataRevisionLog::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(StrataRevisionLog::Revision).text().not_null())
        .col(
            ColumnDef::new(StrataRevisionLog::Direction)
                .text()
                .not_null(),
        )
        .col(ColumnDef::new(StrataRevisionLog::Label).text().not_null())
        .col(ColumnDef::new(StrataRevisionLog::Checksum).text().not_null())
        .col(
            ColumnDef::new(StrataRevisionLog::AppliedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
}

pub(crate) fn create_lock_table() -> TableCreateStatement {
    Table::create()
        .table(StrataLock::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(StrataLock::Id)
                .integer()
                .not_null()
                .primary_key()
                .check(Expr::col(StrataLock::Id).eq(1)),
        )
        .col(ColumnDef::new(StrataLock::LockedBy).text().null())
        .col(
            ColumnDef::new(StrataLock::LockedAt)
                .timestamp_with_time_zone()
                .null(),
        )
        .to_owned()
}

//! Schema migration engine for SQLite: versioned migrations over a
//! revision graph, applied through a four-phase run (validate, back
//! up, apply, record) with reconciliation against the live schema
//! before anything changes.
//!
//! [`Runner`] is the entry point. It borrows one connection per run,
//! holds an advisory lock for the duration, and records every
//! transition in an audit log. The database-free pieces (revisions,
//! the resolver, the validator) live in `strata-core` and are
//! re-exported here.

#![forbid(unsafe_code)]

mod backup;
mod config;
mod ddl;
mod error;
mod lock;
mod rebuild;
mod runner;
mod schema;
mod sql;
mod store;

pub use backup::*;
pub use config::*;
pub use error::*;
pub use rebuild::{OrphanReport, RebuildReport};
pub use runner::*;
pub use schema::checksum;
pub use store::{AppliedRevision, Direction, LogEntry};

pub use strata_core::{
    describe_state, validate, validate_operations, Catalog, ColumnDefault, ColumnSpec, ColumnType,
    DowngradeTarget, Error as CoreError, FileMigration, Finding, FindingKind, ForeignKeyAction,
    ForeignKeySpec, IndexSpec, Migration, Operation, OrphanDisposition, RebuildSpec, Revision,
    RevisionGraph, RevisionId, Risk, TableSpec, Target, TransformSpec, ValidationReport,
};

use chrono::{DateTime, Utc};
use strata_core::RevisionId;

use crate::backup::RestoreOutcome;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    #[error("another migration run holds the lock, held by `{held_by}` since {since}")]
    MigrationInProgress {
        held_by: String,
        since: DateTime<Utc>,
    },

    #[error(
        "recorded revision `{recorded}` expects schema checksum {expected} but the live schema \
         hashes to {observed}; refusing to continue until an operator confirms which state is \
         authoritative (`stamp` records the live schema as a given revision)"
    )]
    ReconciliationMismatch {
        recorded: String,
        expected: String,
        observed: String,
    },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("restore blocked: {0}")]
    RestoreBlocked(String),

    #[error("migration `{revision}` failed while moving `{current}` to `{target}`: {source}; {restore}")]
    ApplyFailed {
        revision: RevisionId,
        current: String,
        target: String,
        source: Box<Error>,
        restore: RestoreOutcome,
    },

    #[error("table rebuild failed: {0}")]
    Rebuild(String),

    #[error("data transform stalled: {0}")]
    TransformStalled(String),

    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

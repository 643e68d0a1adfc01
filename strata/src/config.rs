//! Configuration constants and defaults for the strata engine
//!
//! This module contains the tunable knobs of the engine. Users can
//! customize these values for their specific needs; the defaults are
//! safe for production databases.

use std::path::PathBuf;

/// Default configuration for strata operations
#[derive(Debug, Clone)]
pub struct StrataConfig {
    /// Directory where backup snapshot artifacts are written
    pub backup_dir: PathBuf,

    /// Maximum number of rows copied per batch during a table rebuild
    pub batch_size: u32,

    /// Maximum number of orphan row identifiers listed in a rebuild
    /// report (the count is always exact)
    pub orphan_report_limit: usize,

    /// Label recorded as the advisory-lock holder; defaults to
    /// `hostname:pid` when not set
    pub lock_owner: Option<String>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            orphan_report_limit: DEFAULT_ORPHAN_REPORT_LIMIT,
            lock_owner: None,
        }
    }
}

/// Default directory for backup snapshot artifacts
///
/// Snapshots must live outside the database file itself so that a
/// restore never depends on the state it is repairing. Relative paths
/// are resolved against the working directory of the process.
pub const DEFAULT_BACKUP_DIR: &str = "strata_backups";

/// Default number of rows copied per batch during a table rebuild
///
/// Each batch commits on its own, so a cancellation or crash loses at
/// most one batch of copy progress. Larger values reduce the number of
/// commits but hold the write lock longer per batch.
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

/// Default cap on orphan row identifiers included in a rebuild report
///
/// Rebuilds report every row that violates the target constraints. The
/// exact count is always reported; the identifier list is capped so a
/// pathological table cannot balloon the report.
pub const DEFAULT_ORPHAN_REPORT_LIMIT: usize = 100;

/// Configuration builder for customizing strata behavior
#[derive(Debug)]
pub struct ConfigBuilder {
    config: StrataConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder with default values
    pub fn new() -> Self {
        Self {
            config: StrataConfig::default(),
        }
    }

    /// Set the directory where snapshot artifacts are written
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.backup_dir = dir.into();
        self
    }

    /// Set the maximum number of rows copied per rebuild batch
    pub fn batch_size(mut self, size: u32) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the cap on orphan identifiers listed in rebuild reports
    pub fn orphan_report_limit(mut self, limit: usize) -> Self {
        self.config.orphan_report_limit = limit;
        self
    }

    /// Set the label recorded as the advisory-lock holder
    pub fn lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.config.lock_owner = Some(owner.into());
        self
    }

    /// Build the final configuration
    pub fn build(self) -> StrataConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

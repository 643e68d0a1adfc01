use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Operation, Result, Revision, RevisionId};

/// One step in the revision history.
///
/// A migration declares where it sits in the revision graph and returns
/// the operations that move the schema forward and back as plain data.
/// The engine inspects those operations before running anything, which
/// is what makes pre-flight validation possible without touching the
/// database.
///
/// Implementations are usually either hand-written types or
/// [`FileMigration`] values loaded from JSON.
pub trait Migration: Send + Sync {
    /// Globally unique identifier of this revision.
    fn revision(&self) -> RevisionId;

    /// Revisions this one builds on. Empty for a root migration, more
    /// than one for a merge point of divergent branches.
    fn parents(&self) -> Vec<RevisionId>;

    /// Human-readable one-liner shown in status output.
    fn label(&self) -> String;

    /// Authoring timestamp, used to order siblings deterministically.
    fn created_at(&self) -> DateTime<Utc>;

    /// Operations that apply this revision.
    fn up(&self) -> Vec<Operation>;

    /// Operations that revert this revision, if any.
    fn down(&self) -> Option<Vec<Operation>>;

    /// A migration with no way back cannot be downgraded across.
    fn irreversible(&self) -> bool {
        self.down().map_or(true, |ops| ops.is_empty())
    }

    fn describe(&self) -> Revision {
        Revision {
            id: self.revision(),
            parents: self.parents(),
            label: self.label(),
            created_at: self.created_at(),
        }
    }
}

/// Migration defined as data, typically one JSON file per revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMigration {
    pub id: RevisionId,
    #[serde(default)]
    pub parents: Vec<RevisionId>,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub up: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<Vec<Operation>>,
}

impl FileMigration {
    /// Parse one migration file. Errors name the offending path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        serde_json::from_str(&content)
            .map_err(|err| Error::InvalidCatalog(format!("{}: {err}", path.display())))
    }
}

impl Migration for FileMigration {
    fn revision(&self) -> RevisionId {
        self.id.clone()
    }

    fn parents(&self) -> Vec<RevisionId> {
        self.parents.clone()
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn up(&self) -> Vec<Operation> {
        self.up.clone()
    }

    fn down(&self) -> Option<Vec<Operation>> {
        self.down.clone()
    }
}

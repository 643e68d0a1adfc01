use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Migration, Operation, Result, RevisionId};

/// How much a migration can hurt, worst finding wins.
///
/// The ordering is load-bearing: `Additive < Transformational <
/// Destructive`, and anything above `Additive` gets a snapshot before it
/// runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    /// Only adds structures; existing data cannot be affected.
    Additive,
    /// Rewrites data or rebuilds a table, but removes nothing.
    Transformational,
    /// Drops or narrows existing structures, or adds a constraint that
    /// can fail against existing data.
    Destructive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    TableDrop,
    ColumnDrop,
    NotNullOnExistingData,
    UniqueOnExistingData,
    TableRewrite,
    DataTransform,
    /// Separate axis from risk: the migration declares no way back.
    Irreversible,
}

impl FindingKind {
    /// Risk contributed by this finding, `None` for findings that do not
    /// affect the classification.
    pub fn risk(self) -> Option<Risk> {
        match self {
            FindingKind::TableDrop
            | FindingKind::ColumnDrop
            | FindingKind::NotNullOnExistingData
            | FindingKind::UniqueOnExistingData => Some(Risk::Destructive),
            FindingKind::TableRewrite | FindingKind::DataTransform => {
                Some(Risk::Transformational)
            }
            FindingKind::Irreversible => None,
        }
    }

    /// Whether strict mode turns this finding into a hard failure.
    pub fn blocks_strict(self) -> bool {
        matches!(self.risk(), Some(Risk::Destructive)) || self == FindingKind::Irreversible
    }
}

/// One concrete observation about a migration's operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub detail: String,
}

impl Finding {
    fn new(kind: FindingKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Outcome of pre-flight validation for one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub revision: RevisionId,
    pub label: String,
    pub risk: Risk,
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// Whether strict mode would refuse to run this migration.
    pub fn is_blocking(&self) -> bool {
        self.findings
            .iter()
            .any(|finding| finding.kind.blocks_strict())
    }

    /// Strict-mode gate: error out on any destructive or irreversible
    /// finding, before anything has touched the database.
    pub fn ensure_unblocked(&self) -> Result<()> {
        let blocking = self
            .findings
            .iter()
            .filter(|finding| finding.kind.blocks_strict())
            .map(|finding| finding.detail.as_str())
            .collect::<Vec<_>>();

        if blocking.is_empty() {
            return Ok(());
        }

        Err(Error::ValidationBlocked {
            revision: self.revision.clone(),
            details: blocking.join("; "),
        })
    }
}

/// Classify one migration without touching any database.
///
/// The walk keeps track of tables created earlier in the same operation
/// list: constraints added to a table that does not exist yet cannot
/// fail against existing data, and a `Transform` counts as a backfill
/// for the tables it names, downgrading a later NOT NULL or UNIQUE on
/// those tables from destructive to plain additive.
pub fn validate(migration: &dyn Migration) -> ValidationReport {
    validate_operations(
        migration.revision(),
        migration.label(),
        &migration.up(),
        migration.irreversible(),
    )
}

/// Classify a bare operation list. [`validate`] goes through here with a
/// migration's up operations; the runner also classifies down operations
/// when it plans a downgrade.
pub fn validate_operations(
    revision: RevisionId,
    label: String,
    operations: &[Operation],
    irreversible: bool,
) -> ValidationReport {
    fn covered(
        table: &str,
        created: &HashSet<String>,
        backfilled: &HashSet<String>,
        backfilled_all: bool,
    ) -> bool {
        created.contains(table) || backfilled_all || backfilled.contains(table)
    }

    let mut findings = Vec::new();
    let mut created: HashSet<String> = HashSet::new();
    let mut backfilled: HashSet<String> = HashSet::new();
    let mut backfilled_all = false;

    for operation in operations {
        match operation {
            Operation::CreateTable(spec) => {
                created.insert(spec.name.clone());
            }
            Operation::DropTable { table } => {
                if !created.remove(table) {
                    findings.push(Finding::new(
                        FindingKind::TableDrop,
                        format!("drops table `{table}`"),
                    ));
                }
            }
            Operation::AddColumn { table, column } => {
                if !column.nullable
                    && column.default.is_none()
                    && !covered(table, &created, &backfilled, backfilled_all)
                {
                    findings.push(Finding::new(
                        FindingKind::NotNullOnExistingData,
                        format!(
                            "adds NOT NULL column `{table}.{}` without a default or a prior backfill",
                            column.name
                        ),
                    ));
                }

                if column.unique && !covered(table, &created, &backfilled, backfilled_all) {
                    findings.push(Finding::new(
                        FindingKind::UniqueOnExistingData,
                        format!(
                            "adds UNIQUE column `{table}.{}` that can fail against existing rows",
                            column.name
                        ),
                    ));
                }
            }
            Operation::DropColumn { table, column } => {
                if !created.contains(table) {
                    findings.push(Finding::new(
                        FindingKind::ColumnDrop,
                        format!("drops column `{table}.{column}`"),
                    ));
                }
            }
            Operation::CreateIndex(spec) => {
                if spec.unique && !covered(&spec.table, &created, &backfilled, backfilled_all) {
                    findings.push(Finding::new(
                        FindingKind::UniqueOnExistingData,
                        format!(
                            "creates unique index `{}` on `{}` without a prior cleanup transform",
                            spec.name, spec.table
                        ),
                    ));
                }
            }
            Operation::DropIndex { .. } => {}
            Operation::RebuildTable(spec) => {
                findings.push(Finding::new(
                    FindingKind::TableRewrite,
                    format!(
                        "rebuilds table `{}` to change constraints; rows are copied in bounded batches",
                        spec.table.name
                    ),
                ));
            }
            Operation::Transform(spec) => {
                let scope = if spec.tables.is_empty() {
                    backfilled_all = true;
                    "unbounded scope, whole-database snapshot".to_owned()
                } else {
                    backfilled.extend(spec.tables.iter().cloned());
                    spec.tables.join(", ")
                };

                findings.push(Finding::new(
                    FindingKind::DataTransform,
                    format!("rewrites data ({}): {scope}", spec.description),
                ));
            }
        }
    }

    if irreversible {
        findings.push(Finding::new(
            FindingKind::Irreversible,
            "declares no down operations; this revision cannot be downgraded across",
        ));
    }

    let risk = findings
        .iter()
        .filter_map(|finding| finding.kind.risk())
        .max()
        .unwrap_or(Risk::Additive);

    ValidationReport {
        revision,
        label,
        risk,
        findings,
    }
}

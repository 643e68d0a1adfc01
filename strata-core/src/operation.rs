use std::fmt;

use serde::{Deserialize, Serialize};

/// Column data types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInteger,
    Real,
    Text,
    Boolean,
    Blob,
    Timestamp,
}

/// Literal default value declared on a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    CurrentTimestamp,
}

/// Referential action declared on a foreign key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    #[default]
    NoAction,
    Restrict,
    SetNull,
    Cascade,
}

/// One column of a [`TableSpec`].
///
/// Columns are nullable by default, matching SQL; [`ColumnSpec::not_null`]
/// opts out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ColumnDefault>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }
}

/// Foreign key constraint of a [`TableSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub columns: Vec<String>,
    pub parent_table: String,
    pub parent_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

impl ForeignKeySpec {
    /// Single-column foreign key; use the struct literal form for
    /// composite keys.
    pub fn new(
        column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            columns: vec![column.into()],
            parent_table: parent_table.into(),
            parent_columns: vec![parent_column.into()],
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }
}

/// Full shape of a table: columns plus table-level constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn foreign_key(mut self, foreign_key: ForeignKeySpec) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }
}

/// Secondary index on an existing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// What to do with rows that violate the target constraints of a rebuild.
///
/// Orphans are never dropped silently: `Exclude` leaves them out of the
/// copy and reports every one of them back to the caller, `Fail` aborts
/// the rebuild if any exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanDisposition {
    #[default]
    Exclude,
    Fail,
}

/// Rebuild an existing table into a new shape that in-place ALTER cannot
/// reach, the canonical case being a changed `ON DELETE` action on a
/// foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildSpec {
    /// Target shape of the table, constraints included. The name must
    /// match the existing table.
    pub table: TableSpec,
    #[serde(default)]
    pub orphans: OrphanDisposition,
}

/// Arbitrary data rewrite, executed in bounded batches.
///
/// `statement` runs once per batch and must bound its own write set (for
/// example with a `rowid IN (SELECT ... LIMIT n)` sub-select);
/// `remaining` returns the number of rows still to process and must reach
/// zero. The engine re-runs `statement` until `remaining` is zero, with a
/// commit point after every run, and fails the migration if a run makes
/// no progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub description: String,
    pub statement: String,
    pub remaining: String,
    /// Tables the transform writes, used to scope the pre-migration
    /// snapshot. Empty means the blast radius is unbounded and the whole
    /// database is snapshotted.
    #[serde(default)]
    pub tables: Vec<String>,
}

/// Data-level description of one schema change.
///
/// Operations are plain data so the pre-flight validator can inspect them
/// and so whole migrations can live in JSON files; the engine compiles
/// them to SQL only at apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTable(TableSpec),
    DropTable { table: String },
    AddColumn { table: String, column: ColumnSpec },
    DropColumn { table: String, column: String },
    CreateIndex(IndexSpec),
    DropIndex { name: String, table: String },
    RebuildTable(RebuildSpec),
    Transform(TransformSpec),
}

impl Operation {
    /// Tables this operation writes, or `None` when the blast radius
    /// cannot be bounded.
    pub fn tables_touched(&self) -> Option<Vec<String>> {
        match self {
            Operation::CreateTable(spec) => Some(vec![spec.name.clone()]),
            Operation::DropTable { table } => Some(vec![table.clone()]),
            Operation::AddColumn { table, .. } => Some(vec![table.clone()]),
            Operation::DropColumn { table, .. } => Some(vec![table.clone()]),
            Operation::CreateIndex(spec) => Some(vec![spec.table.clone()]),
            Operation::DropIndex { table, .. } => Some(vec![table.clone()]),
            Operation::RebuildTable(spec) => Some(vec![spec.table.name.clone()]),
            Operation::Transform(spec) => {
                if spec.tables.is_empty() {
                    None
                } else {
                    Some(spec.tables.clone())
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable(spec) => write!(f, "create table `{}`", spec.name),
            Operation::DropTable { table } => write!(f, "drop table `{table}`"),
            Operation::AddColumn { table, column } => {
                write!(f, "add column `{}.{}`", table, column.name)
            }
            Operation::DropColumn { table, column } => {
                write!(f, "drop column `{table}.{column}`")
            }
            Operation::CreateIndex(spec) => {
                if spec.unique {
                    write!(f, "create unique index `{}` on `{}`", spec.name, spec.table)
                } else {
                    write!(f, "create index `{}` on `{}`", spec.name, spec.table)
                }
            }
            Operation::DropIndex { name, table } => {
                write!(f, "drop index `{name}` on `{table}`")
            }
            Operation::RebuildTable(spec) => {
                write!(f, "rebuild table `{}` with new constraints", spec.table.name)
            }
            Operation::Transform(spec) => f.write_str(&spec.description),
        }
    }
}

//! Compiles data-level operations into SQLite DDL.
//!
//! Operations stay plain data right up to apply time; this module is the
//! only place that turns them into SQL text. Rebuilds and transforms are
//! not handled here, they have their own execution paths.

use sea_query::{
    Alias, ColumnDef, Expr, ForeignKey, ForeignKeyCreateStatement, Index, IndexCreateStatement,
    IndexDropStatement, Table, TableAlterStatement, TableCreateStatement, TableDropStatement,
    TableRenameStatement,
};
use strata_core::{
    ColumnDefault, ColumnSpec, ColumnType, ForeignKeyAction, ForeignKeySpec, IndexSpec, Operation,
    TableSpec,
};

use crate::sql::build_ddl;

fn column_def(column: &ColumnSpec) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(&column.name));

    match column.ty {
        ColumnType::Integer => def.integer(),
        ColumnType::BigInteger => def.big_integer(),
        ColumnType::Real => def.double(),
        ColumnType::Text => def.text(),
        ColumnType::Boolean => def.boolean(),
        ColumnType::Blob => def.blob(),
        ColumnType::Timestamp => def.timestamp_with_time_zone(),
    };

    if column.primary_key {
        def.primary_key();
    }

    if column.nullable {
        def.null();
    } else {
        def.not_null();
    }

    if column.unique {
        def.unique_key();
    }

    if let Some(default) = &column.default {
        match default {
            ColumnDefault::Integer(value) => def.default(*value),
            ColumnDefault::Real(value) => def.default(*value),
            ColumnDefault::Text(value) => def.default(value.clone()),
            ColumnDefault::Boolean(value) => def.default(*value),
            ColumnDefault::CurrentTimestamp => def.default(Expr::current_timestamp()),
        };
    }

    def
}

fn referential_action(action: ForeignKeyAction) -> sea_query::ForeignKeyAction {
    match action {
        ForeignKeyAction::NoAction => sea_query::ForeignKeyAction::NoAction,
        ForeignKeyAction::Restrict => sea_query::ForeignKeyAction::Restrict,
        ForeignKeyAction::SetNull => sea_query::ForeignKeyAction::SetNull,
        ForeignKeyAction::Cascade => sea_query::ForeignKeyAction::Cascade,
    }
}

fn foreign_key(table: &str, spec: &ForeignKeySpec) -> ForeignKeyCreateStatement {
    let mut statement = ForeignKey::create();

    statement
        .from_tbl(Alias::new(table))
        .to_tbl(Alias::new(&spec.parent_table))
        .on_delete(referential_action(spec.on_delete))
        .on_update(referential_action(spec.on_update));

    for column in &spec.columns {
        statement.from_col(Alias::new(column));
    }

    for column in &spec.parent_columns {
        statement.to_col(Alias::new(column));
    }

    statement.to_owned()
}

/// `CREATE TABLE` for a spec, under the spec's own name.
pub(crate) fn create_table(spec: &TableSpec) -> TableCreateStatement {
    create_table_named(spec, &spec.name)
}

/// `CREATE TABLE` for a spec under a different name. The rebuild engine
/// uses this to build the shadow table with the target constraints.
pub(crate) fn create_table_named(spec: &TableSpec, name: &str) -> TableCreateStatement {
    let mut statement = Table::create();
    statement.table(Alias::new(name));

    for column in &spec.columns {
        statement.col(&mut column_def(column));
    }

    for spec in &spec.foreign_keys {
        statement.foreign_key(&mut foreign_key(name, spec));
    }

    statement.to_owned()
}

pub(crate) fn drop_table(table: &str) -> TableDropStatement {
    Table::drop().table(Alias::new(table)).to_owned()
}

pub(crate) fn add_column(table: &str, column: &ColumnSpec) -> TableAlterStatement {
    Table::alter()
        .table(Alias::new(table))
        .add_column(&mut column_def(column))
        .to_owned()
}

pub(crate) fn drop_column(table: &str, column: &str) -> TableAlterStatement {
    Table::alter()
        .table(Alias::new(table))
        .drop_column(Alias::new(column))
        .to_owned()
}

pub(crate) fn rename_table(from: &str, to: &str) -> TableRenameStatement {
    Table::rename()
        .table(Alias::new(from), Alias::new(to))
        .to_owned()
}

pub(crate) fn create_index(spec: &IndexSpec) -> IndexCreateStatement {
    let mut statement = Index::create();
    statement.name(&spec.name).table(Alias::new(&spec.table));

    for column in &spec.columns {
        statement.col(Alias::new(column));
    }

    if spec.unique {
        statement.unique();
    }

    statement.to_owned()
}

pub(crate) fn drop_index(name: &str) -> IndexDropStatement {
    Index::drop().name(name).to_owned()
}

/// SQL for the operations that compile to a single statement. Rebuilds
/// and transforms return `None`; they run through their own engines.
pub(crate) fn render(operation: &Operation) -> Option<Vec<String>> {
    let sql = match operation {
        Operation::CreateTable(spec) => build_ddl(&create_table(spec)),
        Operation::DropTable { table } => build_ddl(&drop_table(table)),
        Operation::AddColumn { table, column } => build_ddl(&add_column(table, column)),
        Operation::DropColumn { table, column } => build_ddl(&drop_column(table, column)),
        Operation::CreateIndex(spec) => build_ddl(&create_index(spec)),
        Operation::DropIndex { name, .. } => build_ddl(&drop_index(name)),
        Operation::RebuildTable(_) | Operation::Transform(_) => return None,
    };

    Some(vec![sql])
}

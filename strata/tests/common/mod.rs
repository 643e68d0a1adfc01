use std::path::Path;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use strata::{
    Catalog, ColumnDefault, ColumnSpec, ColumnType, ConfigBuilder, FileMigration,
    ForeignKeyAction, ForeignKeySpec, IndexSpec, Operation, OrphanDisposition, RebuildSpec,
    Runner, StatusReport, TableSpec,
};
use tempfile::TempDir;

/// Fresh runner over a file-backed database in its own temp directory.
///
/// The directory must outlive the pool, so it is handed back to the
/// caller alongside the runner.
pub async fn create_runner(
    name: &str,
    catalog: Catalog,
) -> anyhow::Result<(Runner, SqlitePool, TempDir)> {
    let dir = TempDir::with_prefix(format!("strata_{name}"))?;
    let database = dir.path().join("app.db");
    let pool = create_pool(&database).await?;

    let config = ConfigBuilder::new()
        .backup_dir(dir.path().join("backups"))
        .batch_size(2)
        .lock_owner(format!("test:{name}"))
        .build();

    let runner = Runner::new(pool.clone(), &database, catalog).with_config(config);

    Ok((runner, pool, dir))
}

pub async fn create_pool(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub fn migration(
    id: &str,
    parents: &[&str],
    minute: u32,
    label: &str,
    up: Vec<Operation>,
    down: Option<Vec<Operation>>,
) -> FileMigration {
    FileMigration {
        id: id.into(),
        parents: parents.iter().map(|&parent| parent.into()).collect(),
        label: label.to_owned(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
        up,
        down,
    }
}

pub fn build_catalog(migrations: Vec<FileMigration>) -> anyhow::Result<Catalog> {
    let mut catalog = Catalog::new();

    for migration in migrations {
        catalog.add(Box::new(migration))?;
    }

    Ok(catalog)
}

pub fn projects_table() -> TableSpec {
    TableSpec::new("projects")
        .column(ColumnSpec::new("id", ColumnType::Integer).primary_key())
        .column(ColumnSpec::new("name", ColumnType::Text).not_null())
}

/// The tasks table in both of its historical shapes. `b2` ships it
/// without a foreign key; `c3` rebuilds it with ownership enforced
/// through `ON DELETE CASCADE`.
pub fn tasks_table(owned: bool) -> TableSpec {
    let table = TableSpec::new("tasks")
        .column(ColumnSpec::new("id", ColumnType::Integer).primary_key())
        .column(ColumnSpec::new("project_id", ColumnType::Integer).not_null())
        .column(ColumnSpec::new("title", ColumnType::Text).not_null())
        .column(
            ColumnSpec::new("done", ColumnType::Boolean)
                .not_null()
                .default_value(ColumnDefault::Boolean(false)),
        );

    if owned {
        table.foreign_key(
            ForeignKeySpec::new("project_id", "projects", "id")
                .on_delete(ForeignKeyAction::Cascade),
        )
    } else {
        table
    }
}

/// Three-step history of a small task tracker: create projects, create
/// tasks (no referential integrity yet), then rebuild tasks to enforce
/// ownership.
pub fn app_catalog() -> anyhow::Result<Catalog> {
    app_catalog_with(OrphanDisposition::Exclude)
}

pub fn app_catalog_with(orphans: OrphanDisposition) -> anyhow::Result<Catalog> {
    build_catalog(vec![
        migration(
            "a1",
            &[],
            0,
            "create projects",
            vec![Operation::CreateTable(projects_table())],
            Some(vec![Operation::DropTable {
                table: "projects".to_owned(),
            }]),
        ),
        migration(
            "b2",
            &["a1"],
            1,
            "create tasks",
            vec![
                Operation::CreateTable(tasks_table(false)),
                Operation::CreateIndex(IndexSpec::new(
                    "idx_tasks_project",
                    "tasks",
                    vec!["project_id".to_owned()],
                )),
            ],
            Some(vec![
                Operation::DropIndex {
                    name: "idx_tasks_project".to_owned(),
                    table: "tasks".to_owned(),
                },
                Operation::DropTable {
                    table: "tasks".to_owned(),
                },
            ]),
        ),
        migration(
            "c3",
            &["b2"],
            2,
            "enforce task ownership",
            vec![Operation::RebuildTable(RebuildSpec {
                table: tasks_table(true),
                orphans,
            })],
            Some(vec![Operation::RebuildTable(RebuildSpec {
                table: tasks_table(false),
                orphans: OrphanDisposition::Exclude,
            })]),
        ),
    ])
}

pub async fn seed_projects(pool: &SqlitePool, names: &[&str]) -> anyhow::Result<()> {
    for (position, name) in names.iter().enumerate() {
        sqlx::query("INSERT INTO projects (id, name) VALUES (?, ?)")
            .bind(position as i64 + 1)
            .bind(name)
            .execute(pool)
            .await?;
    }

    Ok(())
}

pub async fn seed_task(
    pool: &SqlitePool,
    id: i64,
    project_id: i64,
    title: &str,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO tasks (id, project_id, title) VALUES (?, ?, ?)")
        .bind(id)
        .bind(project_id)
        .bind(title)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn count(pool: &SqlitePool, sql: &str) -> anyhow::Result<i64> {
    let row: (i64,) = sqlx::query_as(sql).fetch_one(pool).await?;
    Ok(row.0)
}

/// User-visible and engine tables, sorted, without SQLite internals.
pub async fn table_names(pool: &SqlitePool) -> anyhow::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| row.0).collect())
}

pub fn current_ids(status: &StatusReport) -> Vec<String> {
    status
        .current
        .iter()
        .map(|head| head.revision.to_string())
        .collect()
}

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use strata_core::{
    Catalog, ColumnDefault, ColumnSpec, ColumnType, Error, FileMigration, ForeignKeyAction,
    ForeignKeySpec, IndexSpec, Migration, Operation, OrphanDisposition, RebuildSpec, TableSpec,
    TransformSpec,
};
use tempfile::TempDir;

const CREATE_PROJECTS: &str = r#"{
  "id": "a1",
  "label": "create projects",
  "created_at": "2024-05-01T09:00:00Z",
  "up": [
    {
      "op": "create_table",
      "name": "projects",
      "columns": [
        { "name": "id", "type": "integer", "nullable": false, "primary_key": true },
        { "name": "name", "type": "text", "nullable": false }
      ]
    }
  ],
  "down": [{ "op": "drop_table", "table": "projects" }]
}"#;

const TRACK_STATUS: &str = r#"{
  "id": "b2",
  "parents": ["a1"],
  "label": "track project status",
  "created_at": "2024-05-01T09:01:00Z",
  "up": [
    {
      "op": "add_column",
      "table": "projects",
      "column": {
        "name": "status",
        "type": "text",
        "nullable": false,
        "default": { "text": "active" }
      }
    }
  ],
  "down": [{ "op": "drop_column", "table": "projects", "column": "status" }]
}"#;

fn write_file(dir: &Path, name: &str, contents: &str) -> anyhow::Result<()> {
    fs::write(dir.join(name), contents)?;
    Ok(())
}

#[test]
fn load_dir_reads_files_in_name_order() -> anyhow::Result<()> {
    let dir = TempDir::with_prefix("strata_catalog")?;

    // Written out of order on purpose; the loader sorts by file name.
    write_file(dir.path(), "0002_track_status.json", TRACK_STATUS)?;
    write_file(dir.path(), "0001_create_projects.json", CREATE_PROJECTS)?;

    let catalog = Catalog::load_dir(dir.path())?;
    assert_eq!(catalog.len(), 2);

    let ids = catalog
        .iter()
        .map(|migration| migration.revision().to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["a1", "b2"]);

    let first = catalog.get(&"a1".into()).unwrap();
    assert_eq!(first.label(), "create projects");
    assert!(first.parents().is_empty());
    assert_eq!(
        first.created_at(),
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    );
    assert!(!first.irreversible());

    let second = catalog.get(&"b2".into()).unwrap();
    assert_eq!(second.parents(), vec!["a1".into()]);
    match &second.up()[0] {
        Operation::AddColumn { table, column } => {
            assert_eq!(table, "projects");
            assert_eq!(column.name, "status");
            assert!(!column.nullable);
            assert_eq!(
                column.default,
                Some(ColumnDefault::Text("active".to_owned()))
            );
        }
        other => panic!("unexpected operation: {other}"),
    }

    Ok(())
}

#[test]
fn duplicate_revision_ids_are_rejected() -> anyhow::Result<()> {
    let dir = TempDir::with_prefix("strata_catalog")?;

    write_file(dir.path(), "0001_create_projects.json", CREATE_PROJECTS)?;
    write_file(dir.path(), "0002_same_id_again.json", CREATE_PROJECTS)?;

    let err = Catalog::load_dir(dir.path()).unwrap_err();
    assert!(matches!(&err, Error::InvalidCatalog(_)));
    assert!(err.to_string().contains("duplicate revision id `a1`"));

    Ok(())
}

#[test]
fn malformed_json_names_the_offending_file() -> anyhow::Result<()> {
    let dir = TempDir::with_prefix("strata_catalog")?;

    write_file(dir.path(), "0001_create_projects.json", CREATE_PROJECTS)?;
    write_file(dir.path(), "0002_broken.json", r#"{"id": "b2", "label":"#)?;

    let err = Catalog::load_dir(dir.path()).unwrap_err();
    assert!(err.to_string().contains("0002_broken.json"));

    Ok(())
}

#[test]
fn missing_directory_is_an_io_error() {
    let err = Catalog::load_dir("/nonexistent/migrations").unwrap_err();
    assert!(matches!(&err, Error::Io(_)));
}

#[test]
fn files_without_a_json_extension_are_ignored() -> anyhow::Result<()> {
    let dir = TempDir::with_prefix("strata_catalog")?;

    write_file(dir.path(), "0001_create_projects.json", CREATE_PROJECTS)?;
    write_file(dir.path(), "README.md", "# migrations\n")?;
    write_file(dir.path(), "0002_track_status.json.bak", TRACK_STATUS)?;

    let catalog = Catalog::load_dir(dir.path())?;
    assert_eq!(catalog.len(), 1);
    assert!(catalog.contains(&"a1".into()));
    assert!(!catalog.contains(&"b2".into()));

    Ok(())
}

#[test]
fn a_single_file_loads_on_its_own() -> anyhow::Result<()> {
    let dir = TempDir::with_prefix("strata_catalog")?;
    write_file(dir.path(), "0001_create_projects.json", CREATE_PROJECTS)?;

    let migration = FileMigration::load(dir.path().join("0001_create_projects.json"))?;
    assert_eq!(migration.id.as_str(), "a1");
    assert_eq!(migration.label, "create projects");
    assert_eq!(migration.up.len(), 1);
    assert!(migration.parents.is_empty());

    Ok(())
}

#[test]
fn written_catalog_round_trips() -> anyhow::Result<()> {
    let dir = TempDir::with_prefix("strata_catalog")?;

    let migration = FileMigration {
        id: "c3".into(),
        parents: vec!["b2".into()],
        label: "enforce task ownership".to_owned(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 2, 0).unwrap(),
        up: vec![
            Operation::Transform(TransformSpec {
                description: "drop orphaned tasks".to_owned(),
                statement: "DELETE FROM tasks WHERE rowid IN (SELECT rowid FROM tasks \
                            WHERE project_id NOT IN (SELECT id FROM projects) LIMIT 100)"
                    .to_owned(),
                remaining: "SELECT COUNT(*) FROM tasks WHERE project_id NOT IN \
                            (SELECT id FROM projects)"
                    .to_owned(),
                tables: vec!["tasks".to_owned()],
            }),
            Operation::RebuildTable(RebuildSpec {
                table: TableSpec::new("tasks")
                    .column(ColumnSpec::new("id", ColumnType::Integer).primary_key())
                    .column(ColumnSpec::new("project_id", ColumnType::Integer).not_null())
                    .column(ColumnSpec::new("title", ColumnType::Text).not_null())
                    .foreign_key(
                        ForeignKeySpec::new("project_id", "projects", "id")
                            .on_delete(ForeignKeyAction::Cascade),
                    ),
                orphans: OrphanDisposition::Fail,
            }),
            Operation::CreateIndex(
                IndexSpec::new("idx_tasks_title", "tasks", vec!["title".to_owned()]).unique(),
            ),
        ],
        down: Some(vec![Operation::DropIndex {
            name: "idx_tasks_title".to_owned(),
            table: "tasks".to_owned(),
        }]),
    };

    write_file(
        dir.path(),
        "0003_enforce_ownership.json",
        &serde_json::to_string_pretty(&migration)?,
    )?;

    let catalog = Catalog::load_dir(dir.path())?;
    let loaded = catalog.get(&"c3".into()).unwrap();

    assert_eq!(loaded.describe(), migration.describe());
    assert_eq!(loaded.up(), migration.up);
    assert_eq!(loaded.down(), migration.down);
    assert!(!loaded.irreversible());

    Ok(())
}

mod common;

use strata::{Error, RestoreConfirmation, RunOptions, SnapshotScope, Target};

use crate::common::{
    app_catalog, count, create_runner, current_ids, seed_projects, seed_task, table_names,
};

#[tokio::test]
async fn database_snapshot_restores_everything() -> anyhow::Result<()> {
    let (runner, pool, _dir) = create_runner("backup_database", app_catalog()?).await?;

    runner.upgrade(&Target::Latest, &RunOptions::default()).await?;
    seed_projects(&pool, &["Alpha", "Beta"]).await?;
    seed_task(&pool, 1, 1, "write docs").await?;

    let handle = runner.snapshot(SnapshotScope::Database).await?;
    assert!(handle.path.is_file());

    let loaded = runner.backup_manager().load(&handle.id)?;
    assert_eq!(loaded.id, handle.id);
    assert_eq!(loaded.scope, SnapshotScope::Database);

    // Wreck the database: drop all data and invent a table the
    // snapshot has never heard of.
    sqlx::query("DELETE FROM projects").execute(&pool).await?;
    sqlx::query("CREATE TABLE scratch (id INTEGER PRIMARY KEY)")
        .execute(&pool)
        .await?;
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM tasks").await?, 0);

    let confirmation = RestoreConfirmation::acknowledge_data_loss(&handle);
    runner.restore(&handle, confirmation).await?;

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM projects").await?, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM tasks").await?, 1);
    assert_eq!(
        table_names(&pool).await?,
        vec!["projects", "strata_lock", "strata_revision", "strata_revision_log", "tasks"]
    );

    // The revision store came back with the data, so the engine still
    // agrees with itself.
    let status = runner.status().await?;
    assert_eq!(current_ids(&status), vec!["c3"]);
    assert!(status.mismatch.is_none());
    assert!(status.lock.is_none());

    Ok(())
}

#[tokio::test]
async fn targeted_restore_leaves_other_tables_alone() -> anyhow::Result<()> {
    let (runner, pool, _dir) = create_runner("backup_targeted", app_catalog()?).await?;

    runner.upgrade(&Target::Latest, &RunOptions::default()).await?;
    seed_projects(&pool, &["Alpha"]).await?;
    seed_task(&pool, 1, 1, "write docs").await?;

    let handle = runner
        .snapshot(SnapshotScope::Tables(vec!["projects".to_owned()]))
        .await?;

    sqlx::query("UPDATE projects SET name = 'renamed' WHERE id = 1")
        .execute(&pool)
        .await?;
    sqlx::query("UPDATE tasks SET title = 'renamed' WHERE id = 1")
        .execute(&pool)
        .await?;

    let confirmation = RestoreConfirmation::acknowledge_data_loss(&handle);
    runner.restore(&handle, confirmation).await?;

    let (name,): (String,) = sqlx::query_as("SELECT name FROM projects WHERE id = 1")
        .fetch_one(&pool)
        .await?;
    assert_eq!(name, "Alpha");

    // The scoped restore never touched tasks.
    let (title,): (String,) = sqlx::query_as("SELECT title FROM tasks WHERE id = 1")
        .fetch_one(&pool)
        .await?;
    assert_eq!(title, "renamed");

    assert!(runner.status().await?.mismatch.is_none());

    Ok(())
}

#[tokio::test]
async fn restore_demands_a_matching_confirmation() -> anyhow::Result<()> {
    let (runner, _pool, _dir) = create_runner("backup_confirmation", app_catalog()?).await?;

    runner.upgrade(&Target::Latest, &RunOptions::default()).await?;

    let first = runner
        .snapshot(SnapshotScope::Tables(vec!["projects".to_owned()]))
        .await?;
    let second = runner
        .snapshot(SnapshotScope::Tables(vec!["tasks".to_owned()]))
        .await?;

    let stale = RestoreConfirmation::acknowledge_data_loss(&first);
    let err = runner.restore(&second, stale).await.unwrap_err();

    assert!(matches!(&err, Error::RestoreBlocked(_)));
    assert!(err.to_string().contains("minted for"));

    let confirmation = RestoreConfirmation::acknowledge_data_loss(&second);
    runner.restore(&second, confirmation).await?;

    Ok(())
}

#[tokio::test]
async fn snapshot_scope_must_exist() -> anyhow::Result<()> {
    let (runner, _pool, _dir) = create_runner("backup_bad_scope", app_catalog()?).await?;

    let err = runner
        .snapshot(SnapshotScope::Tables(vec!["nope".to_owned()]))
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::BackupFailed(_)));
    assert!(err.to_string().contains("table `nope` does not exist"));

    let err = runner
        .snapshot(SnapshotScope::Tables(Vec::new()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("empty table scope"));

    // Failed snapshots leave nothing behind.
    assert!(runner.snapshots()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn manifests_without_artifacts_are_skipped() -> anyhow::Result<()> {
    let (runner, _pool, _dir) = create_runner("backup_missing_artifact", app_catalog()?).await?;

    runner.upgrade(&Target::Latest, &RunOptions::default()).await?;

    let first = runner
        .snapshot(SnapshotScope::Tables(vec!["projects".to_owned()]))
        .await?;
    let second = runner
        .snapshot(SnapshotScope::Tables(vec!["tasks".to_owned()]))
        .await?;

    std::fs::remove_file(&first.path)?;

    let listed = runner.snapshots()?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);

    let err = runner.backup_manager().load(&first.id).unwrap_err();
    assert!(err.to_string().contains("missing"));

    let err = runner.backup_manager().load("01UNKNOWN").unwrap_err();
    assert!(err.to_string().contains("no snapshot `01UNKNOWN`"));

    Ok(())
}

use chrono::{TimeZone, Utc};
use strata_core::{
    describe_state, Catalog, ColumnSpec, ColumnType, DowngradeTarget, Error, FileMigration,
    Operation, RevisionGraph, RevisionId, TableSpec, Target,
};

fn migration(id: &str, parents: &[&str], minute: u32) -> FileMigration {
    let table = format!("t_{id}");

    FileMigration {
        id: id.into(),
        parents: parents.iter().map(|&parent| parent.into()).collect(),
        label: format!("create {table}"),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
        up: vec![Operation::CreateTable(
            TableSpec::new(&table)
                .column(ColumnSpec::new("id", ColumnType::Integer).primary_key()),
        )],
        down: Some(vec![Operation::DropTable { table }]),
    }
}

fn catalog(migrations: Vec<FileMigration>) -> anyhow::Result<Catalog> {
    let mut catalog = Catalog::new();
    for migration in migrations {
        catalog.add(Box::new(migration))?;
    }
    Ok(catalog)
}

fn linear() -> anyhow::Result<Catalog> {
    catalog(vec![
        migration("a1", &[], 0),
        migration("b2", &["a1"], 1),
        migration("c3", &["b2"], 2),
    ])
}

fn diamond() -> anyhow::Result<Catalog> {
    catalog(vec![
        migration("a1", &[], 0),
        migration("b2", &["a1"], 1),
        migration("b2x", &["a1"], 2),
        migration("m3", &["b2", "b2x"], 3),
    ])
}

fn ids(ids: &[&str]) -> Vec<RevisionId> {
    ids.iter().map(|&id| id.into()).collect()
}

#[test]
fn upgrade_path_from_unmigrated() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(graph.latest()?, Some("c3".into()));
    assert_eq!(
        graph.upgrade_path(&[], &Target::Latest)?,
        ids(&["a1", "b2", "c3"])
    );

    Ok(())
}

#[test]
fn upgrade_path_from_midpoint() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(
        graph.upgrade_path(&ids(&["a1"]), &Target::Latest)?,
        ids(&["b2", "c3"])
    );

    Ok(())
}

#[test]
fn upgrade_path_is_empty_at_target() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert!(graph.upgrade_path(&ids(&["c3"]), &Target::Latest)?.is_empty());
    assert!(graph
        .upgrade_path(&ids(&["b2"]), &Target::Revision("b2".into()))?
        .is_empty());

    Ok(())
}

#[test]
fn upgrade_path_stops_at_explicit_revision() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(
        graph.upgrade_path(&[], &Target::Revision("b2".into()))?,
        ids(&["a1", "b2"])
    );

    Ok(())
}

#[test]
fn upgrade_refuses_a_target_behind_current() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    let err = graph
        .upgrade_path(&ids(&["c3"]), &Target::Revision("a1".into()))
        .unwrap_err();

    assert!(matches!(err, Error::UnreachableRevision { .. }));

    Ok(())
}

#[test]
fn upgrade_refuses_an_unknown_target() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    let err = graph
        .upgrade_path(&[], &Target::Revision("zz".into()))
        .unwrap_err();

    assert!(matches!(
        &err,
        Error::UnreachableRevision { from, target } if from == "unmigrated" && target == "zz"
    ));

    Ok(())
}

#[test]
fn latest_refuses_divergent_heads() -> anyhow::Result<()> {
    let catalog = catalog(vec![
        migration("a1", &[], 0),
        migration("b2", &["a1"], 1),
        migration("b2x", &["a1"], 2),
    ])?;
    let graph = RevisionGraph::new(&catalog)?;

    let err = graph.upgrade_path(&[], &Target::Latest).unwrap_err();
    assert!(matches!(
        &err,
        Error::DivergentHistory { heads } if *heads == ids(&["b2", "b2x"])
    ));

    // An explicit branch head is still a valid target.
    assert_eq!(
        graph.upgrade_path(&[], &Target::Revision("b2x".into()))?,
        ids(&["a1", "b2x"])
    );

    Ok(())
}

#[test]
fn upgrade_refuses_crossing_branches() -> anyhow::Result<()> {
    let catalog = catalog(vec![
        migration("a1", &[], 0),
        migration("b2", &["a1"], 1),
        migration("b2x", &["a1"], 2),
    ])?;
    let graph = RevisionGraph::new(&catalog)?;

    // b2x is not a descendant of b2; moving there is not an upgrade.
    let err = graph
        .upgrade_path(&ids(&["b2"]), &Target::Revision("b2x".into()))
        .unwrap_err();

    assert!(matches!(err, Error::UnreachableRevision { .. }));

    Ok(())
}

#[test]
fn merge_revision_resolves_divergence() -> anyhow::Result<()> {
    let catalog = diamond()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(graph.latest()?, Some("m3".into()));
    assert_eq!(
        graph.upgrade_path(&[], &Target::Latest)?,
        ids(&["a1", "b2", "b2x", "m3"])
    );

    // One branch already applied: only the other branch and the merge
    // remain, in that order.
    assert_eq!(
        graph.upgrade_path(&ids(&["b2"]), &Target::Latest)?,
        ids(&["b2x", "m3"])
    );

    Ok(())
}

#[test]
fn sibling_order_is_deterministic() -> anyhow::Result<()> {
    // Authoring time decides between siblings.
    let by_time = catalog(vec![
        migration("a1", &[], 0),
        migration("late", &["a1"], 30),
        migration("early", &["a1"], 5),
        migration("m3", &["late", "early"], 40),
    ])?;
    let graph = RevisionGraph::new(&by_time)?;

    assert_eq!(
        graph.upgrade_path(&[], &Target::Latest)?,
        ids(&["a1", "early", "late", "m3"])
    );

    // Equal timestamps fall back to the id.
    let by_id = catalog(vec![
        migration("a1", &[], 0),
        migration("n2", &["a1"], 1),
        migration("n1", &["a1"], 1),
        migration("m3", &["n1", "n2"], 2),
    ])?;
    let graph = RevisionGraph::new(&by_id)?;

    assert_eq!(
        graph.upgrade_path(&[], &Target::Latest)?,
        ids(&["a1", "n1", "n2", "m3"])
    );

    Ok(())
}

#[test]
fn downgrade_path_by_steps() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(
        graph.downgrade_path(&ids(&["c3"]), &DowngradeTarget::Steps(2))?,
        ids(&["c3", "b2"])
    );

    let err = graph
        .downgrade_path(&ids(&["c3"]), &DowngradeTarget::Steps(4))
        .unwrap_err();
    assert!(matches!(err, Error::UnreachableRevision { .. }));

    Ok(())
}

#[test]
fn downgrade_path_to_revision_and_base() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(
        graph.downgrade_path(&ids(&["c3"]), &DowngradeTarget::Revision("a1".into()))?,
        ids(&["c3", "b2"])
    );
    assert_eq!(
        graph.downgrade_path(&ids(&["c3"]), &DowngradeTarget::Base)?,
        ids(&["c3", "b2", "a1"])
    );
    assert!(graph
        .downgrade_path(&ids(&["c3"]), &DowngradeTarget::Revision("c3".into()))?
        .is_empty());

    Ok(())
}

#[test]
fn downgrade_refuses_an_unapplied_target() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    let err = graph
        .downgrade_path(&ids(&["a1"]), &DowngradeTarget::Revision("c3".into()))
        .unwrap_err();

    assert!(matches!(err, Error::UnreachableRevision { .. }));

    Ok(())
}

#[test]
fn downgrade_refuses_to_cross_an_irreversible_revision() -> anyhow::Result<()> {
    let mut blocked = migration("b2", &["a1"], 1);
    blocked.down = None;

    let catalog = catalog(vec![
        migration("a1", &[], 0),
        blocked,
        migration("c3", &["b2"], 2),
    ])?;
    let graph = RevisionGraph::new(&catalog)?;

    let err = graph
        .downgrade_path(&ids(&["c3"]), &DowngradeTarget::Base)
        .unwrap_err();
    assert!(matches!(
        &err,
        Error::IrreversibleMigration { revision } if revision.as_str() == "b2"
    ));

    // A shorter walk that stays above it is fine.
    assert_eq!(
        graph.downgrade_path(&ids(&["c3"]), &DowngradeTarget::Steps(1))?,
        ids(&["c3"])
    );

    Ok(())
}

#[test]
fn downgrade_unwinds_a_merge_before_its_parents() -> anyhow::Result<()> {
    let catalog = diamond()?;
    let graph = RevisionGraph::new(&catalog)?;

    assert_eq!(
        graph.downgrade_path(&ids(&["m3"]), &DowngradeTarget::Revision("a1".into()))?,
        ids(&["m3", "b2x", "b2"])
    );

    // A two-headed recorded state, mid-unwind, still resolves.
    assert_eq!(
        graph.downgrade_path(&ids(&["b2", "b2x"]), &DowngradeTarget::Revision("a1".into()))?,
        ids(&["b2x", "b2"])
    );

    Ok(())
}

#[test]
fn unknown_parent_is_rejected() -> anyhow::Result<()> {
    let catalog = catalog(vec![migration("b2", &["ghost"], 1)])?;

    let err = RevisionGraph::new(&catalog).unwrap_err();
    assert!(err.to_string().contains("unknown parent `ghost`"));

    Ok(())
}

#[test]
fn parent_cycle_is_rejected() -> anyhow::Result<()> {
    let catalog = catalog(vec![
        migration("a1", &["c3"], 0),
        migration("b2", &["a1"], 1),
        migration("c3", &["b2"], 2),
    ])?;

    let err = RevisionGraph::new(&catalog).unwrap_err();
    assert!(err.to_string().contains("cycle"));

    Ok(())
}

#[test]
fn recorded_head_missing_from_catalog_is_rejected() -> anyhow::Result<()> {
    let catalog = linear()?;
    let graph = RevisionGraph::new(&catalog)?;

    let err = graph.upgrade_path(&ids(&["zz"]), &Target::Latest).unwrap_err();

    assert!(matches!(err, Error::InvalidCatalog(_)));
    assert!(err.to_string().contains("not in the catalog"));

    Ok(())
}

#[test]
fn empty_catalog_has_no_work() -> anyhow::Result<()> {
    let catalog = Catalog::new();
    let graph = RevisionGraph::new(&catalog)?;

    assert!(graph.heads().is_empty());
    assert_eq!(graph.latest()?, None);
    assert!(graph.upgrade_path(&[], &Target::Latest)?.is_empty());
    assert!(graph.downgrade_path(&[], &DowngradeTarget::Base)?.is_empty());

    Ok(())
}

#[test]
fn describe_state_names_the_heads() {
    assert_eq!(describe_state(&[]), "unmigrated");
    assert_eq!(describe_state(&ids(&["a1"])), "a1");
    assert_eq!(describe_state(&ids(&["b2", "b2x"])), "b2, b2x");
}

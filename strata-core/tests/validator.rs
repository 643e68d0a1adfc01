use chrono::{TimeZone, Utc};
use strata_core::{
    validate, validate_operations, ColumnDefault, ColumnSpec, ColumnType, Error, FileMigration,
    FindingKind, IndexSpec, Operation, OrphanDisposition, RebuildSpec, Risk, TableSpec,
    TransformSpec, ValidationReport,
};

fn migration(up: Vec<Operation>, down: Option<Vec<Operation>>) -> FileMigration {
    FileMigration {
        id: "r1".into(),
        parents: Vec::new(),
        label: "users changes".to_owned(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        up,
        down,
    }
}

fn report(up: Vec<Operation>) -> ValidationReport {
    validate(&migration(up, Some(vec![Operation::DropIndex {
        name: "unused".to_owned(),
        table: "users".to_owned(),
    }])))
}

fn kinds(report: &ValidationReport) -> Vec<FindingKind> {
    report.findings.iter().map(|finding| finding.kind).collect()
}

fn users_table() -> TableSpec {
    TableSpec::new("users")
        .column(ColumnSpec::new("id", ColumnType::Integer).primary_key())
        .column(ColumnSpec::new("email", ColumnType::Text))
}

fn backfill_emails() -> Operation {
    Operation::Transform(TransformSpec {
        description: "backfill user emails".to_owned(),
        statement: "UPDATE users SET email = '' WHERE rowid IN \
                    (SELECT rowid FROM users WHERE email IS NULL LIMIT 500)"
            .to_owned(),
        remaining: "SELECT COUNT(*) FROM users WHERE email IS NULL".to_owned(),
        tables: vec!["users".to_owned()],
    })
}

#[test]
fn creating_structures_is_additive() {
    let report = report(vec![
        Operation::CreateTable(users_table()),
        Operation::CreateIndex(IndexSpec::new(
            "idx_users_email",
            "users",
            vec!["email".to_owned()],
        )),
    ]);

    assert_eq!(report.risk, Risk::Additive);
    assert!(report.findings.is_empty());
    assert!(!report.is_blocking());
    assert!(report.ensure_unblocked().is_ok());
}

#[test]
fn dropping_a_table_is_destructive() {
    let report = report(vec![Operation::DropTable {
        table: "users".to_owned(),
    }]);

    assert_eq!(report.risk, Risk::Destructive);
    assert_eq!(kinds(&report), vec![FindingKind::TableDrop]);
    assert!(report.is_blocking());

    let err = report.ensure_unblocked().unwrap_err();
    assert!(matches!(
        &err,
        Error::ValidationBlocked { revision, .. } if revision.as_str() == "r1"
    ));
    assert!(err.to_string().contains("drops table `users`"));
}

#[test]
fn dropping_a_table_created_in_the_same_migration_is_quiet() {
    let report = report(vec![
        Operation::CreateTable(TableSpec::new("scratch")),
        Operation::DropTable {
            table: "scratch".to_owned(),
        },
    ]);

    assert_eq!(report.risk, Risk::Additive);
    assert!(report.findings.is_empty());
}

#[test]
fn not_null_column_needs_a_default_or_a_backfill() {
    let bare = report(vec![Operation::AddColumn {
        table: "users".to_owned(),
        column: ColumnSpec::new("tier", ColumnType::Text).not_null(),
    }]);
    assert_eq!(kinds(&bare), vec![FindingKind::NotNullOnExistingData]);
    assert_eq!(bare.risk, Risk::Destructive);

    let defaulted = report(vec![Operation::AddColumn {
        table: "users".to_owned(),
        column: ColumnSpec::new("tier", ColumnType::Text)
            .not_null()
            .default_value(ColumnDefault::Text("free".to_owned())),
    }]);
    assert!(defaulted.findings.is_empty());

    let fresh = report(vec![
        Operation::CreateTable(users_table()),
        Operation::AddColumn {
            table: "users".to_owned(),
            column: ColumnSpec::new("tier", ColumnType::Text).not_null(),
        },
    ]);
    assert!(fresh.findings.is_empty());
}

#[test]
fn uniqueness_against_existing_rows_is_destructive() {
    let column = report(vec![Operation::AddColumn {
        table: "users".to_owned(),
        column: ColumnSpec::new("handle", ColumnType::Text).unique(),
    }]);
    assert_eq!(kinds(&column), vec![FindingKind::UniqueOnExistingData]);

    let index = report(vec![Operation::CreateIndex(
        IndexSpec::new("idx_users_email", "users", vec!["email".to_owned()]).unique(),
    )]);
    assert_eq!(kinds(&index), vec![FindingKind::UniqueOnExistingData]);
    assert!(index.is_blocking());
}

#[test]
fn a_prior_backfill_downgrades_the_constraint() {
    let report = report(vec![
        backfill_emails(),
        Operation::CreateIndex(
            IndexSpec::new("idx_users_email", "users", vec!["email".to_owned()]).unique(),
        ),
    ]);

    assert_eq!(kinds(&report), vec![FindingKind::DataTransform]);
    assert_eq!(report.risk, Risk::Transformational);
    assert!(!report.is_blocking());
}

#[test]
fn unbounded_transform_covers_every_table() {
    let report = report(vec![
        Operation::Transform(TransformSpec {
            description: "normalize timestamps".to_owned(),
            statement: "UPDATE events SET at = at".to_owned(),
            remaining: "SELECT 0".to_owned(),
            tables: Vec::new(),
        }),
        Operation::CreateIndex(
            IndexSpec::new("idx_events_at", "events", vec!["at".to_owned()]).unique(),
        ),
    ]);

    assert_eq!(kinds(&report), vec![FindingKind::DataTransform]);
    assert!(report.findings[0].detail.contains("whole-database snapshot"));
}

#[test]
fn rebuild_is_transformational_but_not_blocking() {
    let report = report(vec![Operation::RebuildTable(RebuildSpec {
        table: users_table(),
        orphans: OrphanDisposition::Exclude,
    })]);

    assert_eq!(kinds(&report), vec![FindingKind::TableRewrite]);
    assert_eq!(report.risk, Risk::Transformational);
    assert!(!report.is_blocking());
    assert!(report.ensure_unblocked().is_ok());
}

#[test]
fn missing_down_marks_the_migration_irreversible() {
    let absent = validate(&migration(
        vec![Operation::CreateTable(users_table())],
        None,
    ));
    assert_eq!(kinds(&absent), vec![FindingKind::Irreversible]);
    // Irreversibility is a separate axis; the operations stay additive.
    assert_eq!(absent.risk, Risk::Additive);
    assert!(absent.is_blocking());

    let err = absent.ensure_unblocked().unwrap_err();
    assert!(err.to_string().contains("cannot be downgraded"));

    // An empty down list is just as irreversible as a missing one.
    let empty = validate(&migration(
        vec![Operation::CreateTable(users_table())],
        Some(Vec::new()),
    ));
    assert_eq!(kinds(&empty), vec![FindingKind::Irreversible]);
}

#[test]
fn worst_finding_decides_the_risk() {
    let report = report(vec![
        Operation::CreateTable(TableSpec::new("audit")),
        Operation::RebuildTable(RebuildSpec {
            table: users_table(),
            orphans: OrphanDisposition::Exclude,
        }),
        Operation::DropColumn {
            table: "users".to_owned(),
            column: "legacy_flags".to_owned(),
        },
    ]);

    assert_eq!(report.risk, Risk::Destructive);
    assert_eq!(
        kinds(&report),
        vec![FindingKind::TableRewrite, FindingKind::ColumnDrop]
    );
}

#[test]
fn down_operations_are_classified_on_their_own() {
    // The runner classifies down lists when it plans a downgrade; the
    // irreversibility of the migration itself does not apply there.
    let report = validate_operations(
        "r1".into(),
        "drop users".to_owned(),
        &[Operation::DropTable {
            table: "users".to_owned(),
        }],
        false,
    );

    assert_eq!(kinds(&report), vec![FindingKind::TableDrop]);
    assert_eq!(report.risk, Risk::Destructive);
}

//! End-to-end merges against the in-memory store.

mod common;

use common::{config, legal_unit_with, slice, source, timeline};
use serde_json::{json, Value};
use temporal_merge::{
    temporal_merge, ColumnDescriptor, ConfigError, DeleteMode, EraMetadata, ErrorKind, ExecutionMode, ExecutionStats,
    FeedbackStatus, MemoryTable, MergeConfig, MergeError, MergeMode, Merger, PlanAction, RangeSubtype, SourceRecords,
    StoreError, UniqueKeyDescriptor, UniqueKeyKind,
};

const BASIC: &[&str] = &["row_id", "id", "valid_from", "valid_until", "name"];

fn stats(inserted: usize, updated: usize, deleted: usize) -> ExecutionStats {
    ExecutionStats {
        inserted,
        updated,
        deleted,
    }
}

#[test]
fn patch_splits_and_bridges_the_timeline() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2024-02-01", "name": "A1"}),
        json!({"id": 1, "valid_from": "2024-02-01", "valid_until": "2024-03-01", "name": "A2"}),
        json!({"id": 1, "valid_from": "2024-04-01", "valid_until": "2024-05-01", "name": "A3"}),
    ]);
    let rows = vec![
        json!({"row_id": 1, "id": 1, "valid_from": "2024-02-10", "valid_until": "2024-02-20", "name": "A2-patch"}),
        json!({"row_id": 2, "id": 1, "valid_from": "2024-03-01", "valid_until": "2024-04-01", "name": "A2.5-bridge"}),
    ];
    let mut src = source(BASIC, rows.clone());
    let cfg = config(MergeMode::MergeEntityPatch);

    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();
    assert_eq!(outcome.stats, stats(3, 1, 0));
    assert!(outcome.feedback.iter().all(|f| f.status == FeedbackStatus::Applied));
    assert_eq!(
        timeline(&table, 1),
        vec![
            slice("[2024-01-01,2024-02-01)", "A1"),
            slice("[2024-02-01,2024-02-10)", "A2"),
            slice("[2024-02-10,2024-02-20)", "A2-patch"),
            slice("[2024-02-20,2024-03-01)", "A2"),
            slice("[2024-03-01,2024-04-01)", "A2.5-bridge"),
            slice("[2024-04-01,2024-05-01)", "A3"),
        ]
    );

    let mut again = source(BASIC, rows);
    let rerun = temporal_merge(&mut table, &mut again, &cfg).unwrap();
    assert_eq!(rerun.stats, ExecutionStats::default());
    assert!(rerun.feedback.iter().all(|f| f.action == PlanAction::SkipIdentical));
}

#[test]
fn identical_source_coalesces_adjacent_target_slices() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2024-02-01", "name": "A"}),
        json!({"id": 1, "valid_from": "2024-02-01", "valid_until": "2024-03-01", "name": "A"}),
    ]);
    let mut src = source(
        BASIC,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-02-01", "valid_until": "2024-03-01", "name": "A"})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::MergeEntityPatch)).unwrap();
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2024-03-01)", "A")]);
    assert_eq!(outcome.stats.deleted, 1);
}

#[test]
fn founding_rows_share_one_new_entity() {
    let mut table = legal_unit_with(vec![]);
    let columns = [
        "row_id",
        "founding_id",
        "id",
        "valid_from",
        "valid_until",
        "name",
        "merge_status",
        "merge_error",
    ];
    let mut src = source(
        &columns,
        vec![
            json!({"row_id": 1, "founding_id": "A", "id": null, "valid_from": "2024-01-01", "valid_until": "2024-06-01", "name": "A"}),
            json!({"row_id": 2, "founding_id": "A", "id": null, "valid_from": "2024-06-01", "valid_until": "2024-12-01", "name": "B"}),
        ],
    );
    let cfg = config(MergeMode::MergeEntityPatch)
        .founding_id_column("founding_id")
        .write_back_identity()
        .write_back_feedback();

    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();
    assert_eq!(outcome.stats, stats(2, 0, 0));
    for fb in &outcome.feedback {
        assert_eq!(fb.status, FeedbackStatus::Applied);
        assert_eq!(fb.assigned_identity.as_ref().and_then(|r| r.get("id")), Some(&json!(1)));
    }
    assert_eq!(
        timeline(&table, 1),
        vec![
            slice("[2024-01-01,2024-06-01)", "A"),
            slice("[2024-06-01,2024-12-01)", "B"),
        ]
    );
    for row_id in [1, 2] {
        let row = src.row("row_id", row_id).unwrap();
        assert_eq!(row.get("id"), Some(&json!(1)));
        assert_eq!(row.get("merge_status"), Some(&json!("APPLIED")));
        assert_eq!(row.get("merge_error"), Some(&Value::Null));
    }
}

#[test]
fn for_portion_of_never_creates_entities() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let mut src = source(
        BASIC,
        vec![
            json!({"row_id": 1, "id": 1, "valid_from": "2024-03-01", "valid_until": "2024-04-01", "name": "B"}),
            json!({"row_id": 2, "id": 99, "valid_from": "2024-03-01", "valid_until": "2024-04-01", "name": "X"}),
            json!({"row_id": 3, "id": 1, "valid_from": "2025-02-01", "valid_until": "2025-03-01", "name": "C"}),
        ],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::PatchForPortionOf)).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().status, FeedbackStatus::Applied);
    for row_id in [2, 3] {
        let fb = outcome.feedback_for(row_id).unwrap();
        assert_eq!(fb.status, FeedbackStatus::Skipped);
        assert_eq!(fb.action, PlanAction::SkipNoTarget);
    }
    assert!(!outcome
        .plan
        .iter()
        .filter(|r| r.operation.is_dml())
        .any(|r| r.entity_keys.get("id") == Some(&json!(99))));
    assert_eq!(
        timeline(&table, 1),
        vec![
            slice("[2024-01-01,2024-03-01)", "A"),
            slice("[2024-03-01,2024-04-01)", "B"),
            slice("[2024-04-01,2025-01-01)", "A"),
        ]
    );
    assert!(table.history("id", &json!(99)).is_empty());
}

#[test]
fn unknown_explicit_identity_is_a_row_error() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let mut src = source(
        BASIC,
        vec![
            json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "B"}),
            json!({"row_id": 2, "id": 42, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "Z"}),
        ],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::MergeEntityPatch)).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().action, PlanAction::Update);
    let fb = outcome.feedback_for(2).unwrap();
    assert_eq!(fb.status, FeedbackStatus::Error);
    assert_eq!(fb.error_kind, Some(ErrorKind::Resolution));
    assert!(fb.error.as_deref().unwrap_or_default().contains("does not exist"));
    assert!(table.history("id", &json!(42)).is_empty());
}

#[test]
fn natural_keys_naming_two_entities_are_ambiguous() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "tax_ident": "111", "stat_ident": "S1", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "One"}),
        json!({"id": 2, "tax_ident": "222", "stat_ident": "S2", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "Two"}),
    ]);
    let columns = ["row_id", "id", "tax_ident", "stat_ident", "valid_from", "valid_until", "name"];
    let mut src = source(
        &columns,
        vec![
            json!({"row_id": 1, "id": null, "tax_ident": "111", "stat_ident": "S2", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "Which"}),
            json!({"row_id": 2, "id": null, "tax_ident": "222", "stat_ident": null, "valid_from": "2024-06-01", "valid_until": "2025-01-01", "name": "Two-b"}),
        ],
    );
    let cfg = config(MergeMode::MergeEntityPatch)
        .natural_key(&["tax_ident"])
        .natural_key(&["stat_ident"]);
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();

    let bad = outcome.feedback_for(1).unwrap();
    assert_eq!(bad.status, FeedbackStatus::Error);
    assert!(bad.error.as_deref().unwrap_or_default().contains("ambiguous"));

    let good = outcome.feedback_for(2).unwrap();
    assert_eq!(good.status, FeedbackStatus::Applied);
    assert_eq!(good.assigned_identity.as_ref().and_then(|r| r.get("id")), Some(&json!(2)));
    assert_eq!(
        timeline(&table, 2),
        vec![
            slice("[2024-01-01,2024-06-01)", "Two"),
            slice("[2024-06-01,2025-01-01)", "Two-b"),
        ]
    );
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2025-01-01)", "One")]);
}

#[test]
fn null_values_patch_versus_replace() {
    let seed = || {
        legal_unit_with(vec![
            json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A", "employees": 10}),
        ])
    };
    let columns = ["row_id", "id", "valid_from", "valid_until", "name", "employees"];
    let rows = || {
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A", "employees": null})]
    };

    let mut table = seed();
    let outcome = temporal_merge(&mut table, &mut source(&columns, rows()), &config(MergeMode::MergeEntityPatch)).unwrap();
    assert_eq!(outcome.feedback_for(1).unwrap().action, PlanAction::SkipIdentical);
    assert_eq!(table.rows()[0].get("employees"), Some(&json!(10)));

    let mut table = seed();
    let outcome =
        temporal_merge(&mut table, &mut source(&columns, rows()), &config(MergeMode::MergeEntityReplace)).unwrap();
    assert_eq!(outcome.stats, stats(0, 1, 0));
    assert_eq!(table.rows()[0].get("employees"), Some(&Value::Null));
}

#[test]
fn delete_for_portion_of_cuts_a_hole() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let mut src = source(
        &["row_id", "id", "valid_from", "valid_until"],
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-04-01", "valid_until": "2024-07-01"})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::DeleteForPortionOf)).unwrap();
    assert_eq!(outcome.feedback_for(1).unwrap().status, FeedbackStatus::Applied);
    assert_eq!(
        timeline(&table, 1),
        vec![
            slice("[2024-01-01,2024-04-01)", "A"),
            slice("[2024-07-01,2025-01-01)", "A"),
        ]
    );
}

#[test]
fn delete_missing_timeline_keeps_only_sourced_time() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2024-06-01", "name": "A"}),
        json!({"id": 1, "valid_from": "2024-06-01", "valid_until": "2025-01-01", "name": "B"}),
    ]);
    let mut src = source(
        BASIC,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-03-01", "valid_until": "2024-09-01", "name": "C"})],
    );
    let cfg = config(MergeMode::MergeEntityReplace).delete_mode(DeleteMode::DeleteMissingTimeline);
    temporal_merge(&mut table, &mut src, &cfg).unwrap();
    assert_eq!(timeline(&table, 1), vec![slice("[2024-03-01,2024-09-01)", "C")]);
}

#[test]
fn delete_missing_entities_removes_unsourced_entities() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
        json!({"id": 2, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "B"}),
    ]);
    let mut src = source(
        BASIC,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"})],
    );
    let cfg = config(MergeMode::MergeEntityPatch).delete_mode(DeleteMode::DeleteMissingEntities);
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();

    assert_eq!(outcome.stats, stats(0, 0, 1));
    assert_eq!(outcome.feedback_for(1).unwrap().action, PlanAction::SkipIdentical);
    assert!(table.history("id", &json!(2)).is_empty());
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2025-01-01)", "A")]);
}

#[test]
fn covered_source_rows_are_eclipsed() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let mut src = source(
        BASIC,
        vec![
            json!({"row_id": 1, "id": 1, "valid_from": "2024-03-01", "valid_until": "2024-04-01", "name": "old"}),
            json!({"row_id": 2, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "new"}),
        ],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::MergeEntityPatch)).unwrap();

    let eclipsed = outcome.feedback_for(1).unwrap();
    assert_eq!(eclipsed.status, FeedbackStatus::Skipped);
    assert_eq!(eclipsed.action, PlanAction::SkipEclipsed);
    assert_eq!(outcome.stats, stats(0, 1, 0));
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2025-01-01)", "new")]);
}

fn two_new_entities() -> SourceRecords {
    source(
        &["row_id", "founding_id", "id", "valid_from", "valid_until", "name"],
        vec![
            json!({"row_id": 1, "founding_id": "x", "id": null, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "X"}),
            json!({"row_id": 2, "founding_id": "y", "id": null, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": null}),
        ],
    )
}

#[test]
fn best_effort_isolates_failing_entities() {
    let mut table = legal_unit_with(vec![]);
    let cfg = config(MergeMode::MergeEntityPatch)
        .founding_id_column("founding_id")
        .execution(ExecutionMode::BestEffort);
    let outcome = temporal_merge(&mut table, &mut two_new_entities(), &cfg).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().status, FeedbackStatus::Applied);
    let failed = outcome.feedback_for(2).unwrap();
    assert_eq!(failed.status, FeedbackStatus::Error);
    assert_eq!(failed.error_kind, Some(ErrorKind::Execution));
    assert_eq!(table.rows().len(), 1);
    assert_eq!(table.rows()[0].get("name"), Some(&json!("X")));
}

#[test]
fn atomic_execution_rolls_back_everything() {
    let mut table = legal_unit_with(vec![]);
    let cfg = config(MergeMode::MergeEntityPatch).founding_id_column("founding_id");
    let err = temporal_merge(&mut table, &mut two_new_entities(), &cfg).unwrap_err();
    assert!(matches!(
        err,
        MergeError::Execution { source: StoreError::NotNull { ref column }, .. } if column == "name"
    ));
    assert!(table.rows().is_empty());
}

#[test]
fn best_effort_needs_savepoints() {
    let mut table = common::legal_unit().without_savepoints();
    let cfg = config(MergeMode::MergeEntityPatch)
        .founding_id_column("founding_id")
        .execution(ExecutionMode::BestEffort);
    let err = temporal_merge(&mut table, &mut two_new_entities(), &cfg).unwrap_err();
    assert!(matches!(err, MergeError::Config(ConfigError::SavepointsUnsupported)));
}

#[test]
fn ephemeral_columns_do_not_drive_changes() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A", "edit_comment": "initial"}),
    ]);
    let columns = ["row_id", "id", "valid_from", "valid_until", "name", "edit_comment"];
    let cfg = config(MergeMode::MergeEntityPatch).ephemeral(&["edit_comment"]);

    let mut src = source(
        &columns,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A", "edit_comment": "re-import"})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();
    assert_eq!(outcome.feedback_for(1).unwrap().action, PlanAction::SkipIdentical);
    assert_eq!(table.rows()[0].get("edit_comment"), Some(&json!("initial")));

    let mut src = source(
        &columns,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "B", "edit_comment": "renamed"})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();
    assert_eq!(outcome.feedback_for(1).unwrap().action, PlanAction::Update);
    assert_eq!(table.rows()[0].get("edit_comment"), Some(&json!("renamed")));
}

#[test]
fn inclusive_end_and_range_columns_follow_the_bounds() {
    let mut table = MemoryTable::new(
        "legal_unit",
        EraMetadata::new("valid", RangeSubtype::Date)
            .with_valid_to("valid_to")
            .with_range_col("valid"),
        vec![
            ColumnDescriptor::new("id", "integer").generated_by_default(),
            ColumnDescriptor::new("valid_from", "date").not_null(),
            ColumnDescriptor::new("valid_to", "date"),
            ColumnDescriptor::new("valid_until", "date").not_null(),
            ColumnDescriptor::new("valid", "daterange"),
            ColumnDescriptor::new("name", "text"),
        ],
    )
    .with_unique_key(UniqueKeyDescriptor::new("legal_unit_id_valid", &["id"], UniqueKeyKind::Primary));
    let columns = ["row_id", "id", "valid_from", "valid_to", "name"];
    let cfg = config(MergeMode::MergeEntityPatch);

    let mut src = source(
        &columns,
        vec![json!({"row_id": 1, "id": null, "valid_from": "2024-01-01", "valid_to": "2024-12-31", "name": "X"})],
    );
    temporal_merge(&mut table, &mut src, &cfg).unwrap();
    let row = &table.rows()[0];
    assert_eq!(row.get("valid_until"), Some(&json!("2025-01-01")));
    assert_eq!(row.get("valid_to"), Some(&json!("2024-12-31")));
    assert_eq!(row.get("valid"), Some(&json!("[2024-01-01,2025-01-01)")));

    let mut src = source(
        &columns,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-07-01", "valid_to": "2024-12-31", "name": "Y"})],
    );
    temporal_merge(&mut table, &mut src, &cfg).unwrap();
    let history = table.history("id", &json!(1));
    assert_eq!(history.len(), 2);
    let (_, first) = &history[0];
    assert_eq!(first.get("valid_to"), Some(&json!("2024-06-30")));
    assert_eq!(first.get("valid"), Some(&json!("[2024-01-01,2024-07-01)")));
    assert_eq!(first.get("name"), Some(&json!("X")));
    let (_, second) = &history[1];
    assert_eq!(second.get("valid_until"), Some(&json!("2025-01-01")));
    assert_eq!(second.get("name"), Some(&json!("Y")));
}

#[test]
fn cached_plans_match_uncached_plans() {
    let table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let src = source(
        BASIC,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-05-01", "valid_until": "2024-08-01", "name": "B"})],
    );
    let cfg = config(MergeMode::MergeEntityPatch);

    let mut merger = Merger::with_cache();
    let first = merger.plan(&table, &src, &cfg).unwrap();
    let second = merger.plan(&table, &src, &cfg).unwrap();
    let uncached = temporal_merge::plan(&table, &src, &cfg).unwrap();

    assert_eq!(first.rows, uncached.rows);
    assert_eq!(second.rows, uncached.rows);
    let cache = merger.cache().unwrap();
    assert_eq!((cache.hits(), cache.misses()), (1, 1));
    assert_eq!(table.rows().len(), 1);
}

#[test]
fn natural_key_discovers_existing_and_founds_new() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "tax_ident": "111", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let columns = ["row_id", "id", "tax_ident", "valid_from", "valid_until", "name"];
    let mut src = source(
        &columns,
        vec![
            json!({"row_id": 1, "id": null, "tax_ident": "111", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A-renamed"}),
            json!({"row_id": 2, "id": null, "tax_ident": "999", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "New"}),
        ],
    );
    let cfg = config(MergeMode::MergeEntityPatch)
        .natural_key(&["tax_ident"])
        .write_back_identity();
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().action, PlanAction::Update);
    assert_eq!(outcome.feedback_for(2).unwrap().action, PlanAction::Insert);
    assert_eq!(src.row("row_id", 1).unwrap().get("id"), Some(&json!(1)));
    assert_eq!(src.row("row_id", 2).unwrap().get("id"), Some(&json!(2)));
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2025-01-01)", "A-renamed")]);
    assert_eq!(timeline(&table, 2), vec![slice("[2024-01-01,2025-01-01)", "New")]);
}

#[test]
fn insert_new_entities_filters_existing_ones() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "tax_ident": "111", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let columns = ["row_id", "id", "tax_ident", "valid_from", "valid_until", "name"];
    let mut src = source(
        &columns,
        vec![
            json!({"row_id": 1, "id": null, "tax_ident": "111", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "changed"}),
            json!({"row_id": 2, "id": null, "tax_ident": "222", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "new"}),
        ],
    );
    let cfg = config(MergeMode::InsertNewEntities).natural_key(&["tax_ident"]);
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();

    let filtered = outcome.feedback_for(1).unwrap();
    assert_eq!(filtered.status, FeedbackStatus::Skipped);
    assert_eq!(filtered.action, PlanAction::SkipFiltered);
    assert_eq!(outcome.stats, stats(1, 0, 0));
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2025-01-01)", "A")]);
    assert_eq!(timeline(&table, 2), vec![slice("[2024-01-01,2025-01-01)", "new")]);
}

#[test]
fn configuration_errors_abort_before_reading() {
    let mut table = legal_unit_with(vec![]);

    let cfg = config(MergeMode::UpdateForPortionOf);
    let err = temporal_merge(&mut table, &mut source(BASIC, vec![]), &cfg).unwrap_err();
    assert!(matches!(err, MergeError::Config(ConfigError::IncompleteSource { .. })));

    let cfg = MergeConfig::new("legal_unit", "legal_unit_source", &[]);
    let err = temporal_merge(&mut table, &mut source(BASIC, vec![]), &cfg).unwrap_err();
    assert!(matches!(err, MergeError::Config(ConfigError::MissingIdentityColumns)));

    let cfg = config(MergeMode::MergeEntityPatch);
    let mut no_row_id = source(&["id", "valid_from", "valid_until", "name"], vec![]);
    let err = temporal_merge(&mut table, &mut no_row_id, &cfg).unwrap_err();
    assert!(matches!(err, MergeError::Config(ConfigError::UnknownColumn { ref column, .. }) if column == "row_id"));

    let mut typed = SourceRecords::with_columns(
        "legal_unit_source",
        vec![
            ColumnDescriptor::new("row_id", "integer"),
            ColumnDescriptor::new("id", "text"),
            ColumnDescriptor::new("valid_from", "date"),
            ColumnDescriptor::new("valid_until", "date"),
            ColumnDescriptor::new("name", "text"),
        ],
    );
    let err = temporal_merge(&mut table, &mut typed, &cfg).unwrap_err();
    assert!(matches!(err, MergeError::Config(ConfigError::TypeMismatch { .. })));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn empty_batches_are_a_no_op() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let outcome = temporal_merge(&mut table, &mut source(BASIC, vec![]), &config(MergeMode::MergeEntityPatch)).unwrap();
    assert!(outcome.plan.is_empty());
    assert!(outcome.feedback.is_empty());
    assert_eq!(table.rows().len(), 1);
}

#[test]
fn rows_with_bad_ranges_keep_their_entity_alive() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
        json!({"id": 2, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "B"}),
    ]);
    let mut src = source(
        BASIC,
        vec![
            json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
            json!({"row_id": 2, "id": 2, "valid_from": "2024-06-01", "valid_until": "2024-03-01", "name": "B-late"}),
        ],
    );
    let cfg = config(MergeMode::MergeEntityPatch).delete_mode(DeleteMode::DeleteMissingEntities);
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();

    assert_eq!(outcome.feedback_for(2).unwrap().status, FeedbackStatus::Error);
    assert_eq!(outcome.stats.deleted, 0);
    assert_eq!(timeline(&table, 2), vec![slice("[2024-01-01,2025-01-01)", "B")]);
}

#[test]
fn ambiguous_rows_keep_every_named_entity_alive() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "tax_ident": "111", "stat_ident": "S1", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "One"}),
        json!({"id": 2, "tax_ident": "222", "stat_ident": "S2", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "Two"}),
        json!({"id": 3, "tax_ident": "333", "stat_ident": "S3", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "Three"}),
    ]);
    let columns = ["row_id", "id", "tax_ident", "stat_ident", "valid_from", "valid_until", "name"];
    let mut src = source(
        &columns,
        vec![json!({"row_id": 1, "id": null, "tax_ident": "111", "stat_ident": "S2", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "Which"})],
    );
    let cfg = config(MergeMode::MergeEntityPatch)
        .natural_key(&["tax_ident"])
        .natural_key(&["stat_ident"])
        .delete_mode(DeleteMode::DeleteMissingEntities);
    let outcome = temporal_merge(&mut table, &mut src, &cfg).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().status, FeedbackStatus::Error);
    assert_eq!(outcome.stats, stats(0, 0, 1));
    assert_eq!(timeline(&table, 1), vec![slice("[2024-01-01,2025-01-01)", "One")]);
    assert_eq!(timeline(&table, 2), vec![slice("[2024-01-01,2025-01-01)", "Two")]);
    assert!(table.history("id", &json!(3)).is_empty());
}

#[test]
fn replace_for_portion_of_is_clipped_to_the_target() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
    ]);
    let mut src = source(
        BASIC,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-10-01", "valid_until": "2025-06-01", "name": "R"})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::ReplaceForPortionOf)).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().status, FeedbackStatus::Applied);
    assert_eq!(
        timeline(&table, 1),
        vec![
            slice("[2024-01-01,2024-10-01)", "A"),
            slice("[2024-10-01,2025-01-01)", "R"),
        ]
    );
}

#[test]
fn update_for_portion_of_overwrites_every_column() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "tax_ident": "111", "stat_ident": "S1", "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A", "employees": 10, "edit_comment": "seed"}),
    ]);
    let columns = [
        "row_id",
        "id",
        "tax_ident",
        "stat_ident",
        "valid_from",
        "valid_until",
        "name",
        "employees",
        "edit_comment",
    ];
    let mut src = source(
        &columns,
        vec![json!({"row_id": 1, "id": 1, "tax_ident": "111", "stat_ident": null, "valid_from": "2024-04-01", "valid_until": "2024-07-01", "name": "B", "employees": null, "edit_comment": "fix"})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::UpdateForPortionOf)).unwrap();

    assert_eq!(outcome.feedback_for(1).unwrap().status, FeedbackStatus::Applied);
    assert_eq!(outcome.stats, stats(2, 1, 0));
    let history = table.history("id", &json!(1));
    assert_eq!(history.len(), 3);
    let (range, middle) = &history[1];
    assert_eq!(range.to_string(), "[2024-04-01,2024-07-01)");
    assert_eq!(middle.get("name"), Some(&json!("B")));
    assert_eq!(middle.get("stat_ident"), Some(&Value::Null));
    assert_eq!(middle.get("employees"), Some(&Value::Null));
    assert_eq!(middle.get("edit_comment"), Some(&json!("fix")));
    let (_, last) = &history[2];
    assert_eq!(last.get("employees"), Some(&json!(10)));
    assert_eq!(last.get("stat_ident"), Some(&json!("S1")));
}

#[test]
fn upsert_writes_explicit_nulls() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A", "employees": 10}),
    ]);
    let mut src = source(
        &["row_id", "id", "valid_from", "valid_until", "name", "employees"],
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": null, "employees": null})],
    );
    let outcome = temporal_merge(&mut table, &mut src, &config(MergeMode::MergeEntityUpsert)).unwrap();

    assert_eq!(outcome.stats, stats(0, 1, 0));
    let row = &table.rows()[0];
    assert_eq!(row.get("employees"), Some(&Value::Null));
    assert_eq!(row.get("name"), Some(&json!("A")));
}

#[test]
fn delete_missing_timeline_and_entities_prunes_both() {
    let mut table = legal_unit_with(vec![
        json!({"id": 1, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "A"}),
        json!({"id": 2, "valid_from": "2024-01-01", "valid_until": "2025-01-01", "name": "B"}),
    ]);
    let mut src = source(
        BASIC,
        vec![json!({"row_id": 1, "id": 1, "valid_from": "2024-03-01", "valid_until": "2024-09-01", "name": "A"})],
    );
    let cfg = config(MergeMode::MergeEntityPatch).delete_mode(DeleteMode::DeleteMissingTimelineAndEntities);
    temporal_merge(&mut table, &mut src, &cfg).unwrap();

    assert_eq!(timeline(&table, 1), vec![slice("[2024-03-01,2024-09-01)", "A")]);
    assert!(table.history("id", &json!(2)).is_empty());
}

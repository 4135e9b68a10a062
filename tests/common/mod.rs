//! Shared fixtures: a `legal_unit` table with a date era and helpers for
//! building source batches.

#![allow(dead_code)]

use serde_json::Value;
use temporal_merge::{
    ColumnDescriptor, EraMetadata, MemoryTable, MergeConfig, MergeMode, RangeSubtype, Record,
    SourceRecords, UniqueKeyDescriptor, UniqueKeyKind,
};

pub fn rec(v: Value) -> Record {
    v.as_object().cloned().expect("object literal")
}

pub fn legal_unit_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new("id", "integer").generated_by_default(),
        ColumnDescriptor::new("tax_ident", "text"),
        ColumnDescriptor::new("stat_ident", "text"),
        ColumnDescriptor::new("valid_from", "date").not_null(),
        ColumnDescriptor::new("valid_until", "date").not_null(),
        ColumnDescriptor::new("name", "text").not_null(),
        ColumnDescriptor::new("employees", "integer"),
        ColumnDescriptor::new("edit_comment", "text"),
    ]
}

pub fn legal_unit() -> MemoryTable {
    MemoryTable::new(
        "legal_unit",
        EraMetadata::new("valid", RangeSubtype::Date),
        legal_unit_columns(),
    )
    .with_unique_key(UniqueKeyDescriptor::new("legal_unit_id_valid", &["id"], UniqueKeyKind::Primary))
    .with_unique_key(UniqueKeyDescriptor::new(
        "legal_unit_tax_ident_valid",
        &["tax_ident"],
        UniqueKeyKind::Natural,
    ))
}

/// A `legal_unit` table seeded with `rows`.
pub fn legal_unit_with(rows: Vec<Value>) -> MemoryTable {
    let mut table = legal_unit();
    table.seed(rows.into_iter().map(rec)).expect("seed rows");
    table
}

pub fn source(columns: &[&str], rows: Vec<Value>) -> SourceRecords {
    SourceRecords::new("legal_unit_source", columns).with_rows(rows.into_iter().map(rec))
}

pub fn config(mode: MergeMode) -> MergeConfig {
    MergeConfig::new("legal_unit", "legal_unit_source", &["id"])
        .mode(mode)
        .verify_plan(true)
}

/// `(range, name)` for every slice of entity `id`, in range order.
pub fn timeline(table: &MemoryTable, id: i64) -> Vec<(String, Value)> {
    table
        .history("id", &Value::from(id))
        .into_iter()
        .map(|(range, row)| (range.to_string(), row.get("name").cloned().unwrap_or(Value::Null)))
        .collect()
}

pub fn slice(range: &str, name: &str) -> (String, Value) {
    (range.to_string(), Value::String(name.to_string()))
}

//! In-process table and source implementations of the host traits.
//!
//! `MemoryTable` behaves like a temporal table with immediate uniqueness
//! checks: a write that would leave two slices of the same key overlapping
//! fails right away, the way a non-deferred exclusion constraint does.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::trace;

use crate::error::{ConfigError, MergeError, StoreError};
use crate::executor::{RowLocator, SourceTable, TargetStore};
use crate::introspect::{Catalog, ColumnDescriptor, Generated, UniqueKeyDescriptor};
use crate::range::{Bound, ValidRange};
use crate::reader::TargetFilter;
use crate::types::{EraMetadata, Record};
use crate::util::json_value_to_str;

#[derive(Debug, Clone)]
struct Snapshot {
    name: String,
    rows: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: String,
    era: EraMetadata,
    columns: Vec<ColumnDescriptor>,
    unique_keys: Vec<UniqueKeyDescriptor>,
    defaults: BTreeMap<String, Value>,
    rows: Vec<Record>,
    sequences: BTreeMap<String, i64>,
    savepoints: Vec<Snapshot>,
    savepoints_enabled: bool,
}

impl MemoryTable {
    pub fn new(name: &str, era: EraMetadata, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            era,
            columns,
            unique_keys: Vec::new(),
            defaults: BTreeMap::new(),
            rows: Vec::new(),
            sequences: BTreeMap::new(),
            savepoints: Vec::new(),
            savepoints_enabled: true,
        }
    }

    pub fn with_unique_key(mut self, key: UniqueKeyDescriptor) -> Self {
        self.unique_keys.push(key);
        self
    }

    /// Value used for a defaulted column the insert leaves out or NULL.
    pub fn with_column_default(mut self, column: &str, value: Value) -> Self {
        self.defaults.insert(column.to_string(), value);
        self
    }

    /// Behave like a host that cannot nest transactions.
    pub fn without_savepoints(mut self) -> Self {
        self.savepoints_enabled = false;
        self
    }

    pub fn era(&self) -> &EraMetadata {
        &self.era
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// Insert rows as-is through the normal checks.
    pub fn seed(&mut self, rows: impl IntoIterator<Item = Record>) -> Result<(), StoreError> {
        for row in rows {
            self.insert(&row)?;
        }
        Ok(())
    }

    /// Every slice whose `column` equals `value`, ordered by range.
    pub fn history(&self, column: &str, value: &Value) -> Vec<(ValidRange, Record)> {
        let mut slices: Vec<(ValidRange, Record)> = self
            .rows
            .iter()
            .filter(|r| r.get(column) == Some(value))
            .filter_map(|r| self.range_of(r).ok().map(|range| (range, r.clone())))
            .collect();
        slices.sort_by(|a, b| a.0.cmp(&b.0));
        slices
    }

    fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn range_of(&self, rec: &Record) -> Result<ValidRange, StoreError> {
        let subtype = Some(self.era.range_subtype);
        let bound = |col: &str| -> Result<Bound, StoreError> {
            Bound::from_json(rec.get(col).unwrap_or(&Value::Null), subtype)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .ok_or_else(|| StoreError::NotNull { column: col.to_string() })
        };
        let lower = bound(&self.era.valid_from_col)?;
        let upper = bound(&self.era.valid_until_col)?;
        ValidRange::new(lower, upper).map_err(|e| {
            StoreError::Backend(format!("new row for relation {} violates check constraint: {e}", self.name))
        })
    }

    fn next_value(&mut self, column: &str) -> Value {
        let seq = self.sequences.entry(column.to_string()).or_insert(0);
        *seq += 1;
        Value::from(*seq)
    }

    /// Keep an identity sequence ahead of explicitly supplied values.
    fn bump_sequence(&mut self, column: &str, value: &Value) {
        if let Some(n) = value.as_i64() {
            let seq = self.sequences.entry(column.to_string()).or_insert(0);
            *seq = (*seq).max(n);
        }
    }

    fn check_columns(&self, values: &Record) -> Result<(), StoreError> {
        for name in values.keys() {
            match self.column(name) {
                None => {
                    return Err(StoreError::Backend(format!(
                        "column {name} of relation {} does not exist",
                        self.name
                    )))
                }
                Some(c) if c.generated == Generated::Always => {
                    return Err(StoreError::Backend(format!(
                        "cannot insert a non-DEFAULT value into column {name}"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_not_null(&self, row: &Record) -> Result<(), StoreError> {
        for col in self.columns.iter().filter(|c| c.not_null) {
            if row.get(&col.name).map_or(true, Value::is_null) {
                return Err(StoreError::NotNull { column: col.name.clone() });
            }
        }
        Ok(())
    }

    /// Fail when `row` overlaps another row with the same key. `skip` is the
    /// position of the row being replaced, if any.
    fn check_unique(&self, row: &Record, skip: Option<usize>) -> Result<(), StoreError> {
        let range = self.range_of(row)?;
        let temporal = self.era.temporal_cols();
        for key in &self.unique_keys {
            let cols: Vec<&String> = key.columns.iter().filter(|c| !temporal.contains(c)).collect();
            let values: Vec<&Value> = cols.iter().map(|c| row.get(*c).unwrap_or(&Value::Null)).collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            for (i, other) in self.rows.iter().enumerate() {
                if Some(i) == skip {
                    continue;
                }
                let same = cols
                    .iter()
                    .zip(&values)
                    .all(|(c, v)| other.get(*c).unwrap_or(&Value::Null) == *v);
                if !same {
                    continue;
                }
                let other_range = self.range_of(other)?;
                if other_range.overlaps(&range) {
                    let shown: Vec<String> = values.iter().map(|v| json_value_to_str(v)).collect();
                    return Err(StoreError::ConstraintViolation {
                        constraint: key.name.clone(),
                        detail: format!(
                            "key ({})=({}) over {range} conflicts with existing {other_range}",
                            cols.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
                            shown.join(", "),
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Catalog for MemoryTable {
    fn era(&self, table: &str, era_name: &str) -> Result<EraMetadata, MergeError> {
        if table != self.name {
            return Err(ConfigError::UnknownTable(table.to_string()).into());
        }
        if era_name != self.era.era_name {
            return Err(ConfigError::UnknownEra {
                table: table.to_string(),
                era: era_name.to_string(),
            }
            .into());
        }
        Ok(self.era.clone())
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>, MergeError> {
        if table != self.name {
            return Err(ConfigError::UnknownTable(table.to_string()).into());
        }
        Ok(self.columns.clone())
    }

    fn unique_keys(&self, table: &str, era_name: &str) -> Result<Vec<UniqueKeyDescriptor>, MergeError> {
        Catalog::era(self, table, era_name)?;
        Ok(self.unique_keys.clone())
    }
}

impl TargetStore for MemoryTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn scan(&self, filter: &TargetFilter) -> Result<Vec<Record>, StoreError> {
        Ok(self.rows.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    fn insert(&mut self, values: &Record) -> Result<Record, StoreError> {
        self.check_columns(values)?;
        let mut row = Record::new();
        let columns = self.columns.clone();
        for col in &columns {
            let given = values.get(&col.name).filter(|v| !v.is_null()).cloned();
            let value = match (given, col.generated) {
                (Some(v), Generated::ByDefault) => {
                    self.bump_sequence(&col.name, &v);
                    v
                }
                (Some(v), _) => v,
                (None, Generated::ByDefault) => self.next_value(&col.name),
                (None, _) if col.has_default => self.defaults.get(&col.name).cloned().unwrap_or(Value::Null),
                (None, _) => Value::Null,
            };
            row.insert(col.name.clone(), value);
        }
        self.check_not_null(&row)?;
        self.check_unique(&row, None)?;
        trace!(table = self.name.as_str(), "insert");
        self.rows.push(row.clone());
        Ok(row)
    }

    fn update(&mut self, locator: &RowLocator, assignments: &Record) -> Result<u64, StoreError> {
        self.check_columns(assignments)?;
        let positions: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| locator.matches(r))
            .map(|(i, _)| i)
            .collect();
        for &i in &positions {
            let mut row = self.rows[i].clone();
            for (k, v) in assignments {
                row.insert(k.clone(), v.clone());
            }
            self.check_not_null(&row)?;
            self.check_unique(&row, Some(i))?;
            self.rows[i] = row;
        }
        Ok(positions.len() as u64)
    }

    fn delete(&mut self, locator: &RowLocator) -> Result<u64, StoreError> {
        let before = self.rows.len();
        self.rows.retain(|r| !locator.matches(r));
        Ok((before - self.rows.len()) as u64)
    }

    fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoints.push(Snapshot {
            name: name.to_string(),
            rows: self.rows.clone(),
        });
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    /// Restores the snapshot; the savepoint stays open. Sequences are not
    /// rewound, like a database sequence.
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.savepoints.truncate(pos + 1);
        self.rows = self.savepoints[pos].rows.clone();
        Ok(())
    }

    fn supports_savepoints(&self) -> bool {
        self.savepoints_enabled
    }
}

/// Source rows held in memory.
#[derive(Debug, Clone, Default)]
pub struct SourceRecords {
    name: String,
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Record>,
}

impl SourceRecords {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| ColumnDescriptor::untyped(c)).collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_columns(name: &str, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Record) {
        self.rows.push(row);
    }

    pub fn with_rows(mut self, rows: impl IntoIterator<Item = Record>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// The row carrying `row_id`, if any.
    pub fn row(&self, row_id_column: &str, row_id: i64) -> Option<&Record> {
        self.rows.iter().find(|r| row_id_of(r, row_id_column) == Some(row_id))
    }
}

fn row_id_of(rec: &Record, column: &str) -> Option<i64> {
    match rec.get(column)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl SourceTable for SourceRecords {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> Result<Vec<ColumnDescriptor>, MergeError> {
        Ok(self.columns.clone())
    }

    fn records(&self) -> Result<Vec<Record>, MergeError> {
        Ok(self.rows.clone())
    }

    fn write_back(&mut self, row_id_column: &str, row_id: i64, values: &Record) -> Result<(), StoreError> {
        if let Some(col) = values.keys().find(|k| !self.columns.iter().any(|c| &c.name == *k)) {
            return Err(StoreError::Backend(format!(
                "column {col} of relation {} does not exist",
                self.name
            )));
        }
        let row = self
            .rows
            .iter_mut()
            .find(|r| row_id_of(r, row_id_column) == Some(row_id))
            .ok_or_else(|| StoreError::RowNotFound(format!("{row_id_column}={row_id}")))?;
        for (k, v) in values {
            row.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

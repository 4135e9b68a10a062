use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;

use crate::error::{ConfigError, MergeError, RangeError};
use crate::introspect::{ColumnDescriptor, Generated};
use crate::range::{Bound, ValidRange};
use crate::types::{EraMetadata, PlannerContext, Record, SourceRow, TargetRow};
use crate::util::{build_key_for_cols, json_value_to_str, project};

// ── Column layout ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColCategory {
    Identity,
    Lookup,
    Data,
    Ephemeral,
    StablePk,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColMapping {
    pub col_name: String,
    pub category: ColCategory,
}

/// Which era inputs the source supplies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RangeInputs {
    pub range_col: Option<String>,
    pub from_col: Option<String>,
    pub until_col: Option<String>,
    pub to_col: Option<String>,
}

/// Column classification for both sides of a merge, resolved once per call
/// shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadLayout {
    pub source: Vec<ColMapping>,
    pub target: Vec<ColMapping>,
    pub source_range: RangeInputs,
    pub source_columns: Vec<String>,
}

impl ReadLayout {
    pub fn columns(&self, category: ColCategory, source: bool) -> impl Iterator<Item = &str> {
        let side = if source { &self.source } else { &self.target };
        side.iter()
            .filter(move |m| m.category == category)
            .map(|m| m.col_name.as_str())
    }
}

pub fn build_read_layout(
    ctx: &PlannerContext,
    source_cols: &[ColumnDescriptor],
    target_cols: &[ColumnDescriptor],
) -> ReadLayout {
    let target_names: Vec<String> = target_cols.iter().map(|c| c.name.clone()).collect();
    let generated: HashSet<&str> = target_cols
        .iter()
        .filter(|c| c.generated == Generated::Always)
        .map(|c| c.name.as_str())
        .collect();

    let mut source_only: HashSet<&str> = HashSet::new();
    source_only.insert(ctx.row_id_column.as_str());
    if let Some(fid) = &ctx.founding_id_column {
        source_only.insert(fid.as_str());
    }

    let source_names: Vec<String> = source_cols.iter().map(|c| c.name.clone()).collect();
    let source = build_column_layout(&source_names, ctx, &source_only, &generated, Some(&target_names));
    let target = build_column_layout(&target_names, ctx, &HashSet::new(), &generated, None);

    let era = &ctx.era;
    let present = |c: &Option<String>| c.clone().filter(|c| source_names.contains(c));
    let source_range = RangeInputs {
        range_col: present(&era.range_col),
        from_col: present(&Some(era.valid_from_col.clone())),
        until_col: present(&Some(era.valid_until_col.clone())),
        to_col: present(&era.valid_to_col).filter(|_| era.range_subtype.is_discrete()),
    };

    ReadLayout {
        source,
        target,
        source_range,
        source_columns: source_names,
    }
}

/// Classify each column into a category. Source data columns are restricted
/// to those that also exist on the target.
fn build_column_layout(
    table_cols: &[String],
    ctx: &PlannerContext,
    skip: &HashSet<&str>,
    generated: &HashSet<&str>,
    other_table_cols: Option<&[String]>,
) -> Vec<ColMapping> {
    let identity: HashSet<&str> = ctx.identity_columns.iter().map(String::as_str).collect();
    let lookup: HashSet<&str> = ctx.all_lookup_cols.iter().map(String::as_str).collect();
    let ephemeral: HashSet<&str> = ctx.ephemeral_columns.iter().map(String::as_str).collect();
    let temporal: HashSet<&str> = ctx.temporal_cols.iter().map(String::as_str).collect();
    let pk: HashSet<&str> = ctx.pk_cols.iter().map(String::as_str).collect();

    let mut layout = Vec::new();
    for col in table_cols {
        let name = col.as_str();
        if temporal.contains(name) || skip.contains(name) || generated.contains(name) {
            continue;
        }
        if let Some(other) = other_table_cols {
            if !other.contains(col) {
                continue;
            }
        }
        let category = if identity.contains(name) {
            ColCategory::Identity
        } else if lookup.contains(name) {
            ColCategory::Lookup
        } else if pk.contains(name) {
            ColCategory::StablePk
        } else if ephemeral.contains(name) {
            ColCategory::Ephemeral
        } else {
            ColCategory::Data
        };
        layout.push(ColMapping {
            col_name: col.clone(),
            category,
        });
    }
    layout
}

// ── Row conversion ──

/// A source row that could not take part in planning. Its keys still name
/// the entities it refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub row_id: i64,
    pub causal_id: String,
    pub identity_keys: Record,
    pub lookup_keys: Record,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub rows: Vec<SourceRow>,
    pub rejected: Vec<RejectedRow>,
}

impl SourceBatch {
    pub fn row_ids(&self) -> BTreeSet<i64> {
        self.rows
            .iter()
            .map(|r| r.row_id)
            .chain(self.rejected.iter().map(|r| r.row_id))
            .collect()
    }
}

fn read_row_id(rec: &Record, col: &str) -> Result<i64, ConfigError> {
    let invalid = |v: &Value| ConfigError::InvalidRowId {
        column: col.to_string(),
        value: v.to_string(),
    };
    match rec.get(col).unwrap_or(&Value::Null) {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid(&Value::String(s.clone()))),
        other => Err(invalid(other)),
    }
}

/// Read the validity range of a row from its range column, or from its
/// bound columns (`valid_to` standing in for a missing `valid_until`).
pub fn read_range(rec: &Record, inputs: &RangeInputs, era: &EraMetadata) -> Result<ValidRange, RangeError> {
    let subtype = Some(era.range_subtype);
    if let Some(rc) = &inputs.range_col {
        match rec.get(rc) {
            Some(Value::String(text)) => return ValidRange::parse(text, subtype),
            Some(Value::Null) | None => {}
            Some(other) => return Err(RangeError::Malformed(other.to_string())),
        }
    }
    let bound = |col: &Option<String>| -> Result<Option<Bound>, RangeError> {
        match col {
            Some(c) => Bound::from_json(rec.get(c).unwrap_or(&Value::Null), subtype),
            None => Ok(None),
        }
    };
    let lower = bound(&inputs.from_col)?
        .ok_or_else(|| RangeError::InvalidBound(format!("{} is null", era.valid_from_col)))?;
    let upper = match bound(&inputs.until_col)? {
        Some(u) => u,
        None => {
            let to = bound(&inputs.to_col)?.ok_or_else(|| {
                RangeError::InvalidBound(format!("{} is null", era.valid_until_col))
            })?;
            to.succ()
                .ok_or_else(|| RangeError::InvalidBound(format!("no successor for {to}")))?
        }
    };
    ValidRange::new(lower, upper)
}

fn split_payload(rec: &Record, layout: &[ColMapping]) -> [Record; 5] {
    let mut parts: [Record; 5] = Default::default();
    for m in layout {
        let slot = match m.category {
            ColCategory::Identity => 0,
            ColCategory::Lookup => 1,
            ColCategory::Data => 2,
            ColCategory::Ephemeral => 3,
            ColCategory::StablePk => 4,
        };
        let v = rec.get(&m.col_name).cloned().unwrap_or(Value::Null);
        parts[slot].insert(m.col_name.clone(), v);
    }
    parts
}

/// Convert source records into typed rows. Rows with an unusable range are
/// set aside for ERROR feedback; a missing or repeated row id is fatal.
pub fn read_source_rows(
    records: &[Record],
    layout: &ReadLayout,
    ctx: &PlannerContext,
) -> Result<SourceBatch, MergeError> {
    let mut batch = SourceBatch::default();
    let mut seen = BTreeSet::new();

    for rec in records {
        let row_id = read_row_id(rec, &ctx.row_id_column)?;
        if !seen.insert(row_id) {
            return Err(ConfigError::DuplicateRowId(row_id).into());
        }
        let founding_id = ctx
            .founding_id_column
            .as_ref()
            .and_then(|c| rec.get(c))
            .filter(|v| !v.is_null())
            .map(json_value_to_str);
        let causal_id = founding_id.clone().unwrap_or_else(|| row_id.to_string());

        let [identity_keys, lookup_keys, data_payload, ephemeral_payload, _] =
            split_payload(rec, &layout.source);
        let valid_range = match read_range(rec, &layout.source_range, &ctx.era) {
            Ok(r) => r,
            Err(e) => {
                batch.rejected.push(RejectedRow {
                    row_id,
                    causal_id,
                    identity_keys,
                    lookup_keys,
                    message: format!("invalid valid range for row_id {row_id}: {e}"),
                });
                continue;
            }
        };

        batch.rows.push(SourceRow {
            row_id,
            founding_id,
            causal_id,
            valid_range,
            identity_keys,
            lookup_keys,
            data_payload,
            ephemeral_payload,
        });
    }

    batch.rows.sort_by_key(|r| r.row_id);
    batch.rejected.sort_by_key(|r| r.row_id);
    Ok(batch)
}

/// Convert target records into typed rows. The target is expected to hold
/// only valid ranges; anything else is an invariant violation.
pub fn read_target_rows(
    records: &[Record],
    layout: &ReadLayout,
    ctx: &PlannerContext,
) -> Result<Vec<TargetRow>, MergeError> {
    let era = &ctx.era;
    let inputs = RangeInputs {
        range_col: None,
        from_col: Some(era.valid_from_col.clone()),
        until_col: Some(era.valid_until_col.clone()),
        to_col: None,
    };
    let mut rows = Vec::with_capacity(records.len());
    for rec in records {
        let valid_range = read_range(rec, &inputs, era).map_err(|e| {
            MergeError::invariant(format!("target {} holds an invalid range: {e}", ctx.target_table))
        })?;
        let [identity_keys, lookup_keys, data_payload, ephemeral_payload, pk_payload] =
            split_payload(rec, &layout.target);
        rows.push(TargetRow {
            valid_range,
            identity_keys,
            lookup_keys,
            data_payload,
            ephemeral_payload,
            pk_payload,
        });
    }
    Ok(rows)
}

// ── Target filter ──

/// Tuples of values for a column list; a row matches when its projection
/// equals one of them (NULL equal to NULL).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFilter {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl KeyFilter {
    pub fn matches(&self, rec: &Record) -> bool {
        self.values.iter().any(|tuple| {
            self.columns
                .iter()
                .zip(tuple)
                .all(|(c, v)| rec.get(c).unwrap_or(&Value::Null) == v)
        })
    }
}

/// Which target rows a merge needs to see.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetFilter {
    All,
    /// Rows matching any of the key filters.
    Keys(Vec<KeyFilter>),
}

impl TargetFilter {
    pub fn matches(&self, rec: &Record) -> bool {
        match self {
            Self::All => true,
            Self::Keys(filters) => filters.iter().any(|f| f.matches(rec)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::All => false,
            Self::Keys(filters) => filters.iter().all(|f| f.values.is_empty()),
        }
    }
}

fn collect_key_filter<'a>(
    columns: &[String],
    records: impl Iterator<Item = &'a Record>,
    require_all: bool,
) -> KeyFilter {
    let mut tuples: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for rec in records {
        let Some(key) = build_key_for_cols(rec, columns) else {
            continue;
        };
        let projected = project(rec, columns);
        if require_all && projected.values().any(Value::is_null) {
            continue;
        }
        tuples
            .entry(key)
            .or_insert_with(|| columns.iter().map(|c| projected[c].clone()).collect());
    }
    KeyFilter {
        columns: columns.to_vec(),
        values: tuples.into_values().collect(),
    }
}

/// Filter for the first read: every identity and natural key the source
/// mentions. Entity-deleting modes must see the whole target.
pub fn build_target_filter(batch: &SourceBatch, ctx: &PlannerContext) -> TargetFilter {
    if ctx.delete_mode.deletes_entities() {
        return TargetFilter::All;
    }
    let mut filters = vec![collect_key_filter(
        &ctx.identity_columns,
        batch.rows.iter().map(|r| &r.identity_keys),
        true,
    )];
    for set in &ctx.lookup_key_sets {
        filters.push(collect_key_filter(set, batch.rows.iter().map(|r| &r.lookup_keys), false));
    }
    filters.retain(|f| !f.values.is_empty());
    TargetFilter::Keys(filters)
}

/// Filter for the second read: every slice of the entities found by the
/// first, including slices whose natural key differs.
pub fn identity_filter(targets: &[TargetRow], ctx: &PlannerContext) -> TargetFilter {
    let filter = collect_key_filter(
        &ctx.identity_columns,
        targets.iter().map(|t| &t.identity_keys),
        false,
    );
    TargetFilter::Keys(vec![filter])
}

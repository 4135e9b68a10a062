//! Plan execution against a target store, with per-source-row feedback and
//! optional write-back to the source.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{info, trace, warn};

use crate::config::ExecutionMode;
use crate::error::{ConfigError, ErrorKind, MergeError, StoreError};
use crate::introspect::ColumnDescriptor;
use crate::range::{Bound, ValidRange};
use crate::reader::TargetFilter;
use crate::sweep::PlanOutput;
use crate::types::{FeedbackRow, FeedbackStatus, PlanAction, PlanRow, PlannerContext, Record};
use crate::util::project;

const MERGE_SAVEPOINT: &str = "temporal_merge";
const ENTITY_SAVEPOINT: &str = "temporal_merge_entity";

// ── Host collaborators ──

/// Locates one historical slice of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RowLocator {
    /// Identity and stable primary-key columns.
    pub keys: Record,
    pub valid_from_col: String,
    pub valid_from: Bound,
}

impl RowLocator {
    pub fn matches(&self, rec: &Record) -> bool {
        self.keys.iter().all(|(k, v)| rec.get(k).unwrap_or(&Value::Null) == v)
            && rec
                .get(&self.valid_from_col)
                .and_then(|v| Bound::from_json(v, self.valid_from.subtype()).ok().flatten())
                == Some(self.valid_from)
    }
}

/// Mutation primitives of the table being merged into. Constraints are the
/// store's business; a violation surfaces as a `StoreError`.
pub trait TargetStore {
    fn table_name(&self) -> &str;

    fn scan(&self, filter: &TargetFilter) -> Result<Vec<Record>, StoreError>;

    /// Insert a row and return it as stored, with defaults filled in.
    fn insert(&mut self, values: &Record) -> Result<Record, StoreError>;

    fn update(&mut self, locator: &RowLocator, assignments: &Record) -> Result<u64, StoreError>;

    fn delete(&mut self, locator: &RowLocator) -> Result<u64, StoreError>;

    fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    fn supports_savepoints(&self) -> bool {
        true
    }
}

/// The table or view the merge reads from.
pub trait SourceTable {
    fn name(&self) -> &str;

    fn columns(&self) -> Result<Vec<ColumnDescriptor>, MergeError>;

    fn records(&self) -> Result<Vec<Record>, MergeError>;

    fn write_back(&mut self, row_id_column: &str, row_id: i64, values: &Record) -> Result<(), StoreError>;
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert { values: Record },
    Update { locator: RowLocator, assignments: Record },
    Delete { locator: RowLocator },
}

fn missing(row: &PlanRow, what: &str) -> MergeError {
    MergeError::invariant(format!(
        "{} plan row {} has no {what}",
        row.operation.as_str(),
        row.plan_op_seq
    ))
}

fn locator(row: &PlanRow, ctx: &PlannerContext) -> Result<RowLocator, MergeError> {
    let old = row.old_valid_range.ok_or_else(|| missing(row, "old range"))?;
    let key_cols: Vec<String> = ctx
        .identity_columns
        .iter()
        .chain(ctx.pk_cols.iter())
        .cloned()
        .collect();
    Ok(RowLocator {
        keys: project(&row.entity_keys, &key_cols),
        valid_from_col: ctx.era.valid_from_col.clone(),
        valid_from: *old.lower(),
    })
}

/// Era columns written alongside a new or moved range.
fn era_values(range: &ValidRange, ctx: &PlannerContext) -> Record {
    let era = &ctx.era;
    let mut values = Record::new();
    values.insert(era.valid_from_col.clone(), range.lower().to_json());
    values.insert(era.valid_until_col.clone(), range.upper().to_json());
    if let Some(to_col) = &era.valid_to_col {
        if let Some(end) = range.inclusive_end() {
            values.insert(to_col.clone(), end.to_json());
        }
    }
    if let Some(range_col) = &era.range_col {
        values.insert(range_col.clone(), Value::String(range.to_string()));
    }
    values
}

/// Build the typed statement for a DML plan row. `assigned` is the identity
/// an earlier INSERT produced for the same new entity.
pub fn build_statement(
    row: &PlanRow,
    ctx: &PlannerContext,
    assigned: Option<&Record>,
) -> Result<Statement, MergeError> {
    match row.operation {
        PlanAction::Insert => {
            let range = row.new_valid_range.ok_or_else(|| missing(row, "new range"))?;
            let mut values: Record = row
                .entity_keys
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (k, v) in assigned.into_iter().flatten() {
                values.insert(k.clone(), v.clone());
            }
            for (k, v) in row.data.iter().flatten() {
                values.insert(k.clone(), v.clone());
            }
            values.retain(|k, v| {
                !ctx.generated_columns.contains(k)
                    && !(v.is_null() && ctx.defaulted_columns.contains(k))
            });
            values.extend(era_values(&range, ctx));
            Ok(Statement::Insert { values })
        }
        PlanAction::Update => {
            let locator = locator(row, ctx)?;
            let new = row.new_valid_range.ok_or_else(|| missing(row, "new range"))?;
            let mut assignments: Record = row
                .data
                .iter()
                .flatten()
                .filter(|(k, _)| {
                    !ctx.is_identity_col(k)
                        && !ctx.pk_cols.contains(*k)
                        && !ctx.generated_columns.contains(*k)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if row.old_valid_range != Some(new) {
                assignments.extend(era_values(&new, ctx));
            }
            Ok(Statement::Update { locator, assignments })
        }
        PlanAction::Delete => Ok(Statement::Delete { locator: locator(row, ctx)? }),
        other => Err(MergeError::invariant(format!(
            "{} is not an executable operation",
            other.as_str()
        ))),
    }
}

// ── Execution ──

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub stats: ExecutionStats,
    /// Identity assigned to each new entity, by grouping key.
    pub assigned: BTreeMap<String, Record>,
    /// Entities whose operations were rolled back, with the store's message.
    pub failed: BTreeMap<String, String>,
}

struct Runner<'a, S: TargetStore + ?Sized> {
    store: &'a mut S,
    ctx: &'a PlannerContext,
    report: ExecutionReport,
}

impl<S: TargetStore + ?Sized> Runner<'_, S> {
    fn apply(&mut self, row: &PlanRow) -> Result<(), StoreError> {
        let assigned = self.report.assigned.get(&row.grouping_key);
        let statement = build_statement(row, self.ctx, assigned)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        trace!(
            seq = row.plan_op_seq,
            statement = row.statement_seq,
            operation = row.operation.as_str(),
            entity = %row.grouping_key,
            "executing plan row"
        );
        match statement {
            Statement::Insert { values } => {
                let stored = self.store.insert(&values)?;
                self.report.stats.inserted += 1;
                if row.is_new_entity && !self.report.assigned.contains_key(&row.grouping_key) {
                    let identity = project(&stored, &self.ctx.identity_columns);
                    self.report.assigned.insert(row.grouping_key.clone(), identity);
                }
            }
            Statement::Update { locator, assignments } => {
                let n = self.store.update(&locator, &assignments)?;
                if n == 0 {
                    return Err(StoreError::RowNotFound(format!("{:?} at {}", locator.keys, locator.valid_from)));
                }
                self.report.stats.updated += 1;
            }
            Statement::Delete { locator } => {
                let n = self.store.delete(&locator)?;
                if n == 0 {
                    return Err(StoreError::RowNotFound(format!("{:?} at {}", locator.keys, locator.valid_from)));
                }
                self.report.stats.deleted += 1;
            }
        }
        Ok(())
    }
}

/// Apply the plan's DML rows in plan order.
///
/// Atomic execution stops at the first failure and rolls everything back.
/// Best-effort execution runs each entity's operations inside a savepoint
/// and rolls back only the entity that failed.
pub fn execute_plan<S: TargetStore + ?Sized>(
    store: &mut S,
    plan: &PlanOutput,
    ctx: &PlannerContext,
    execution: ExecutionMode,
) -> Result<ExecutionReport, MergeError> {
    let dml: Vec<&PlanRow> = plan.rows.iter().filter(|r| r.operation.is_dml()).collect();
    let savepoints = store.supports_savepoints();
    let mut runner = Runner { store, ctx, report: ExecutionReport::default() };

    match execution {
        ExecutionMode::Atomic => {
            if savepoints {
                runner.store.savepoint(MERGE_SAVEPOINT)?;
            }
            for row in &dml {
                if let Err(source) = runner.apply(row) {
                    if savepoints {
                        runner.store.rollback_to_savepoint(MERGE_SAVEPOINT)?;
                    }
                    return Err(MergeError::Execution {
                        entity: row.grouping_key.clone(),
                        source,
                    });
                }
            }
            if savepoints {
                runner.store.release_savepoint(MERGE_SAVEPOINT)?;
            }
        }
        ExecutionMode::BestEffort => {
            if !savepoints {
                return Err(ConfigError::SavepointsUnsupported.into());
            }
            let mut by_entity: BTreeMap<&str, Vec<&PlanRow>> = BTreeMap::new();
            for row in &dml {
                by_entity.entry(row.grouping_key.as_str()).or_default().push(row);
            }
            for (entity, rows) in by_entity {
                runner.store.savepoint(ENTITY_SAVEPOINT)?;
                let before = runner.report.stats.clone();
                let failure = rows.iter().find_map(|row| runner.apply(row).err());
                match failure {
                    Some(err) => {
                        runner.store.rollback_to_savepoint(ENTITY_SAVEPOINT)?;
                        warn!(entity, error = %err, "entity rolled back");
                        runner.report.stats = before;
                        runner.report.assigned.remove(entity);
                        runner.report.failed.insert(entity.to_string(), err.to_string());
                    }
                    None => runner.store.release_savepoint(ENTITY_SAVEPOINT)?,
                }
            }
        }
    }

    let report = runner.report;
    info!(
        table = ctx.target_table.as_str(),
        inserted = report.stats.inserted,
        updated = report.stats.updated,
        deleted = report.stats.deleted,
        failed_entities = report.failed.len(),
        "temporal merge executed"
    );
    Ok(report)
}

// ── Feedback ──

fn status_rank(status: FeedbackStatus) -> u8 {
    match status {
        FeedbackStatus::Error => 2,
        FeedbackStatus::Applied => 1,
        FeedbackStatus::Skipped => 0,
    }
}

/// One feedback row per source row: ERROR beats APPLIED beats SKIPPED.
pub fn build_feedback(
    plan: &PlanOutput,
    report: &ExecutionReport,
    row_ids: &BTreeSet<i64>,
    ctx: &PlannerContext,
) -> Vec<FeedbackRow> {
    let mut feedback: BTreeMap<i64, FeedbackRow> = row_ids
        .iter()
        .map(|&row_id| {
            let resolution = plan.resolutions.get(&row_id);
            let default_action = if ctx.mode.is_for_portion_of() {
                PlanAction::SkipNoTarget
            } else {
                PlanAction::SkipIdentical
            };
            let row = FeedbackRow {
                row_id,
                status: FeedbackStatus::Skipped,
                action: default_action,
                grouping_key: resolution.map(|r| r.grouping_key.clone()),
                assigned_identity: None,
                error: None,
                error_kind: None,
            };
            (row_id, row)
        })
        .collect();
    let mut touched: BTreeSet<i64> = BTreeSet::new();

    for plan_row in &plan.rows {
        let failed = report.failed.get(&plan_row.grouping_key);
        let (status, error, kind) = match (plan_row.operation, failed) {
            (PlanAction::Error, _) => (
                FeedbackStatus::Error,
                plan_row.error_message().map(str::to_string),
                Some(ErrorKind::Resolution),
            ),
            (op, Some(msg)) if op.is_dml() => {
                (FeedbackStatus::Error, Some(msg.clone()), Some(ErrorKind::Execution))
            }
            (op, _) => (op.feedback_status(), None, None),
        };
        for row_id in &plan_row.row_ids {
            let Some(fb) = feedback.get_mut(row_id) else {
                continue;
            };
            let first = touched.insert(*row_id);
            let better = status_rank(status) > status_rank(fb.status)
                || (status == fb.status && plan_row.operation < fb.action);
            if first || better {
                fb.status = status;
                fb.action = plan_row.operation;
                fb.error = error.clone();
                fb.error_kind = kind;
            }
        }
    }

    // Rows of an entity that failed as a whole share its error.
    for fb in feedback.values_mut() {
        let Some(gk) = fb.grouping_key.as_ref() else {
            continue;
        };
        if let Some(msg) = report.failed.get(gk) {
            fb.status = FeedbackStatus::Error;
            fb.action = PlanAction::Error;
            fb.error = Some(msg.clone());
            fb.error_kind = Some(ErrorKind::Execution);
        }
    }

    for fb in feedback.values_mut() {
        if fb.status == FeedbackStatus::Error {
            continue;
        }
        let Some(resolution) = plan.resolutions.get(&fb.row_id) else {
            continue;
        };
        fb.assigned_identity = if resolution.is_new_entity {
            report.assigned.get(&resolution.grouping_key).cloned()
        } else {
            resolution.identity.clone()
        };
    }

    feedback.into_values().collect()
}

/// Write assigned identities and/or feedback back into the source table.
pub fn write_back<T: SourceTable + ?Sized>(
    source: &mut T,
    feedback: &[FeedbackRow],
    ctx: &PlannerContext,
    with_identity: bool,
    status_col: Option<&str>,
    error_col: Option<&str>,
) -> Result<(), MergeError> {
    for fb in feedback {
        let mut values = Record::new();
        if with_identity {
            if let Some(identity) = &fb.assigned_identity {
                values.extend(identity.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        if let Some(col) = status_col {
            values.insert(col.to_string(), Value::String(fb.status.as_str().to_string()));
        }
        if let Some(col) = error_col {
            values.insert(col.to_string(), fb.error.clone().map(Value::String).unwrap_or(Value::Null));
        }
        if !values.is_empty() {
            source.write_back(&ctx.row_id_column, fb.row_id, &values)?;
        }
    }
    Ok(())
}

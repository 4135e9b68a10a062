//! Temporal merge: plan and apply a batch of source rows against a
//! valid-time table.
//!
//! The planner reads the source batch and the affected slices of the target,
//! rebuilds each entity's timeline, and emits the minimal ordered list of
//! INSERT/UPDATE/DELETE operations that makes the target reflect the source
//! under the chosen [`MergeMode`]. The executor applies that plan through a
//! [`TargetStore`] and reports one [`FeedbackRow`] per source row.
//!
//! ```ignore
//! let config = MergeConfig::new("legal_unit", "legal_unit_source", &["id"])
//!     .natural_key(&["tax_ident"])
//!     .mode(MergeMode::MergeEntityPatch);
//! let outcome = temporal_merge(&mut table, &mut source, &config)?;
//! ```

#[cfg(feature = "pg")]
pgrx::pg_module_magic!();

pub mod allen;
pub mod cache;
pub mod config;
pub mod coverage;
pub mod error;
pub mod executor;
pub mod introspect;
pub mod memory;
pub mod plan;
pub mod policy;
pub mod range;
pub mod reader;
pub mod resolver;
pub mod sweep;
pub mod timeline;
pub mod types;
pub mod util;

#[cfg(feature = "pg")]
pub mod pg;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

pub use allen::AllenRelation;
pub use cache::{PlanCache, Prepared};
pub use config::{ExecutionMode, MergeConfig};
pub use error::{ConfigError, ErrorKind, MergeError, RangeError, StoreError};
pub use executor::{ExecutionStats, RowLocator, SourceTable, Statement, TargetStore};
pub use introspect::{Catalog, ColumnDescriptor, Generated, UniqueKeyDescriptor, UniqueKeyKind};
pub use memory::{MemoryTable, SourceRecords};
pub use range::{Bound, RangeSubtype, ValidRange};
pub use sweep::PlanOutput;
pub use types::{
    DeleteMode, EraMetadata, FeedbackRow, FeedbackStatus, MergeMode, PlanAction, PlanRow, Record,
    UpdateEffect,
};

use reader::{build_target_filter, identity_filter, read_source_rows, read_target_rows, TargetFilter};
use types::{PlannerContext, TargetRow};

/// Result of a merge call.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Plan rows in execution order.
    pub plan: Vec<PlanRow>,
    /// One row per source row, ordered by row id.
    pub feedback: Vec<FeedbackRow>,
    pub stats: ExecutionStats,
}

impl MergeOutcome {
    pub fn feedback_for(&self, row_id: i64) -> Option<&FeedbackRow> {
        self.feedback.iter().find(|f| f.row_id == row_id)
    }
}

/// Runs merges, optionally reusing prepared call shapes across calls.
#[derive(Debug, Default)]
pub struct Merger {
    cache: Option<PlanCache>,
}

struct PlannedCall {
    prepared: Arc<Prepared>,
    output: PlanOutput,
    row_ids: BTreeSet<i64>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache() -> Self {
        Self {
            cache: Some(PlanCache::new()),
        }
    }

    pub fn cache(&self) -> Option<&PlanCache> {
        self.cache.as_ref()
    }

    /// Plan without touching the target.
    pub fn plan<H, T>(&mut self, target: &H, source: &T, config: &MergeConfig) -> Result<PlanOutput, MergeError>
    where
        H: Catalog + TargetStore + ?Sized,
        T: SourceTable + ?Sized,
    {
        Ok(self.plan_call(target, source, config)?.output)
    }

    /// Plan, execute, and report feedback; writes back to the source when
    /// the configuration asks for it.
    pub fn merge<H, T>(
        &mut self,
        target: &mut H,
        source: &mut T,
        config: &MergeConfig,
    ) -> Result<MergeOutcome, MergeError>
    where
        H: Catalog + TargetStore + ?Sized,
        T: SourceTable + ?Sized,
    {
        let PlannedCall { prepared, output, row_ids } = self.plan_call(&*target, &*source, config)?;
        let ctx = &prepared.ctx;

        let report = executor::execute_plan(target, &output, ctx, config.execution)?;
        let feedback = executor::build_feedback(&output, &report, &row_ids, ctx);

        if config.update_source_with_identity || config.update_source_with_feedback {
            let (status_col, error_col) = if config.update_source_with_feedback {
                (
                    Some(config.feedback_status_column.as_str()),
                    Some(config.feedback_error_column.as_str()),
                )
            } else {
                (None, None)
            };
            executor::write_back(
                source,
                &feedback,
                ctx,
                config.update_source_with_identity,
                status_col,
                error_col,
            )?;
        }

        Ok(MergeOutcome {
            plan: output.rows,
            feedback,
            stats: report.stats,
        })
    }

    fn prepare<H, T>(&mut self, target: &H, source: &T, config: &MergeConfig) -> Result<Arc<Prepared>, MergeError>
    where
        H: Catalog + ?Sized,
        T: SourceTable + ?Sized,
    {
        config.validate()?;
        let era = target.era(&config.target_table, &config.era_name)?;
        let target_cols = target.columns(&config.target_table)?;
        let source_cols = source.columns()?;
        let unique_keys = target.unique_keys(&config.target_table, &config.era_name)?;
        match self.cache.as_mut() {
            Some(cache) => cache.get_or_prepare(config, era, &target_cols, &source_cols, &unique_keys),
            None => cache::prepare(config, era, &target_cols, &source_cols, &unique_keys).map(Arc::new),
        }
    }

    fn plan_call<H, T>(&mut self, target: &H, source: &T, config: &MergeConfig) -> Result<PlannedCall, MergeError>
    where
        H: Catalog + TargetStore + ?Sized,
        T: SourceTable + ?Sized,
    {
        let prepared = self.prepare(target, source, config)?;
        let ctx = &prepared.ctx;

        let records = source.records()?;
        let batch = read_source_rows(&records, &prepared.layout, ctx)?;
        let row_ids = batch.row_ids();
        let targets = read_targets(target, &batch, &prepared, ctx)?;

        let output = sweep::sweep_line_plan(batch, targets, ctx)?;
        Ok(PlannedCall {
            prepared,
            output,
            row_ids,
        })
    }
}

fn scan<H: TargetStore + ?Sized>(
    target: &H,
    filter: &TargetFilter,
    prepared: &Prepared,
    ctx: &PlannerContext,
) -> Result<Vec<TargetRow>, MergeError> {
    if filter.is_empty() {
        return Ok(Vec::new());
    }
    let records = target.scan(filter)?;
    read_target_rows(&records, &prepared.layout, ctx)
}

/// Read the target slices the batch can affect: first by the keys the
/// source mentions, then by the identities that read discovered.
fn read_targets<H: TargetStore + ?Sized>(
    target: &H,
    batch: &reader::SourceBatch,
    prepared: &Prepared,
    ctx: &PlannerContext,
) -> Result<Vec<TargetRow>, MergeError> {
    let filter = build_target_filter(batch, ctx);
    let first = scan(target, &filter, prepared, ctx)?;
    if filter == TargetFilter::All || first.is_empty() {
        return Ok(first);
    }
    let by_identity = identity_filter(&first, ctx);
    let rows = scan(target, &by_identity, prepared, ctx)?;
    debug!(
        matched = first.len(),
        slices = rows.len(),
        "target read"
    );
    Ok(rows)
}

/// Plan a merge of `source` into `target` without applying it.
pub fn plan<H, T>(target: &H, source: &T, config: &MergeConfig) -> Result<PlanOutput, MergeError>
where
    H: Catalog + TargetStore + ?Sized,
    T: SourceTable + ?Sized,
{
    Merger::new().plan(target, source, config)
}

/// Merge `source` into `target` and return the plan and per-row feedback.
pub fn temporal_merge<H, T>(target: &mut H, source: &mut T, config: &MergeConfig) -> Result<MergeOutcome, MergeError>
where
    H: Catalog + TargetStore + ?Sized,
    T: SourceTable + ?Sized,
{
    Merger::new().merge(target, source, config)
}

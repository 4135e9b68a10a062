use std::collections::BTreeMap;

use tracing::debug;

use crate::error::MergeError;
use crate::plan::{
    early_feedback_row, plan_entity, rejected_row, sequence_statements, verify_entity_plan,
};
use crate::policy::{filter_by_mode, needs_planning};
use crate::reader::SourceBatch;
use crate::resolver::{correlate_entities, detect_eclipsed, group_by_entity, mentioned_entities};
use crate::timeline::reconstruct;
use crate::types::*;

/// Result of planning one merge.
#[derive(Debug, Clone, Default)]
pub struct PlanOutput {
    /// Plan rows in execution order.
    pub rows: Vec<PlanRow>,
    /// Where every readable source row resolved to, by row_id.
    pub resolutions: BTreeMap<i64, RowResolution>,
}

/// Main entry point: run the sweep-line algorithm over source and target rows.
pub fn sweep_line_plan(
    batch: SourceBatch,
    target_rows: Vec<TargetRow>,
    ctx: &PlannerContext,
) -> Result<PlanOutput, MergeError> {
    let source_count = batch.rows.len();
    let target_count = target_rows.len();

    // Phase 1: match source rows to target entities
    let mut matched = correlate_entities(batch.rows, &target_rows, ctx);

    // Phase 2: Mode filtering and eclipse detection
    filter_by_mode(&mut matched, ctx);
    detect_eclipsed(&mut matched);

    // Phase 3: Group by entity
    let mentioned = mentioned_entities(&matched, &batch.rejected, &target_rows, ctx);
    let groups = group_by_entity(&matched, &mentioned, target_rows, ctx);

    // Phase 4: Per-entity timeline reconstruction and diff
    let mut rows: Vec<PlanRow> = Vec::new();
    for group in groups.values().filter(|g| needs_planning(g, ctx)) {
        let segments = reconstruct(group, ctx)?;
        rows.extend(plan_entity(group, &segments, ctx));
    }
    rows.extend(matched.iter().filter_map(|m| early_feedback_row(m, ctx)));
    rows.extend(batch.rejected.iter().map(rejected_row));

    // Phase 5: Statement sequencing
    sequence_statements(&mut rows);

    if ctx.verify_plan {
        for group in groups.values().filter(|g| needs_planning(g, ctx)) {
            let entity_rows = rows
                .iter()
                .filter(|r| r.operation.is_dml() && r.grouping_key == group.grouping_key);
            verify_entity_plan(group, entity_rows, ctx)?;
        }
    }

    let resolutions = matched
        .into_iter()
        .map(|m| {
            let resolution = RowResolution {
                grouping_key: m.grouping_key,
                is_new_entity: m.is_new_entity,
                identity: m.identity,
            };
            (m.source.row_id, resolution)
        })
        .collect();

    debug!(
        sources = source_count,
        targets = target_count,
        groups = groups.len(),
        plan_rows = rows.len(),
        "temporal merge planned"
    );
    Ok(PlanOutput { rows, resolutions })
}

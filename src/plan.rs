//! Plan construction: diff each entity's reconstructed timeline against its
//! target rows, then order every entity's operations into one executable
//! sequence.

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::allen::relation;
use crate::coverage::{find_overlap, Multirange};
use crate::error::MergeError;
use crate::policy::{self, Side};
use crate::range::ValidRange;
use crate::reader::RejectedRow;
use crate::types::{
    CoalescedSegment, EntityGroup, MatchedSourceRow, MergeMode, PlanAction, PlanRow,
    PlannerContext, Record, UpdateEffect,
};
use crate::util::{maps_equal_ignoring_nulls, overlay, project};

// ── Entity keys ──

fn group_lookup_keys(group: &EntityGroup, ctx: &PlannerContext) -> Record {
    ctx.all_lookup_cols
        .iter()
        .map(|col| {
            let v = group
                .identity_keys
                .get(col)
                .filter(|v| !v.is_null())
                .or_else(|| group.lookup_keys.get(col))
                .cloned()
                .unwrap_or(Value::Null);
            (col.clone(), v)
        })
        .collect()
}

fn entity_keys(identity: &Record, lookup: &Record, pk: Option<&Record>) -> Record {
    let mut keys = identity.clone();
    for (k, v) in lookup.iter().chain(pk.into_iter().flatten()) {
        keys.entry(k.clone()).or_insert_with(|| v.clone());
    }
    keys
}

// ── Diff and classification ──

/// Position of each segment among the segments descending from the same
/// target row. The one that starts where the target starts and keeps its
/// payload ranks first and becomes the UPDATE; the rest are INSERTs.
fn update_ranks(segments: &[CoalescedSegment], group: &EntityGroup) -> Vec<usize> {
    let mut by_ancestor: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, seg) in segments.iter().enumerate() {
        if let Some(a) = seg.ancestor {
            by_ancestor.entry(a).or_default().push(i);
        }
    }
    let mut ranks = vec![1; segments.len()];
    for (ancestor, mut indices) in by_ancestor {
        let target = &group.targets[ancestor];
        indices.sort_by_key(|&i| {
            let seg = &segments[i];
            (
                Reverse(seg.valid_range.lower() == target.valid_range.lower()),
                Reverse(maps_equal_ignoring_nulls(&seg.data_payload, &target.data_payload)),
                *seg.valid_range.lower(),
                *seg.valid_range.upper(),
            )
        });
        for (rank, i) in indices.into_iter().enumerate() {
            ranks[i] = rank + 1;
        }
    }
    ranks
}

/// Plan rows for one entity. Untouched target rows produce nothing.
pub fn plan_entity(
    group: &EntityGroup,
    segments: &[CoalescedSegment],
    ctx: &PlannerContext,
) -> Vec<PlanRow> {
    let lookup_keys = group_lookup_keys(group, ctx);
    let identity_keys = project(&group.identity_keys, &ctx.identity_columns);
    let ranks = update_ranks(segments, group);
    let mut matched_targets = vec![false; group.targets.len()];
    let mut rows = Vec::new();

    for (seg, rank) in segments.iter().zip(ranks) {
        let target = seg.ancestor.map(|i| (i, &group.targets[i]));
        if let Some((i, _)) = target {
            matched_targets[i] = true;
        }
        let before = target.map(|(_, t)| Side {
            range: &t.valid_range,
            data: &t.data_payload,
            ephemeral: &t.ephemeral_payload,
        });
        let after = Side {
            range: &seg.valid_range,
            data: &seg.data_payload,
            ephemeral: &seg.ephemeral_payload,
        };
        let (operation, update_effect) = policy::classify(before, Some(after), rank);
        if operation == PlanAction::SkipIdentical && !seg.has_source_coverage {
            continue;
        }

        let mut row = PlanRow::blank(operation, &group.grouping_key);
        row.row_ids = seg.row_ids.clone();
        row.update_effect = update_effect;
        row.causal_id = group.causal_id.clone();
        row.is_new_entity = group.is_new_entity;
        row.entity_keys = entity_keys(&identity_keys, &lookup_keys, target.map(|(_, t)| &t.pk_payload));
        row.identity_keys = identity_keys.clone();
        row.lookup_keys = lookup_keys.clone();
        row.s_t_relation = seg.s_t_relation;
        row.old_valid_range = target.map(|(_, t)| t.valid_range);
        row.b_a_relation = target.map(|(_, t)| relation(&t.valid_range, &seg.valid_range));
        row.new_valid_range = Some(seg.valid_range);
        row.data = Some(overlay(&seg.data_payload, &seg.ephemeral_payload));
        if ctx.log_trace {
            row.trace = Some(json!({
                "grouping_key": group.grouping_key,
                "segment": seg.valid_range.to_string(),
                "ancestor": target.map(|(_, t)| t.valid_range.to_string()),
                "update_rank": rank,
                "has_source_coverage": seg.has_source_coverage,
                "changes_target": seg.changes_target,
                "data_hash": format!("{:016x}", seg.data_hash),
            }));
        }
        rows.push(row);
    }

    for (i, tr) in group.targets.iter().enumerate() {
        if matched_targets[i] {
            continue;
        }
        let mut row = PlanRow::blank(PlanAction::Delete, &group.grouping_key);
        row.row_ids = group
            .sources
            .iter()
            .filter(|s| s.valid_range.overlaps(&tr.valid_range))
            .map(|s| s.row_id)
            .collect();
        row.is_new_entity = group.is_new_entity;
        row.entity_keys = entity_keys(&identity_keys, &lookup_keys, Some(&tr.pk_payload));
        row.identity_keys = identity_keys.clone();
        row.lookup_keys = lookup_keys.clone();
        row.old_valid_range = Some(tr.valid_range);
        if ctx.log_trace {
            row.trace = Some(json!({
                "grouping_key": group.grouping_key,
                "deleted": tr.valid_range.to_string(),
                "entity_present_in_source": group.present_in_source,
            }));
        }
        rows.push(row);
    }
    rows
}

// ── Rows that never reached the timeline ──

/// Plan row reporting a source row settled before planning (error, filter
/// or eclipse).
pub fn early_feedback_row(m: &MatchedSourceRow, ctx: &PlannerContext) -> Option<PlanRow> {
    let fb = m.early_feedback.as_ref()?;
    let mut row = PlanRow::blank(fb.action, &m.grouping_key);
    row.row_ids = vec![m.source.row_id];
    row.causal_id = Some(m.source.causal_id.clone());
    row.is_new_entity = m.is_new_entity;

    let mut identity = project(&m.source.identity_keys, &ctx.identity_columns);
    if let Some(found) = &m.identity {
        for (k, v) in found {
            if identity.get(k).map_or(true, Value::is_null) {
                identity.insert(k.clone(), v.clone());
            }
        }
    }
    let lookup = project(&m.source.lookup_keys, &ctx.all_lookup_cols);
    row.entity_keys = entity_keys(&identity, &lookup, None);
    row.identity_keys = identity;
    row.lookup_keys = lookup;
    let feedback = match fb.action {
        PlanAction::Error => json!({ "error": fb.message.clone().unwrap_or_default() }),
        PlanAction::SkipEclipsed => {
            row.new_valid_range = Some(m.source.valid_range);
            json!({ "info": "Source row is fully covered by newer source rows for the same entity." })
        }
        _ => json!({
            "info": "Source row was filtered by the mode's logic and did not result in a DML operation."
        }),
    };
    row.feedback = Some(feedback);
    Some(row)
}

/// Plan row for a source row rejected while reading.
pub fn rejected_row(rejected: &RejectedRow) -> PlanRow {
    let mut row = PlanRow::blank(PlanAction::Error, &format!("error__row={}", rejected.row_id));
    row.row_ids = vec![rejected.row_id];
    row.causal_id = Some(rejected.causal_id.clone());
    row.feedback = Some(json!({ "error": rejected.message }));
    row
}

// ── Global ordering ──

/// Execution phase: deletes, then updates by growing effect, then inserts.
/// Non-DML rows come last.
fn phase(row: &PlanRow) -> u8 {
    match (row.operation, row.update_effect) {
        (PlanAction::Delete, _) => 1,
        (PlanAction::Update, Some(UpdateEffect::Move)) => 3,
        (PlanAction::Update, Some(UpdateEffect::Grow)) => 4,
        (PlanAction::Update, _) => 2,
        (PlanAction::Insert, _) => 5,
        _ => 6,
    }
}

fn anchor(row: &PlanRow) -> Option<ValidRange> {
    row.old_valid_range.or(row.new_valid_range)
}

fn execution_order(a: &PlanRow, b: &PlanRow) -> Ordering {
    phase(a)
        .cmp(&phase(b))
        .then_with(|| a.update_effect.cmp(&b.update_effect))
        .then_with(|| {
            if phase(a) == 6 {
                return a.row_ids.first().cmp(&b.row_ids.first());
            }
            if phase(a) == 3 {
                // Moves run from the latest old range backwards.
                let lower = |r: &PlanRow| anchor(r).map(|v| *v.lower());
                return lower(b).cmp(&lower(a));
            }
            Ordering::Equal
        })
        .then_with(|| a.grouping_key.cmp(&b.grouping_key))
        .then_with(|| {
            let lower = |r: &PlanRow| anchor(r).map(|v| *v.lower());
            lower(a).cmp(&lower(b))
        })
        .then_with(|| {
            let lower = |r: &PlanRow| r.new_valid_range.map(|v| *v.lower());
            lower(a).cmp(&lower(b))
        })
        .then_with(|| a.row_ids.first().cmp(&b.row_ids.first()))
}

/// Sort rows into execution order and number them. Rows of one phase share
/// a statement, except that every MOVE is a statement of its own.
pub fn sequence_statements(rows: &mut [PlanRow]) {
    rows.sort_by(execution_order);

    let mut statement = 0i32;
    let mut last_phase = None;
    for (i, row) in rows.iter_mut().enumerate() {
        row.plan_op_seq = i as i64 + 1;
        let p = phase(row);
        if last_phase != Some(p) || p == 3 {
            statement += 1;
            last_phase = Some(p);
        }
        row.statement_seq = statement;
    }
}

// ── Verification ──

fn union_of<'a>(ranges: impl IntoIterator<Item = &'a ValidRange>) -> Multirange {
    ranges.into_iter().copied().collect()
}

/// Coverage the mode promises for an entity once its operations ran.
pub fn expected_coverage(group: &EntityGroup, ctx: &PlannerContext) -> Multirange {
    let targets = union_of(group.targets.iter().map(|t| &t.valid_range));
    let sources = union_of(group.sources.iter().map(|s| &s.valid_range));
    if group.sources.is_empty() {
        if !group.present_in_source && ctx.delete_mode.deletes_entities() {
            return Multirange::new();
        }
        return targets;
    }
    let base = if ctx.mode == MergeMode::DeleteForPortionOf {
        targets.difference(&sources)
    } else if ctx.mode.is_for_portion_of() {
        targets.clone()
    } else {
        targets.union(&sources)
    };
    if ctx.delete_mode.deletes_timeline() {
        base.difference(&base.difference(&sources))
    } else {
        base
    }
}

/// Replay one entity's operations in plan order, checking that no two rows
/// ever overlap and that the end state covers what the mode promises.
pub fn verify_entity_plan<'a>(
    group: &EntityGroup,
    rows: impl IntoIterator<Item = &'a PlanRow>,
    ctx: &PlannerContext,
) -> Result<(), MergeError> {
    let mut state: Vec<ValidRange> = group.targets.iter().map(|t| t.valid_range).collect();

    for row in rows {
        match row.operation {
            PlanAction::Delete | PlanAction::Update => {
                let old = row.old_valid_range.ok_or_else(|| {
                    MergeError::invariant(format!("plan row {} has no old range", row.plan_op_seq))
                })?;
                let pos = state.iter().position(|r| *r == old).ok_or_else(|| {
                    MergeError::invariant(format!(
                        "plan row {} targets {} which entity {} no longer has",
                        row.plan_op_seq, old, group.grouping_key
                    ))
                })?;
                state.remove(pos);
                if row.operation == PlanAction::Update {
                    if let Some(new) = row.new_valid_range {
                        state.push(new);
                    }
                }
            }
            PlanAction::Insert => {
                if let Some(new) = row.new_valid_range {
                    state.push(new);
                }
            }
            _ => continue,
        }
        if let Some((a, b)) = find_overlap(&state) {
            return Err(MergeError::invariant(format!(
                "plan row {} leaves entity {} with overlapping ranges {} and {}",
                row.plan_op_seq, group.grouping_key, a, b
            )));
        }
    }

    let actual = union_of(&state);
    let expected = expected_coverage(group, ctx);
    if actual != expected {
        return Err(MergeError::invariant(format!(
            "entity {} would end up covering {:?} instead of {:?}",
            group.grouping_key,
            actual.spans().iter().map(ToString::to_string).collect::<Vec<_>>(),
            expected.spans().iter().map(ToString::to_string).collect::<Vec<_>>(),
        )));
    }
    Ok(())
}

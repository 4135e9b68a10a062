//! Merge-mode policy: which rows take part, how payloads combine, which
//! segments survive, and how a diffed segment maps to an operation.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::range::ValidRange;
use crate::types::{
    EarlyFeedback, EntityGroup, MatchedSourceRow, MergeMode, PlanAction, PlannerContext, Record,
    SourceRow, UpdateEffect,
};
use crate::util::maps_equal_ignoring_nulls;

// ── Mode filtering ──

/// For-portion-of modes never found entities; INSERT_NEW_ENTITIES never
/// touches existing ones.
pub fn filter_by_mode(matched: &mut [MatchedSourceRow], ctx: &PlannerContext) {
    for m in matched.iter_mut().filter(|m| m.early_feedback.is_none()) {
        if ctx.mode.is_for_portion_of() && m.is_new_entity {
            m.early_feedback = Some(EarlyFeedback::skip(PlanAction::SkipNoTarget));
        } else if ctx.mode == MergeMode::InsertNewEntities && !m.is_new_entity {
            m.early_feedback = Some(EarlyFeedback::skip(PlanAction::SkipFiltered));
        }
    }
}

/// Whether the group needs planning at all.
pub fn needs_planning(group: &EntityGroup, ctx: &PlannerContext) -> bool {
    if !group.sources.is_empty() {
        return true;
    }
    !group.present_in_source && ctx.delete_mode.deletes_entities()
}

// ── Payload merging ──

fn overlay_source(
    merged: &mut Record,
    payload: &Record,
    strip_all_nulls: bool,
    exclude_if_null: &BTreeSet<String>,
) {
    for (k, v) in payload {
        if v.is_null() && (strip_all_nulls || exclude_if_null.contains(k)) {
            continue;
        }
        merged.insert(k.clone(), v.clone());
    }
}

/// Data payload for a slice covered by `sources` (ascending row_id) and
/// optionally by a target row. `None` marks a slice the mode deletes.
///
/// PATCH overlays non-NULL source fields onto the target; UPSERT lets
/// explicit NULLs through; the replace family takes the newest source row
/// wholesale. NULLs for NOT NULL or defaulted columns never overwrite.
pub fn merge_payload(
    mode: MergeMode,
    target: Option<&Record>,
    sources: &[&SourceRow],
    exclude_if_null: &BTreeSet<String>,
) -> Option<Record> {
    if mode == MergeMode::DeleteForPortionOf && !sources.is_empty() {
        return None;
    }
    let mut merged = target.cloned().unwrap_or_default();
    if mode.is_patch() {
        for sr in sources {
            overlay_source(&mut merged, &sr.data_payload, true, exclude_if_null);
        }
    } else if mode.is_replace() {
        if let Some(last) = sources.last() {
            overlay_source(&mut merged, &last.data_payload, false, exclude_if_null);
        }
    } else {
        for sr in sources {
            overlay_source(&mut merged, &sr.data_payload, false, exclude_if_null);
        }
    }
    Some(merged)
}

/// Ephemeral values for a slice. Unchanged data keeps the target's
/// ephemeral values; changed data takes the winning source's on top.
pub fn merge_ephemeral(
    ctx: &PlannerContext,
    target: Option<&Record>,
    winner: Option<&SourceRow>,
    changes_target: bool,
) -> Record {
    let mut merged = target.cloned().unwrap_or_default();
    if !changes_target {
        return merged;
    }
    if let Some(sr) = winner {
        overlay_source(
            &mut merged,
            &sr.ephemeral_payload,
            ctx.mode.is_patch(),
            &ctx.exclude_if_null_columns,
        );
    }
    merged
}

// ── Segment retention ──

/// Whether an atomic slice with the given coverage belongs to the final
/// timeline of `group`.
pub fn retain_segment(
    ctx: &PlannerContext,
    group: &EntityGroup,
    has_source: bool,
    has_target: bool,
) -> bool {
    match (has_source, has_target) {
        (false, false) => false,
        // Surgical modes never extend the timeline.
        (true, false) => !ctx.mode.is_for_portion_of(),
        (true, true) => ctx.mode != MergeMode::DeleteForPortionOf,
        (false, true) => {
            if group.sources.is_empty() {
                !(ctx.delete_mode.deletes_entities() && !group.present_in_source)
            } else {
                !ctx.delete_mode.deletes_timeline()
            }
        }
    }
}

/// Source row ids credited with a slice.
pub fn attribute_rows(mode: MergeMode, sources: &[&SourceRow]) -> Vec<i64> {
    if mode.is_last_writer_wins() {
        sources.last().map(|s| vec![s.row_id]).unwrap_or_default()
    } else {
        sources.iter().map(|s| s.row_id).collect()
    }
}

// ── Classification ──

pub fn update_effect(old: &ValidRange, new: &ValidRange) -> UpdateEffect {
    let from = new.lower().cmp(old.lower());
    let until = new.upper().cmp(old.upper());
    match (from, until) {
        (Ordering::Equal, Ordering::Equal) => UpdateEffect::None,
        (Ordering::Equal | Ordering::Greater, Ordering::Equal | Ordering::Less) => UpdateEffect::Shrink,
        (Ordering::Equal | Ordering::Less, Ordering::Equal | Ordering::Greater) => UpdateEffect::Grow,
        _ => UpdateEffect::Move,
    }
}

/// One side of a diff: the range and payload before or after the merge.
#[derive(Debug, Clone, Copy)]
pub struct Side<'a> {
    pub range: &'a ValidRange,
    pub data: &'a Record,
    pub ephemeral: &'a Record,
}

/// Operation for a diffed segment. `rank` is the segment's position among
/// the segments descending from the same target row (1-based); only rank 1
/// may become an UPDATE.
pub fn classify(
    before: Option<Side<'_>>,
    after: Option<Side<'_>>,
    rank: usize,
) -> (PlanAction, Option<UpdateEffect>) {
    match (before, after) {
        (None, None) => (PlanAction::Error, None),
        (Some(_), None) => (PlanAction::Delete, None),
        (None, Some(_)) => (PlanAction::Insert, None),
        (Some(b), Some(a)) => {
            let identical = b.range == a.range
                && maps_equal_ignoring_nulls(b.data, a.data)
                && maps_equal_ignoring_nulls(b.ephemeral, a.ephemeral);
            if identical {
                (PlanAction::SkipIdentical, None)
            } else if rank <= 1 {
                (PlanAction::Update, Some(update_effect(b.range, a.range)))
            } else {
                (PlanAction::Insert, None)
            }
        }
    }
}

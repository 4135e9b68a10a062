//! Timeline reconstruction for one entity: split at every boundary, resolve
//! each slice's payload, then coalesce adjacent slices with equal data.

use std::collections::BTreeSet;

use crate::allen::relation;
use crate::error::MergeError;
use crate::policy;
use crate::range::{Bound, ValidRange};
use crate::types::{
    AtomicSegment, CoalescedSegment, EntityGroup, PlannerContext, Provenance, ResolvedSegment,
    SourceRow,
};
use crate::util::{maps_equal_ignoring_nulls, payload_hash};

// ── Atomic segmentation ──

/// Partition the union of the group's ranges at every source and target
/// boundary. Each slice records which rows cover it entirely.
pub fn build_atomic_segments(group: &EntityGroup) -> Result<Vec<AtomicSegment>, MergeError> {
    let mut boundaries: BTreeSet<Bound> = BTreeSet::new();
    for sr in &group.sources {
        boundaries.insert(*sr.valid_range.lower());
        boundaries.insert(*sr.valid_range.upper());
    }
    for tr in &group.targets {
        boundaries.insert(*tr.valid_range.lower());
        boundaries.insert(*tr.valid_range.upper());
    }

    let points: Vec<Bound> = boundaries.into_iter().collect();
    let mut segments = Vec::with_capacity(points.len().saturating_sub(1));
    for window in points.windows(2) {
        let valid_range = ValidRange::new(window[0], window[1])?;

        let sources: Vec<usize> = group
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid_range.contains(&valid_range))
            .map(|(i, _)| i)
            .collect();

        let mut covering = group
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.valid_range.contains(&valid_range))
            .map(|(i, _)| i);
        let target = covering.next();
        if let Some(other) = covering.next() {
            return Err(MergeError::invariant(format!(
                "target rows {} and {} of entity {} both cover {}",
                group.targets[target.unwrap_or(other)].valid_range,
                group.targets[other].valid_range,
                group.grouping_key,
                valid_range
            )));
        }

        let provenance = match (sources.is_empty(), target) {
            (false, _) => Provenance::Source,
            (true, Some(_)) => Provenance::Target,
            (true, None) => Provenance::Gap,
        };
        segments.push(AtomicSegment { valid_range, sources, target, provenance });
    }
    Ok(segments)
}

// ── Payload resolution ──

/// Resolve each slice's payload under the active mode. Slices the mode
/// drops (gaps, deleted portions, surgical extensions) are left out.
pub fn resolve_payloads(
    group: &EntityGroup,
    segments: Vec<AtomicSegment>,
    ctx: &PlannerContext,
) -> Vec<ResolvedSegment> {
    let mut resolved = Vec::with_capacity(segments.len());

    for seg in segments {
        let has_source = seg.provenance == Provenance::Source;
        if !policy::retain_segment(ctx, group, has_source, seg.target.is_some()) {
            continue;
        }
        let covering: Vec<&SourceRow> = seg.sources.iter().map(|&i| &group.sources[i]).collect();
        let target = seg.target.map(|i| &group.targets[i]);

        let Some(data_payload) = policy::merge_payload(
            ctx.mode,
            target.map(|t| &t.data_payload),
            &covering,
            &ctx.exclude_if_null_columns,
        ) else {
            continue;
        };

        let changes_target = match target {
            Some(t) => !maps_equal_ignoring_nulls(&t.data_payload, &data_payload),
            None => true,
        };
        let ephemeral_payload = policy::merge_ephemeral(
            ctx,
            target.map(|t| &t.ephemeral_payload),
            covering.last().copied(),
            changes_target && has_source,
        );

        let (row_ids, s_t_relation) = if has_source {
            let winner = covering.last().map(|s| s.valid_range);
            let rel = match (winner, target) {
                (Some(s), Some(t)) => Some(relation(&s, &t.valid_range)),
                _ => None,
            };
            (policy::attribute_rows(ctx.mode, &covering), rel)
        } else {
            // Target remnant: credit the source rows that split its target row.
            let mut ids = Vec::new();
            let mut rel = None;
            if let Some(t) = target {
                for sr in group.sources.iter().filter(|s| s.valid_range.overlaps(&t.valid_range)) {
                    ids.push(sr.row_id);
                    rel.get_or_insert_with(|| relation(&sr.valid_range, &t.valid_range));
                }
            }
            (ids, rel)
        };

        resolved.push(ResolvedSegment {
            valid_range: seg.valid_range,
            row_ids,
            data_hash: payload_hash(&data_payload),
            data_payload,
            ephemeral_payload,
            ancestor: seg.target,
            s_t_relation,
            has_source_coverage: has_source,
            changes_target,
        });
    }
    resolved
}

// ── Coalescing ──

/// Merge temporally adjacent slices whose data hashes match. The merged
/// segment descends from the first target row it covers.
pub fn coalesce_segments(resolved: Vec<ResolvedSegment>) -> Vec<CoalescedSegment> {
    let mut coalesced: Vec<CoalescedSegment> = Vec::new();

    for seg in resolved {
        if let Some(current) = coalesced.last_mut() {
            if current.valid_range.meets(&seg.valid_range) && current.data_hash == seg.data_hash {
                if let Ok(extended) = ValidRange::new(*current.valid_range.lower(), *seg.valid_range.upper()) {
                    current.valid_range = extended;
                    current.row_ids.extend(seg.row_ids);
                    if seg.changes_target && seg.has_source_coverage {
                        current.ephemeral_payload = seg.ephemeral_payload;
                    }
                    current.has_source_coverage |= seg.has_source_coverage;
                    current.changes_target |= seg.changes_target;
                    if current.ancestor.is_none() {
                        current.ancestor = seg.ancestor;
                    }
                    if current.s_t_relation.is_none() {
                        current.s_t_relation = seg.s_t_relation;
                    }
                    continue;
                }
            }
        }
        coalesced.push(CoalescedSegment {
            valid_range: seg.valid_range,
            row_ids: seg.row_ids,
            data_payload: seg.data_payload,
            ephemeral_payload: seg.ephemeral_payload,
            data_hash: seg.data_hash,
            ancestor: seg.ancestor,
            s_t_relation: seg.s_t_relation,
            has_source_coverage: seg.has_source_coverage,
            changes_target: seg.changes_target,
        });
    }

    for seg in &mut coalesced {
        seg.row_ids.sort_unstable();
        seg.row_ids.dedup();
    }
    coalesced
}

/// Segmentation, payload resolution and coalescing for one entity.
pub fn reconstruct(group: &EntityGroup, ctx: &PlannerContext) -> Result<Vec<CoalescedSegment>, MergeError> {
    let atomic = build_atomic_segments(group)?;
    let resolved = resolve_payloads(group, atomic, ctx);
    Ok(coalesce_segments(resolved))
}

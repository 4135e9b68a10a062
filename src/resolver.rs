//! Entity identity resolution: maps every source row to an existing target
//! entity or to a newly founded one, then gathers rows into entity groups.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;
use tracing::warn;

use crate::coverage::Multirange;
use crate::reader::RejectedRow;
use crate::types::{
    EarlyFeedback, EntityGroup, MatchedSourceRow, PlanAction, PlannerContext, Record, SourceRow,
    TargetRow,
};
use crate::util::{build_key_for_cols, overlay, project, strip_nulls};

const EXISTING_PREFIX: &str = "existing_entity__";
const NEW_PREFIX: &str = "new_entity__";

// ── Correlation ──

enum IdentityState {
    Null,
    Partial,
    Complete(String),
}

fn identity_state(sr: &SourceRow, ctx: &PlannerContext) -> IdentityState {
    let non_null = ctx
        .identity_columns
        .iter()
        .filter(|c| sr.identity_keys.get(*c).is_some_and(|v| !v.is_null()))
        .count();
    if non_null == 0 {
        IdentityState::Null
    } else if non_null < ctx.identity_columns.len() {
        IdentityState::Partial
    } else {
        match build_key_for_cols(&sr.identity_keys, &ctx.identity_columns) {
            Some(key) => IdentityState::Complete(key),
            None => IdentityState::Null,
        }
    }
}

/// Natural-key view of a row; a key set may include identity columns.
fn natural_keys(identity: &Record, lookup: &Record) -> Record {
    overlay(lookup, &strip_nulls(identity))
}

fn describe(map: &Record) -> String {
    Value::Object(strip_nulls(map)).to_string()
}

/// Target entities reachable by identity, and by each natural key set.
struct EntityIndex<'a> {
    by_id: HashMap<String, &'a TargetRow>,
    /// One index per natural key set; a key value maps to the entities holding it.
    by_nk: Vec<HashMap<String, BTreeMap<String, &'a TargetRow>>>,
}

impl<'a> EntityIndex<'a> {
    fn new(target_rows: &'a [TargetRow], ctx: &PlannerContext) -> Self {
        let mut by_id: HashMap<String, &TargetRow> = HashMap::new();
        for tr in target_rows {
            if let Some(key) = build_key_for_cols(&tr.identity_keys, &ctx.identity_columns) {
                by_id.entry(key).or_insert(tr);
            }
        }
        let by_nk = ctx
            .lookup_key_sets
            .iter()
            .map(|key_set| {
                let mut index: HashMap<String, BTreeMap<String, &TargetRow>> = HashMap::new();
                for tr in target_rows {
                    let keys = natural_keys(&tr.identity_keys, &tr.lookup_keys);
                    let Some(nk) = build_key_for_cols(&keys, key_set) else {
                        continue;
                    };
                    let entity = build_key_for_cols(&tr.identity_keys, &ctx.identity_columns)
                        .unwrap_or_default();
                    index.entry(nk).or_default().entry(entity).or_insert(tr);
                }
                index
            })
            .collect();
        Self { by_id, by_nk }
    }

    /// Entities any natural key set of the row leads to, by identity key.
    fn by_natural_key(
        &self,
        identity: &Record,
        lookup: &Record,
        ctx: &PlannerContext,
    ) -> BTreeMap<String, &'a TargetRow> {
        let keys = natural_keys(identity, lookup);
        let mut entities = BTreeMap::new();
        for (key_set, index) in ctx.lookup_key_sets.iter().zip(&self.by_nk) {
            let Some(nk) = build_key_for_cols(&keys, key_set) else {
                continue;
            };
            if let Some(found) = index.get(&nk) {
                for (entity, tr) in found {
                    entities.entry(entity.clone()).or_insert(*tr);
                }
            }
        }
        entities
    }

    /// Grouping keys of every existing entity a row's keys name, whether or
    /// not the row resolves cleanly.
    fn named(&self, identity: &Record, lookup: &Record, ctx: &PlannerContext) -> BTreeSet<String> {
        let mut named: BTreeSet<String> = self
            .by_natural_key(identity, lookup, ctx)
            .values()
            .map(|tr| target_grouping_key(tr, ctx))
            .collect();
        if let Some(tr) = build_key_for_cols(identity, &ctx.identity_columns).and_then(|k| self.by_id.get(&k)) {
            named.insert(target_grouping_key(tr, ctx));
        }
        named
    }
}

/// Match every source row against the target: identity columns first, then
/// each natural key set independently.
pub fn correlate_entities(
    source_rows: Vec<SourceRow>,
    target_rows: &[TargetRow],
    ctx: &PlannerContext,
) -> Vec<MatchedSourceRow> {
    let index = EntityIndex::new(target_rows, ctx);

    let mut matched = Vec::with_capacity(source_rows.len());
    for sr in source_rows {
        let mut m = MatchedSourceRow {
            grouping_key: String::new(),
            is_new_entity: true,
            identity: None,
            canonical_nk: None,
            early_feedback: None,
            source: sr,
        };
        let sr = &m.source;

        match identity_state(sr, ctx) {
            IdentityState::Partial => {
                m.is_new_entity = false;
                m.early_feedback = Some(EarlyFeedback::error(format!(
                    "Source row {} has a partially NULL identity {}",
                    sr.row_id,
                    describe(&sr.identity_keys)
                )));
            }
            IdentityState::Complete(key) => {
                let explicit = project(&sr.identity_keys, &ctx.identity_columns);
                if index.by_id.contains_key(&key) {
                    m.is_new_entity = false;
                    m.identity = Some(explicit);
                } else if ctx.mode.is_for_portion_of() || ctx.identity_is_natural {
                    // Falls through as a new entity; mode filtering skips it
                    // for the for-portion-of modes.
                    m.identity = Some(explicit);
                } else {
                    m.is_new_entity = false;
                    m.early_feedback = Some(EarlyFeedback::error(format!(
                        "Source row {} references identity {} which does not exist in {}",
                        sr.row_id,
                        describe(&explicit),
                        ctx.target_table
                    )));
                }
            }
            IdentityState::Null => {
                let entities = index.by_natural_key(&sr.identity_keys, &sr.lookup_keys, ctx);
                if entities.len() > 1 {
                    let ids: Vec<String> = entities
                        .values()
                        .map(|tr| describe(&tr.identity_keys))
                        .collect();
                    m.is_new_entity = false;
                    m.early_feedback = Some(EarlyFeedback::error(format!(
                        "Source row {} is ambiguous. It matches multiple distinct target entities: [{}]",
                        sr.row_id,
                        ids.join(", ")
                    )));
                } else if let Some(tr) = entities.values().next() {
                    m.is_new_entity = false;
                    m.identity = Some(project(&tr.identity_keys, &ctx.identity_columns));
                    m.canonical_nk = Some(strip_nulls(&sr.lookup_keys));
                }
            }
        }

        if let Some(fb) = &m.early_feedback {
            warn!(
                row_id = m.source.row_id,
                message = fb.message.as_deref().unwrap_or_default(),
                "source row failed identity resolution"
            );
            m.grouping_key = format!("error__row={}", m.source.row_id);
        } else {
            m.grouping_key = build_grouping_key(&m, ctx);
        }
        matched.push(m);
    }

    canonicalize_new_entity_nks(&mut matched, ctx);
    matched
}

fn key_parts(map: &Record, cols: &[String]) -> String {
    cols.iter()
        .map(|c| map.get(c).unwrap_or(&Value::Null).to_string())
        .collect::<Vec<_>>()
        .join("__")
}

fn is_founded(m: &MatchedSourceRow, ctx: &PlannerContext) -> bool {
    ctx.founding_id_column.is_some() && m.source.founding_id.is_some()
}

/// Key that identifies the entity a row resolves to, shared by every row of
/// the same entity.
fn build_grouping_key(m: &MatchedSourceRow, ctx: &PlannerContext) -> String {
    if !m.is_new_entity {
        let id = m.identity.as_ref().unwrap_or(&m.source.identity_keys);
        return format!("{EXISTING_PREFIX}{}", key_parts(id, &ctx.identity_columns));
    }
    if is_founded(m, ctx) {
        return format!("{NEW_PREFIX}founding={}", m.source.causal_id);
    }
    let nk = m
        .canonical_nk
        .as_ref()
        .filter(|nk| !nk.is_empty())
        .cloned()
        .unwrap_or_else(|| strip_nulls(&m.source.lookup_keys));
    if !nk.is_empty() {
        return format!("{NEW_PREFIX}{}", key_parts(&nk, &ctx.all_lookup_cols));
    }
    if let Some(id) = &m.identity {
        return format!("{NEW_PREFIX}id={}", key_parts(id, &ctx.identity_columns));
    }
    format!("{NEW_PREFIX}row={}", m.source.row_id)
}

/// Union new-entity rows whose natural-key fragments overlap, e.g. a row
/// with only `ssn` and a row with both `ssn` and `employee_nr`, so they
/// found one entity carrying the union of their keys.
fn canonicalize_new_entity_nks(matched: &mut [MatchedSourceRow], ctx: &PlannerContext) {
    if ctx.lookup_key_sets.is_empty() {
        return;
    }
    let new_indices: Vec<usize> = matched
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_new_entity && m.early_feedback.is_none() && !is_founded(m, ctx))
        .filter(|(_, m)| !m.source.lookup_cols_are_null())
        .map(|(i, _)| i)
        .collect();
    if new_indices.is_empty() {
        return;
    }

    let nk_maps: Vec<Record> = new_indices
        .iter()
        .map(|&i| strip_nulls(&matched[i].source.lookup_keys))
        .collect();

    let n = new_indices.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = i;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }

    for key_set in &ctx.lookup_key_sets {
        let mut first_by_key: HashMap<String, usize> = HashMap::new();
        for (local, nk) in nk_maps.iter().enumerate() {
            let Some(key) = build_key_for_cols(nk, key_set) else {
                continue;
            };
            // Only a fully populated key set links rows.
            if key_set.iter().any(|c| !nk.contains_key(c)) {
                continue;
            }
            match first_by_key.get(&key) {
                Some(&first) => {
                    let (ra, rb) = (find(&mut parent, first), find(&mut parent, local));
                    if ra != rb {
                        parent[rb] = ra;
                    }
                }
                None => {
                    first_by_key.insert(key, local);
                }
            }
        }
    }

    let mut canonical: HashMap<usize, Record> = HashMap::new();
    for (local, nk) in nk_maps.iter().enumerate() {
        let root = find(&mut parent, local);
        let entry = canonical.entry(root).or_default();
        for (k, v) in nk {
            entry.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    for (local, &global) in new_indices.iter().enumerate() {
        let root = find(&mut parent, local);
        if let Some(nk) = canonical.get(&root) {
            matched[global].canonical_nk = Some(nk.clone());
            matched[global].grouping_key = build_grouping_key(&matched[global], ctx);
        }
    }
}

// ── Eclipse detection ──

/// Mark rows whose range is fully covered by newer (higher row_id) rows of
/// the same entity.
pub fn detect_eclipsed(matched: &mut [MatchedSourceRow]) {
    let mut by_group: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, m) in matched.iter().enumerate() {
        if m.early_feedback.is_none() {
            by_group.entry(m.grouping_key.as_str()).or_default().push(i);
        }
    }
    let partitions: Vec<Vec<usize>> = by_group
        .into_values()
        .filter(|v| v.len() > 1)
        .collect();

    for mut indices in partitions {
        indices.sort_by(|&a, &b| matched[b].source.row_id.cmp(&matched[a].source.row_id));
        let mut newer = Multirange::new();
        for idx in indices {
            let range = matched[idx].source.valid_range;
            if newer.contains(&range) {
                matched[idx].early_feedback = Some(EarlyFeedback::skip(PlanAction::SkipEclipsed));
            }
            newer.insert(range);
        }
    }
}

// ── Grouping ──

/// Grouping key of the entity a target row belongs to.
pub fn target_grouping_key(tr: &TargetRow, ctx: &PlannerContext) -> String {
    format!("{EXISTING_PREFIX}{}", key_parts(&tr.identity_keys, &ctx.identity_columns))
}

/// Existing entities named by source rows that never reach planning:
/// resolution errors and rows rejected while reading. An ambiguous row names
/// every entity it matched.
pub fn mentioned_entities(
    matched: &[MatchedSourceRow],
    rejected: &[RejectedRow],
    target_rows: &[TargetRow],
    ctx: &PlannerContext,
) -> BTreeSet<String> {
    let index = EntityIndex::new(target_rows, ctx);
    let failed = matched
        .iter()
        .filter(|m| m.early_feedback.as_ref().is_some_and(|fb| fb.action == PlanAction::Error))
        .map(|m| (&m.source.identity_keys, &m.source.lookup_keys));
    let rejected = rejected.iter().map(|r| (&r.identity_keys, &r.lookup_keys));
    failed
        .chain(rejected)
        .flat_map(|(identity, lookup)| index.named(identity, lookup, ctx))
        .collect()
}

/// Gather planned source rows and the target rows of their entities.
/// Target-only entities are kept when entity deletion is requested; those in
/// `mentioned` still count as present in the source.
pub fn group_by_entity(
    matched: &[MatchedSourceRow],
    mentioned: &BTreeSet<String>,
    target_rows: Vec<TargetRow>,
    ctx: &PlannerContext,
) -> BTreeMap<String, EntityGroup> {
    let mut groups: BTreeMap<String, EntityGroup> = BTreeMap::new();

    for m in matched {
        let planned = m.early_feedback.is_none();
        let resolved = match &m.early_feedback {
            None => true,
            Some(fb) => matches!(fb.action, PlanAction::SkipEclipsed | PlanAction::SkipFiltered),
        };
        if !resolved {
            continue;
        }
        let group = groups.entry(m.grouping_key.clone()).or_insert_with(|| EntityGroup {
            grouping_key: m.grouping_key.clone(),
            is_new_entity: m.is_new_entity,
            identity_keys: m
                .identity
                .clone()
                .unwrap_or_else(|| project(&Record::new(), &ctx.identity_columns)),
            lookup_keys: m
                .canonical_nk
                .clone()
                .unwrap_or_else(|| strip_nulls(&m.source.lookup_keys)),
            causal_id: None,
            sources: Vec::new(),
            targets: Vec::new(),
            present_in_source: true,
        });
        if planned {
            if group.causal_id.is_none() {
                group.causal_id = Some(m.source.causal_id.clone());
            }
            group.sources.push(m.source.clone());
        }
    }

    for tr in target_rows {
        let key = target_grouping_key(&tr, ctx);
        if let Some(group) = groups.get_mut(&key) {
            group.targets.push(tr);
        } else if ctx.delete_mode.deletes_entities() {
            let present_in_source = mentioned.contains(&key);
            groups.insert(
                key.clone(),
                EntityGroup {
                    grouping_key: key,
                    is_new_entity: false,
                    identity_keys: project(&tr.identity_keys, &ctx.identity_columns),
                    lookup_keys: tr.lookup_keys.clone(),
                    causal_id: None,
                    sources: Vec::new(),
                    targets: vec![tr],
                    present_in_source,
                },
            );
        }
    }

    for group in groups.values_mut() {
        group.sources.sort_by_key(|s| s.row_id);
        group.targets.sort_by(|a, b| a.valid_range.cmp(&b.valid_range));
        if !group.is_new_entity {
            if let Some(first) = group.targets.first() {
                let mut lookup = strip_nulls(&first.lookup_keys);
                for (k, v) in &group.lookup_keys {
                    lookup.entry(k.clone()).or_insert_with(|| v.clone());
                }
                group.lookup_keys = lookup;
            }
        }
    }
    groups
}

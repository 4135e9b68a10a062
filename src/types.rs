use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::allen::AllenRelation;
use crate::error::{ConfigError, ErrorKind};
use crate::range::{RangeSubtype, ValidRange};

/// A row's columns as JSON values, keyed by column name.
pub type Record = serde_json::Map<String, Value>;

// ── Merge mode ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeMode {
    #[default]
    MergeEntityPatch,
    MergeEntityReplace,
    MergeEntityUpsert,
    PatchForPortionOf,
    ReplaceForPortionOf,
    UpdateForPortionOf,
    DeleteForPortionOf,
    InsertNewEntities,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeEntityPatch => "MERGE_ENTITY_PATCH",
            Self::MergeEntityReplace => "MERGE_ENTITY_REPLACE",
            Self::MergeEntityUpsert => "MERGE_ENTITY_UPSERT",
            Self::PatchForPortionOf => "PATCH_FOR_PORTION_OF",
            Self::ReplaceForPortionOf => "REPLACE_FOR_PORTION_OF",
            Self::UpdateForPortionOf => "UPDATE_FOR_PORTION_OF",
            Self::DeleteForPortionOf => "DELETE_FOR_PORTION_OF",
            Self::InsertNewEntities => "INSERT_NEW_ENTITIES",
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Self::MergeEntityPatch | Self::PatchForPortionOf)
    }

    pub fn is_replace(&self) -> bool {
        matches!(
            self,
            Self::MergeEntityReplace | Self::ReplaceForPortionOf | Self::UpdateForPortionOf
        )
    }

    pub fn is_for_portion_of(&self) -> bool {
        matches!(
            self,
            Self::UpdateForPortionOf
                | Self::PatchForPortionOf
                | Self::ReplaceForPortionOf
                | Self::DeleteForPortionOf
        )
    }

    /// Modes where the newest covering source row alone decides a segment.
    pub fn is_last_writer_wins(&self) -> bool {
        self.is_replace() || matches!(self, Self::DeleteForPortionOf)
    }
}

impl FromStr for MergeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MERGE_ENTITY_UPSERT" => Ok(Self::MergeEntityUpsert),
            "UPDATE_FOR_PORTION_OF" => Ok(Self::UpdateForPortionOf),
            "MERGE_ENTITY_PATCH" => Ok(Self::MergeEntityPatch),
            "PATCH_FOR_PORTION_OF" => Ok(Self::PatchForPortionOf),
            "MERGE_ENTITY_REPLACE" => Ok(Self::MergeEntityReplace),
            "REPLACE_FOR_PORTION_OF" => Ok(Self::ReplaceForPortionOf),
            "INSERT_NEW_ENTITIES" => Ok(Self::InsertNewEntities),
            "DELETE_FOR_PORTION_OF" => Ok(Self::DeleteForPortionOf),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Delete mode ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteMode {
    #[default]
    None,
    DeleteMissingTimeline,
    DeleteMissingEntities,
    DeleteMissingTimelineAndEntities,
}

impl DeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::DeleteMissingTimeline => "DELETE_MISSING_TIMELINE",
            Self::DeleteMissingEntities => "DELETE_MISSING_ENTITIES",
            Self::DeleteMissingTimelineAndEntities => "DELETE_MISSING_TIMELINE_AND_ENTITIES",
        }
    }

    pub fn deletes_entities(&self) -> bool {
        matches!(
            self,
            Self::DeleteMissingEntities | Self::DeleteMissingTimelineAndEntities
        )
    }

    pub fn deletes_timeline(&self) -> bool {
        matches!(
            self,
            Self::DeleteMissingTimeline | Self::DeleteMissingTimelineAndEntities
        )
    }
}

impl FromStr for DeleteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Self::None),
            "DELETE_MISSING_TIMELINE" => Ok(Self::DeleteMissingTimeline),
            "DELETE_MISSING_ENTITIES" => Ok(Self::DeleteMissingEntities),
            "DELETE_MISSING_TIMELINE_AND_ENTITIES" => Ok(Self::DeleteMissingTimelineAndEntities),
            other => Err(ConfigError::InvalidDeleteMode(other.to_string())),
        }
    }
}

// ── Plan action ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanAction {
    Delete,
    Update,
    Insert,
    SkipIdentical,
    SkipNoTarget,
    SkipFiltered,
    SkipEclipsed,
    Error,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::SkipIdentical => "SKIP_IDENTICAL",
            Self::SkipNoTarget => "SKIP_NO_TARGET",
            Self::SkipFiltered => "SKIP_FILTERED",
            Self::SkipEclipsed => "SKIP_ECLIPSED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    pub fn feedback_status(&self) -> FeedbackStatus {
        match self {
            Self::Insert | Self::Update | Self::Delete => FeedbackStatus::Applied,
            Self::Error => FeedbackStatus::Error,
            _ => FeedbackStatus::Skipped,
        }
    }
}

// ── Update effect ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateEffect {
    None,
    Shrink,
    Move,
    Grow,
}

impl UpdateEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Shrink => "SHRINK",
            Self::Move => "MOVE",
            Self::Grow => "GROW",
        }
    }
}

// ── Identification strategy (which keys are available) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStrategy {
    /// Identity columns plus natural-key lookups.
    Hybrid,
    IdentityKeyOnly,
}

// ── Era metadata ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraMetadata {
    pub era_name: String,
    /// Materialised range column, if the table keeps one.
    pub range_col: Option<String>,
    pub valid_from_col: String,
    pub valid_until_col: String,
    /// Inclusive end column (discrete subtypes only).
    pub valid_to_col: Option<String>,
    pub range_subtype: RangeSubtype,
    pub ephemeral_columns: Vec<String>,
}

impl EraMetadata {
    pub fn new(era_name: &str, subtype: RangeSubtype) -> Self {
        Self {
            era_name: era_name.to_string(),
            range_col: None,
            valid_from_col: "valid_from".to_string(),
            valid_until_col: "valid_until".to_string(),
            valid_to_col: None,
            range_subtype: subtype,
            ephemeral_columns: Vec::new(),
        }
    }

    pub fn with_valid_to(mut self, col: &str) -> Self {
        self.valid_to_col = Some(col.to_string());
        self
    }

    pub fn with_range_col(mut self, col: &str) -> Self {
        self.range_col = Some(col.to_string());
        self
    }

    /// Every column the era owns.
    pub fn temporal_cols(&self) -> Vec<String> {
        let mut cols = Vec::with_capacity(4);
        if let Some(rc) = &self.range_col {
            cols.push(rc.clone());
        }
        cols.push(self.valid_from_col.clone());
        if let Some(vt) = &self.valid_to_col {
            cols.push(vt.clone());
        }
        cols.push(self.valid_until_col.clone());
        cols
    }
}

// ── Source row ──

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub row_id: i64,
    /// Founding correlation tag, if the source carries one.
    pub founding_id: Option<String>,
    /// COALESCE(founding_id, row_id)
    pub causal_id: String,
    pub valid_range: ValidRange,
    pub identity_keys: Record,
    pub lookup_keys: Record,
    pub data_payload: Record,
    pub ephemeral_payload: Record,
}

impl SourceRow {
    pub fn identity_is_null(&self) -> bool {
        self.identity_keys.values().all(Value::is_null)
    }

    pub fn lookup_cols_are_null(&self) -> bool {
        self.lookup_keys.values().all(Value::is_null)
    }
}

// ── Target row ──

#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub valid_range: ValidRange,
    pub identity_keys: Record,
    pub lookup_keys: Record,
    pub data_payload: Record,
    pub ephemeral_payload: Record,
    /// Primary-key columns that are neither identity nor temporal.
    pub pk_payload: Record,
}

// ── Matched source row (after entity correlation) ──

#[derive(Debug, Clone)]
pub struct MatchedSourceRow {
    pub source: SourceRow,
    pub is_new_entity: bool,
    pub grouping_key: String,
    /// Identity discovered in the target, or given explicitly.
    pub identity: Option<Record>,
    /// Union of natural-key values for a new entity.
    pub canonical_nk: Option<Record>,
    pub early_feedback: Option<EarlyFeedback>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EarlyFeedback {
    pub action: PlanAction,
    pub message: Option<String>,
}

impl EarlyFeedback {
    pub fn error(message: impl Into<String>) -> Self {
        Self { action: PlanAction::Error, message: Some(message.into()) }
    }

    pub fn skip(action: PlanAction) -> Self {
        Self { action, message: None }
    }
}

// ── Entity group ──

#[derive(Debug, Clone)]
pub struct EntityGroup {
    pub grouping_key: String,
    pub is_new_entity: bool,
    pub identity_keys: Record,
    pub lookup_keys: Record,
    pub causal_id: Option<String>,
    /// Source rows that take part in planning, ordered by row_id.
    pub sources: Vec<SourceRow>,
    pub targets: Vec<TargetRow>,
    /// Whether any source row (planned or not) resolved to this entity.
    pub present_in_source: bool,
}

// ── Segments ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Source,
    Target,
    Gap,
}

/// A slice between two consecutive boundaries. Every input range either
/// contains it entirely or misses it entirely.
#[derive(Debug, Clone)]
pub struct AtomicSegment {
    pub valid_range: ValidRange,
    /// Indexes into the group's sources, ascending row_id.
    pub sources: Vec<usize>,
    /// Index into the group's targets.
    pub target: Option<usize>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone)]
pub struct ResolvedSegment {
    pub valid_range: ValidRange,
    pub row_ids: Vec<i64>,
    pub data_payload: Record,
    pub ephemeral_payload: Record,
    pub data_hash: u64,
    pub ancestor: Option<usize>,
    pub s_t_relation: Option<AllenRelation>,
    pub has_source_coverage: bool,
    /// Data differs from the covering target (or there is none).
    pub changes_target: bool,
}

#[derive(Debug, Clone)]
pub struct CoalescedSegment {
    pub valid_range: ValidRange,
    pub row_ids: Vec<i64>,
    pub data_payload: Record,
    pub ephemeral_payload: Record,
    pub data_hash: u64,
    /// First target row covered, used to join the segment back to the row it
    /// descends from.
    pub ancestor: Option<usize>,
    pub s_t_relation: Option<AllenRelation>,
    pub has_source_coverage: bool,
    pub changes_target: bool,
}

// ── Plan row ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRow {
    pub plan_op_seq: i64,
    pub statement_seq: i32,
    pub row_ids: Vec<i64>,
    pub operation: PlanAction,
    pub update_effect: Option<UpdateEffect>,
    pub causal_id: Option<String>,
    pub is_new_entity: bool,
    pub entity_keys: Record,
    pub identity_keys: Record,
    pub lookup_keys: Record,
    pub s_t_relation: Option<AllenRelation>,
    pub b_a_relation: Option<AllenRelation>,
    pub old_valid_range: Option<ValidRange>,
    pub new_valid_range: Option<ValidRange>,
    pub data: Option<Record>,
    pub feedback: Option<Value>,
    pub trace: Option<Value>,
    pub grouping_key: String,
}

impl PlanRow {
    pub fn blank(operation: PlanAction, grouping_key: &str) -> Self {
        Self {
            plan_op_seq: 0,
            statement_seq: 0,
            row_ids: Vec::new(),
            operation,
            update_effect: None,
            causal_id: None,
            is_new_entity: false,
            entity_keys: Record::new(),
            identity_keys: Record::new(),
            lookup_keys: Record::new(),
            s_t_relation: None,
            b_a_relation: None,
            old_valid_range: None,
            new_valid_range: None,
            data: None,
            feedback: None,
            trace: None,
            grouping_key: grouping_key.to_string(),
        }
    }

    /// Message carried by an ERROR row.
    pub fn error_message(&self) -> Option<&str> {
        self.feedback.as_ref()?.get("error")?.as_str()
    }
}

// ── Resolution and feedback ──

/// Where a source row ended up after identity resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RowResolution {
    pub grouping_key: String,
    pub is_new_entity: bool,
    pub identity: Option<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackStatus {
    Applied,
    Skipped,
    Error,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "APPLIED",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub row_id: i64,
    pub status: FeedbackStatus,
    /// Most significant action that touched the row.
    pub action: PlanAction,
    pub grouping_key: Option<String>,
    pub assigned_identity: Option<Record>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

// ── Planner context (holds all metadata needed throughout planning) ──

#[derive(Debug, Clone)]
pub struct PlannerContext {
    pub mode: MergeMode,
    pub delete_mode: DeleteMode,
    pub era: EraMetadata,
    pub target_table: String,
    pub source_table: String,
    pub identity_columns: Vec<String>,
    pub lookup_key_sets: Vec<Vec<String>>,
    pub all_lookup_cols: Vec<String>,
    pub temporal_cols: Vec<String>,
    /// Primary-key columns that are neither identity nor temporal.
    pub pk_cols: Vec<String>,
    pub strategy: IdentityStrategy,
    pub ephemeral_columns: Vec<String>,
    pub founding_id_column: Option<String>,
    pub row_id_column: String,
    /// NOT NULL or defaulted target columns: a NULL source value keeps the target value.
    pub exclude_if_null_columns: BTreeSet<String>,
    /// Columns the store computes; never written.
    pub generated_columns: BTreeSet<String>,
    /// Columns the store fills when a written value is NULL.
    pub defaulted_columns: BTreeSet<String>,
    /// Name of the unique key backing the identity columns.
    pub identity_constraint: Option<String>,
    /// The identity columns double as a natural key.
    pub identity_is_natural: bool,
    pub log_trace: bool,
    pub verify_plan: bool,
}

impl PlannerContext {
    pub fn is_identity_col(&self, col: &str) -> bool {
        self.identity_columns.iter().any(|c| c == col)
    }
}

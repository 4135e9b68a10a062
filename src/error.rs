use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::range::{Bound, RangeSubtype};

/// Stable tag attached to every error, for callers that branch on the kind
/// of failure rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Invariant,
    Execution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION",
            Self::Resolution => "RESOLUTION",
            Self::Invariant => "INVARIANT",
            Self::Execution => "EXECUTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("empty or reversed range [{lower},{upper})")]
    Empty { lower: Bound, upper: Bound },

    #[error("range bounds have different types: [{lower},{upper})")]
    MixedSubtypes { lower: Bound, upper: Bound },

    #[error("invalid range bound: {0}")]
    InvalidBound(String),

    #[error("expected a {} bound, got {value}", .expected.as_str())]
    SubtypeMismatch { expected: RangeSubtype, value: String },

    #[error("malformed range literal: {0}")]
    Malformed(String),

    #[error("unsupported range subtype: {0}")]
    UnsupportedSubtype(String),
}

/// Problems with the call itself. Always fatal, raised before planning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("identity_columns must not be empty")]
    MissingIdentityColumns,

    #[error("invalid merge mode: {0}")]
    InvalidMode(String),

    #[error("invalid delete mode: {0}")]
    InvalidDeleteMode(String),

    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },

    #[error("era {era} is not registered on {table}")]
    UnknownEra { table: String, era: String },

    #[error("table {0} is not known to the catalog")]
    UnknownTable(String),

    #[error("identity columns ({columns}) do not match any temporal unique key on {table}")]
    IdentityNotRegistered { table: String, columns: String },

    #[error("column {column} has type {source_type} in source but {target_type} in target")]
    TypeMismatch {
        column: String,
        source_type: String,
        target_type: String,
    },

    #[error("source {table} must supply {columns} for UPDATE_FOR_PORTION_OF")]
    IncompleteSource { table: String, columns: String },

    #[error("source {table} has no valid range: needs {range_col} or {from_col} with {until_col}")]
    MissingRangeColumns {
        table: String,
        range_col: String,
        from_col: String,
        until_col: String,
    },

    #[error("row_id {0} appears more than once in the source")]
    DuplicateRowId(i64),

    #[error("source row has no usable {column}: {value}")]
    InvalidRowId { column: String, value: String },

    #[error("natural identity key set {0} is empty")]
    EmptyNaturalKey(usize),

    #[error("best-effort execution needs savepoint support from the target store")]
    SavepointsUnsupported,

    #[error("invalid configuration document: {0}")]
    Document(String),

    #[error("invalid era definition: {0}")]
    Era(#[from] RangeError),
}

/// Failure reported by a target store or source table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("conflicting key value violates {constraint}: {detail}")]
    ConstraintViolation { constraint: String, detail: String },

    #[error("null value in column {column} violates not-null constraint")]
    NotNull { column: String },

    #[error("row not found: {0}")]
    RowNotFound(String),

    #[error("savepoint {0} does not exist")]
    UnknownSavepoint(String),

    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("range error: {0}")]
    Range(#[from] RangeError),

    #[error("planner invariant violated: {0}")]
    Invariant(String),

    #[error("execution failed for entity {entity}: {source}")]
    Execution { entity: String, source: StoreError },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl MergeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Range(_) | Self::Invariant(_) => ErrorKind::Invariant,
            Self::Execution { .. } | Self::Store(_) => ErrorKind::Execution,
        }
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

//! Per-call merge configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{DeleteMode, MergeMode};

/// How the executor reacts to a failing statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Any failure aborts the whole call and rolls back every operation.
    #[default]
    Atomic,
    /// A failure rolls back only the failing entity's operations; its source
    /// rows get ERROR feedback and the rest of the batch proceeds.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub target_table: String,
    pub source_table: String,
    pub era_name: String,
    pub identity_columns: Vec<String>,
    /// Natural key sets, tried independently.
    pub natural_identity_columns: Vec<Vec<String>>,
    pub ephemeral_columns: Vec<String>,
    pub mode: MergeMode,
    pub delete_mode: DeleteMode,
    pub founding_id_column: Option<String>,
    pub row_id_column: String,
    pub update_source_with_identity: bool,
    pub update_source_with_feedback: bool,
    pub feedback_status_column: String,
    pub feedback_error_column: String,
    pub execution: ExecutionMode,
    pub log_trace: bool,
    pub verify_plan: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            target_table: String::new(),
            source_table: String::new(),
            era_name: "valid".to_string(),
            identity_columns: Vec::new(),
            natural_identity_columns: Vec::new(),
            ephemeral_columns: Vec::new(),
            mode: MergeMode::default(),
            delete_mode: DeleteMode::default(),
            founding_id_column: None,
            row_id_column: "row_id".to_string(),
            update_source_with_identity: false,
            update_source_with_feedback: false,
            feedback_status_column: "merge_status".to_string(),
            feedback_error_column: "merge_error".to_string(),
            execution: ExecutionMode::default(),
            log_trace: false,
            verify_plan: false,
        }
    }
}

impl MergeConfig {
    pub fn new(target_table: &str, source_table: &str, identity_columns: &[&str]) -> Self {
        Self {
            target_table: target_table.to_string(),
            source_table: source_table.to_string(),
            identity_columns: identity_columns.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Document(e.to_string()))
    }

    pub fn mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn delete_mode(mut self, delete_mode: DeleteMode) -> Self {
        self.delete_mode = delete_mode;
        self
    }

    pub fn era(mut self, era_name: &str) -> Self {
        self.era_name = era_name.to_string();
        self
    }

    pub fn natural_key(mut self, columns: &[&str]) -> Self {
        self.natural_identity_columns
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn ephemeral(mut self, columns: &[&str]) -> Self {
        self.ephemeral_columns
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn founding_id_column(mut self, column: &str) -> Self {
        self.founding_id_column = Some(column.to_string());
        self
    }

    pub fn row_id_column(mut self, column: &str) -> Self {
        self.row_id_column = column.to_string();
        self
    }

    pub fn write_back_identity(mut self) -> Self {
        self.update_source_with_identity = true;
        self
    }

    pub fn write_back_feedback(mut self) -> Self {
        self.update_source_with_feedback = true;
        self
    }

    pub fn execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn log_trace(mut self, on: bool) -> Self {
        self.log_trace = on;
        self
    }

    pub fn verify_plan(mut self, on: bool) -> Self {
        self.verify_plan = on;
        self
    }

    /// Checks that need no catalog access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_columns.is_empty() || self.identity_columns.iter().any(|c| c.is_empty()) {
            return Err(ConfigError::MissingIdentityColumns);
        }
        if self.row_id_column.is_empty() {
            return Err(ConfigError::UnknownColumn {
                table: self.source_table.clone(),
                column: String::new(),
            });
        }
        if let Some(i) = self
            .natural_identity_columns
            .iter()
            .position(|set| set.is_empty())
        {
            return Err(ConfigError::EmptyNaturalKey(i));
        }
        Ok(())
    }

    /// Natural key sets with duplicates removed, order preserved.
    pub fn lookup_key_sets(&self) -> Vec<Vec<String>> {
        let mut seen = BTreeSet::new();
        self.natural_identity_columns
            .iter()
            .filter(|set| seen.insert((*set).clone()))
            .cloned()
            .collect()
    }
}

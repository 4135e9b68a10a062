use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::MergeConfig;
use crate::error::{ConfigError, MergeError};
use crate::types::{EraMetadata, IdentityStrategy, MergeMode, PlannerContext};

// ── Catalog descriptors ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generated {
    #[default]
    Never,
    /// Filled by the store when the written value is NULL (identity/serial).
    ByDefault,
    /// Computed by the store; never written.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Type name as the host reports it; empty when unknown.
    pub type_name: String,
    pub not_null: bool,
    pub has_default: bool,
    pub generated: Generated,
}

impl ColumnDescriptor {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            not_null: false,
            has_default: false,
            generated: Generated::Never,
        }
    }

    /// A column whose type is not known, as for ad-hoc source records.
    pub fn untyped(name: &str) -> Self {
        Self::new(name, "")
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    pub fn generated_by_default(mut self) -> Self {
        self.generated = Generated::ByDefault;
        self.not_null = true;
        self
    }

    pub fn generated_always(mut self) -> Self {
        self.generated = Generated::Always;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueKeyKind {
    Primary,
    Natural,
}

/// A registered temporal unique key: `columns` plus the era's range may not
/// overlap between two rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueKeyDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub kind: UniqueKeyKind,
}

impl UniqueKeyDescriptor {
    pub fn new(name: &str, columns: &[&str], kind: UniqueKeyKind) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind,
        }
    }
}

/// Read-only view of the table metadata the planner needs. Queried fresh on
/// every call.
pub trait Catalog {
    fn era(&self, table: &str, era_name: &str) -> Result<EraMetadata, MergeError>;

    fn columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>, MergeError>;

    fn unique_keys(&self, table: &str, era_name: &str)
        -> Result<Vec<UniqueKeyDescriptor>, MergeError>;
}

// ── Planner context ──

fn as_set(cols: &[String]) -> BTreeSet<&str> {
    cols.iter().map(String::as_str).collect()
}

fn require_column(
    cols: &[ColumnDescriptor],
    table: &str,
    column: &str,
) -> Result<(), ConfigError> {
    if cols.iter().any(|c| c.name == column) {
        Ok(())
    } else {
        Err(ConfigError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

fn find<'a>(cols: &'a [ColumnDescriptor], name: &str) -> Option<&'a ColumnDescriptor> {
    cols.iter().find(|c| c.name == name)
}

/// Validate the call against the catalog and build all canonical column lists
/// for the planner context.
pub fn build_planner_context(
    config: &MergeConfig,
    era: EraMetadata,
    target_cols: &[ColumnDescriptor],
    source_cols: &[ColumnDescriptor],
    unique_keys: &[UniqueKeyDescriptor],
) -> Result<PlannerContext, ConfigError> {
    config.validate()?;
    let target = config.target_table.as_str();
    let source = config.source_table.as_str();

    let temporal_cols = era.temporal_cols();
    for col in [&era.valid_from_col, &era.valid_until_col] {
        require_column(target_cols, target, col)?;
    }

    let identity_columns = config.identity_columns.clone();
    for col in &identity_columns {
        require_column(target_cols, target, col)?;
    }

    let lookup_key_sets = config.lookup_key_sets();
    let mut all_lookup_cols: Vec<String> = Vec::new();
    for col in lookup_key_sets.iter().flatten() {
        require_column(target_cols, target, col)?;
        if !all_lookup_cols.contains(col) {
            all_lookup_cols.push(col.clone());
        }
    }

    let mut ephemeral_columns = config.ephemeral_columns.clone();
    for col in &ephemeral_columns {
        require_column(target_cols, target, col)?;
    }
    for col in &era.ephemeral_columns {
        if !ephemeral_columns.contains(col) && find(target_cols, col).is_some() {
            ephemeral_columns.push(col.clone());
        }
    }
    ephemeral_columns.sort();
    ephemeral_columns.dedup();

    // Source-side requirements.
    require_column(source_cols, source, &config.row_id_column)?;
    if let Some(fc) = &config.founding_id_column {
        require_column(source_cols, source, fc)?;
    }
    if config.update_source_with_identity {
        for col in &identity_columns {
            require_column(source_cols, source, col)?;
        }
    }
    if config.update_source_with_feedback {
        require_column(source_cols, source, &config.feedback_status_column)?;
        require_column(source_cols, source, &config.feedback_error_column)?;
    }
    let has = |c: &str| find(source_cols, c).is_some();
    let has_range = era.range_col.as_deref().is_some_and(has);
    let has_upper = has(&era.valid_until_col)
        || (era.valid_to_col.as_deref().is_some_and(has) && era.range_subtype.is_discrete());
    if !has_range && !(has(&era.valid_from_col) && has_upper) {
        return Err(ConfigError::MissingRangeColumns {
            table: source.to_string(),
            range_col: era.range_col.clone().unwrap_or_else(|| "<range>".to_string()),
            from_col: era.valid_from_col.clone(),
            until_col: era.valid_until_col.clone(),
        });
    }

    // Key and era columns must agree on type wherever both sides declare one.
    for col in identity_columns
        .iter()
        .chain(all_lookup_cols.iter())
        .chain(temporal_cols.iter())
    {
        if let (Some(s), Some(t)) = (find(source_cols, col), find(target_cols, col)) {
            if !s.type_name.is_empty()
                && !t.type_name.is_empty()
                && !s.type_name.eq_ignore_ascii_case(&t.type_name)
            {
                return Err(ConfigError::TypeMismatch {
                    column: col.clone(),
                    source_type: s.type_name.clone(),
                    target_type: t.type_name.clone(),
                });
            }
        }
    }

    // The identity columns must be backed by a registered temporal key, when
    // the catalog knows about any.
    let identity_set = as_set(&identity_columns);
    let identity_constraint = if unique_keys.is_empty() {
        None
    } else {
        let key = unique_keys
            .iter()
            .find(|k| {
                let cols: BTreeSet<&str> = k
                    .columns
                    .iter()
                    .map(String::as_str)
                    .filter(|c| !temporal_cols.iter().any(|t| t == c))
                    .collect();
                cols == identity_set
            })
            .ok_or_else(|| ConfigError::IdentityNotRegistered {
                table: target.to_string(),
                columns: identity_columns.join(", "),
            })?;
        Some(key.name.clone())
    };

    let pk_cols: Vec<String> = unique_keys
        .iter()
        .filter(|k| k.kind == UniqueKeyKind::Primary)
        .flat_map(|k| k.columns.iter())
        .filter(|c| !temporal_cols.contains(c) && !identity_columns.contains(c))
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    let strategy = if all_lookup_cols.is_empty() {
        IdentityStrategy::IdentityKeyOnly
    } else {
        IdentityStrategy::Hybrid
    };
    let identity_is_natural = lookup_key_sets
        .iter()
        .any(|set| as_set(set) == identity_set);

    let structural: BTreeSet<&str> = identity_columns
        .iter()
        .chain(all_lookup_cols.iter())
        .chain(temporal_cols.iter())
        .chain(pk_cols.iter())
        .map(String::as_str)
        .collect();

    let generated_columns: BTreeSet<String> = target_cols
        .iter()
        .filter(|c| c.generated == Generated::Always)
        .map(|c| c.name.clone())
        .collect();
    let defaulted_columns: BTreeSet<String> = target_cols
        .iter()
        .filter(|c| c.has_default || c.generated == Generated::ByDefault)
        .map(|c| c.name.clone())
        .collect();
    let exclude_if_null_columns: BTreeSet<String> = target_cols
        .iter()
        .filter(|c| c.not_null || c.has_default)
        .filter(|c| !structural.contains(c.name.as_str()))
        .map(|c| c.name.clone())
        .collect();

    if config.mode == MergeMode::UpdateForPortionOf {
        let missing: Vec<&str> = target_cols
            .iter()
            .map(|c| c.name.as_str())
            .filter(|c| {
                !structural.contains(c)
                    && !generated_columns.contains(*c)
                    && !ephemeral_columns.iter().any(|e| e == c)
                    && !has(c)
            })
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::IncompleteSource {
                table: source.to_string(),
                columns: missing.join(", "),
            });
        }
    }

    Ok(PlannerContext {
        mode: config.mode,
        delete_mode: config.delete_mode,
        era,
        target_table: target.to_string(),
        source_table: source.to_string(),
        identity_columns,
        lookup_key_sets,
        all_lookup_cols,
        temporal_cols,
        pk_cols,
        strategy,
        ephemeral_columns,
        founding_id_column: config.founding_id_column.clone(),
        row_id_column: config.row_id_column.clone(),
        exclude_if_null_columns,
        generated_columns,
        defaulted_columns,
        identity_constraint,
        identity_is_natural,
        log_trace: config.log_trace,
        verify_plan: config.verify_plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeSubtype;

    fn target_cols() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("id", "integer").generated_by_default(),
            ColumnDescriptor::new("tax_ident", "text"),
            ColumnDescriptor::new("valid_from", "date").not_null(),
            ColumnDescriptor::new("valid_until", "date").not_null(),
            ColumnDescriptor::new("name", "text").not_null(),
            ColumnDescriptor::new("employees", "integer"),
            ColumnDescriptor::new("edit_comment", "text"),
            ColumnDescriptor::new("name_upper", "text").generated_always(),
        ]
    }

    fn source_cols(extra: &[&str]) -> Vec<ColumnDescriptor> {
        let mut cols: Vec<ColumnDescriptor> = ["row_id", "id", "tax_ident", "valid_from", "valid_until", "name"]
            .iter()
            .map(|c| ColumnDescriptor::untyped(c))
            .collect();
        cols.extend(extra.iter().map(|c| ColumnDescriptor::untyped(c)));
        cols
    }

    fn keys() -> Vec<UniqueKeyDescriptor> {
        vec![
            UniqueKeyDescriptor::new("legal_unit_id_valid", &["id"], UniqueKeyKind::Primary),
            UniqueKeyDescriptor::new("legal_unit_tax_ident_valid", &["tax_ident"], UniqueKeyKind::Natural),
        ]
    }

    fn era() -> EraMetadata {
        EraMetadata::new("valid", RangeSubtype::Date)
    }

    #[test]
    fn builds_context_with_column_roles() {
        let cfg = MergeConfig::new("legal_unit", "src", &["id"])
            .natural_key(&["tax_ident"])
            .ephemeral(&["edit_comment"]);
        let ctx = build_planner_context(&cfg, era(), &target_cols(), &source_cols(&[]), &keys()).unwrap();
        assert_eq!(ctx.strategy, IdentityStrategy::Hybrid);
        assert_eq!(ctx.identity_constraint.as_deref(), Some("legal_unit_id_valid"));
        assert!(ctx.exclude_if_null_columns.contains("name"));
        assert!(!ctx.exclude_if_null_columns.contains("id"));
        assert!(ctx.generated_columns.contains("name_upper"));
        assert!(ctx.defaulted_columns.contains("id"));
        assert_eq!(ctx.ephemeral_columns, vec!["edit_comment".to_string()]);
        assert!(!ctx.identity_is_natural);
    }

    #[test]
    fn unregistered_identity_is_rejected() {
        let cfg = MergeConfig::new("legal_unit", "src", &["name"]);
        let err = build_planner_context(&cfg, era(), &target_cols(), &source_cols(&[]), &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::IdentityNotRegistered { .. }));
    }

    #[test]
    fn missing_columns_are_rejected() {
        let cfg = MergeConfig::new("legal_unit", "src", &["id"]).founding_id_column("founding_row_id");
        let err = build_planner_context(&cfg, era(), &target_cols(), &source_cols(&[]), &keys()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownColumn { table: "src".into(), column: "founding_row_id".into() }
        );

        let cfg = MergeConfig::new("legal_unit", "src", &["id"]).row_id_column("rid");
        assert!(build_planner_context(&cfg, era(), &target_cols(), &source_cols(&[]), &keys()).is_err());

        let cfg = MergeConfig::new("legal_unit", "src", &["id"]);
        let no_range = vec![ColumnDescriptor::untyped("row_id"), ColumnDescriptor::untyped("valid_from")];
        let err = build_planner_context(&cfg, era(), &target_cols(), &no_range, &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRangeColumns { .. }));
    }

    #[test]
    fn type_mismatch_on_key_columns() {
        let cfg = MergeConfig::new("legal_unit", "src", &["id"]);
        let mut src = source_cols(&[]);
        src[1] = ColumnDescriptor::new("id", "text");
        let err = build_planner_context(&cfg, era(), &target_cols(), &src, &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { .. }));
    }

    #[test]
    fn update_for_portion_of_needs_every_data_column() {
        let cfg = MergeConfig::new("legal_unit", "src", &["id"])
            .mode(MergeMode::UpdateForPortionOf)
            .ephemeral(&["edit_comment"]);
        let err = build_planner_context(&cfg, era(), &target_cols(), &source_cols(&[]), &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteSource { ref columns, .. } if columns.contains("employees")));
        // tax_ident is a plain data column here since it is not a natural key
        let ok = build_planner_context(&cfg, era(), &target_cols(), &source_cols(&["employees"]), &keys());
        assert!(ok.is_ok());
    }
}

//! PostgreSQL binding: SPI-backed catalog, target store and source table,
//! and the SQL-callable entry points.
//!
//! Statements run inside the caller's transaction. SPI cannot open
//! subtransactions here, so the store reports no savepoint support and
//! best-effort execution is refused with a configuration error.

use pgrx::prelude::*;
use serde_json::{json, Value};

use crate::config::MergeConfig;
use crate::error::{ConfigError, MergeError, StoreError};
use crate::executor::{RowLocator, SourceTable, TargetStore};
use crate::introspect::{Catalog, ColumnDescriptor, Generated, UniqueKeyDescriptor, UniqueKeyKind};
use crate::range::RangeSubtype;
use crate::reader::TargetFilter;
use crate::types::{EraMetadata, Record};
use crate::util::{json_value_to_str, qi, ql};

fn spi_err(e: pgrx::spi::SpiError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn catalog_err(e: pgrx::spi::SpiError) -> MergeError {
    MergeError::Store(spi_err(e))
}

/// `table` is anything `regclass` accepts (`name`, `schema.name`).
fn regclass(table: &str) -> String {
    format!("{}::regclass", ql(table))
}

fn read_columns(table: &str) -> Result<Vec<ColumnDescriptor>, MergeError> {
    let query = format!(
        "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attnotnull, \
                a.atthasdef, a.attidentity::text, a.attgenerated::text \
         FROM pg_attribute a \
         WHERE a.attrelid = {} AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY a.attnum",
        regclass(table)
    );
    Spi::connect(|client| {
        let rows = client.select(&query, None, &[]).map_err(catalog_err)?;
        let mut cols = Vec::new();
        for row in rows {
            let name: String = row.get(1).map_err(catalog_err)?.unwrap_or_default();
            let type_name: String = row.get(2).map_err(catalog_err)?.unwrap_or_default();
            let not_null: bool = row.get(3).map_err(catalog_err)?.unwrap_or(false);
            let has_default: bool = row.get(4).map_err(catalog_err)?.unwrap_or(false);
            let identity: String = row.get(5).map_err(catalog_err)?.unwrap_or_default();
            let generated_expr: String = row.get(6).map_err(catalog_err)?.unwrap_or_default();
            let generated = match (identity.as_str(), generated_expr.as_str()) {
                ("a", _) => Generated::Always,
                (_, "s") | (_, "v") => Generated::Always,
                ("d", _) => Generated::ByDefault,
                _ => Generated::Never,
            };
            cols.push(ColumnDescriptor {
                name,
                type_name,
                not_null,
                has_default,
                generated,
            });
        }
        Ok(cols)
    })
}

// ── Target table ──

/// A target table reached through SPI. Serves as both catalog and store.
#[derive(Debug, Clone)]
pub struct PgTable {
    name: String,
}

impl PgTable {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    fn key_predicate(filter: &TargetFilter) -> String {
        match filter {
            TargetFilter::All => "true".to_string(),
            TargetFilter::Keys(filters) => {
                let mut alternatives = Vec::new();
                for f in filters {
                    for tuple in &f.values {
                        let parts: Vec<String> = f
                            .columns
                            .iter()
                            .zip(tuple)
                            .map(|(c, v)| match v {
                                Value::Null => format!("tgt.{} IS NULL", qi(c)),
                                v => format!("tgt.{} = {}", qi(c), ql(&json_value_to_str(v))),
                            })
                            .collect();
                        alternatives.push(format!("({})", parts.join(" AND ")));
                    }
                }
                if alternatives.is_empty() {
                    "false".to_string()
                } else {
                    alternatives.join(" OR ")
                }
            }
        }
    }

    fn locator_predicate(locator: &RowLocator) -> String {
        let mut parts: Vec<String> = locator
            .keys
            .iter()
            .map(|(k, v)| match v {
                Value::Null => format!("tgt.{} IS NULL", qi(k)),
                v => format!("tgt.{} = {}", qi(k), ql(&json_value_to_str(v))),
            })
            .collect();
        parts.push(format!(
            "tgt.{} = {}",
            qi(&locator.valid_from_col),
            ql(&locator.valid_from.to_string())
        ));
        parts.join(" AND ")
    }

    fn record_literal(&self, values: &Record) -> String {
        format!(
            "jsonb_populate_record(NULL::{}, {}::jsonb)",
            self.name,
            ql(&Value::Object(values.clone()).to_string())
        )
    }
}

impl Catalog for PgTable {
    fn era(&self, table: &str, era_name: &str) -> Result<EraMetadata, MergeError> {
        let query = format!(
            "SELECT e.range_column_name::text, e.valid_from_column_name::text, \
                    e.valid_until_column_name::text, e.valid_to_column_name::text, \
                    e.range_subtype::text, \
                    COALESCE(e.ephemeral_columns::text[], '{{}}'::text[]) \
             FROM sql_saga.era AS e \
             JOIN pg_class c ON c.relname = e.table_name \
             JOIN pg_namespace n ON n.oid = c.relnamespace AND n.nspname = e.table_schema \
             WHERE c.oid = {} AND e.era_name = {}",
            regclass(table),
            ql(era_name)
        );
        Spi::connect(|client| {
            let rows = client.select(&query, Some(1), &[]).map_err(catalog_err)?;
            if rows.is_empty() {
                return Err(ConfigError::UnknownEra {
                    table: table.to_string(),
                    era: era_name.to_string(),
                }
                .into());
            }
            let row = rows.first();
            let range_col: Option<String> = row.get(1).map_err(catalog_err)?;
            let valid_from: Option<String> = row.get(2).map_err(catalog_err)?;
            let valid_until: Option<String> = row.get(3).map_err(catalog_err)?;
            let valid_to: Option<String> = row.get(4).map_err(catalog_err)?;
            let subtype: String = row.get(5).map_err(catalog_err)?.unwrap_or_default();
            let ephemeral: Vec<String> = row.get(6).map_err(catalog_err)?.unwrap_or_default();

            let subtype = RangeSubtype::from_type_name(&subtype).map_err(ConfigError::from)?;
            let mut era = EraMetadata::new(era_name, subtype);
            if let Some(c) = valid_from {
                era.valid_from_col = c;
            }
            if let Some(c) = valid_until {
                era.valid_until_col = c;
            }
            era.valid_to_col = valid_to;
            era.range_col = range_col;
            era.ephemeral_columns = ephemeral;
            Ok(era)
        })
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>, MergeError> {
        read_columns(table)
    }

    fn unique_keys(&self, table: &str, era_name: &str) -> Result<Vec<UniqueKeyDescriptor>, MergeError> {
        let query = format!(
            "SELECT uk.unique_key_name::text, uk.column_names::text[], uk.key_type::text \
             FROM sql_saga.unique_keys AS uk \
             JOIN pg_class c ON c.relname = uk.table_name \
             JOIN pg_namespace n ON n.oid = c.relnamespace AND n.nspname = uk.table_schema \
             WHERE c.oid = {} AND uk.era_name = {} \
             ORDER BY uk.unique_key_name",
            regclass(table),
            ql(era_name)
        );
        Spi::connect(|client| {
            let rows = client.select(&query, None, &[]).map_err(catalog_err)?;
            let mut keys = Vec::new();
            for row in rows {
                let name: String = row.get(1).map_err(catalog_err)?.unwrap_or_default();
                let columns: Vec<String> = row.get(2).map_err(catalog_err)?.unwrap_or_default();
                let key_type: String = row.get(3).map_err(catalog_err)?.unwrap_or_default();
                let kind = if key_type == "primary" {
                    UniqueKeyKind::Primary
                } else {
                    UniqueKeyKind::Natural
                };
                keys.push(UniqueKeyDescriptor { name, columns, kind });
            }
            Ok(keys)
        })
    }
}

fn json_rows(table: pgrx::spi::SpiTupleTable<'_>) -> Result<Vec<Record>, StoreError> {
    let mut out = Vec::new();
    for row in table {
        if let Some(pgrx::JsonB(Value::Object(rec))) = row.get::<pgrx::JsonB>(1).map_err(spi_err)? {
            out.push(rec);
        }
    }
    Ok(out)
}

impl TargetStore for PgTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn scan(&self, filter: &TargetFilter) -> Result<Vec<Record>, StoreError> {
        let query = format!(
            "SELECT to_jsonb(tgt) FROM {} AS tgt WHERE {}",
            self.name,
            Self::key_predicate(filter)
        );
        Spi::connect(|client| json_rows(client.select(&query, None, &[]).map_err(spi_err)?))
    }

    fn insert(&mut self, values: &Record) -> Result<Record, StoreError> {
        let cols: Vec<String> = values.keys().map(|c| qi(c)).collect();
        let query = format!(
            "INSERT INTO {t} AS tgt ({cols}) SELECT {cols} FROM {rec} RETURNING to_jsonb(tgt)",
            t = self.name,
            cols = cols.join(", "),
            rec = self.record_literal(values),
        );
        Spi::connect_mut(|client| {
            let rows = json_rows(client.update(&query, None, &[]).map_err(spi_err)?)?;
            rows.into_iter()
                .next()
                .ok_or_else(|| StoreError::Backend(format!("insert into {} returned no row", self.name)))
        })
    }

    fn update(&mut self, locator: &RowLocator, assignments: &Record) -> Result<u64, StoreError> {
        if assignments.is_empty() {
            return Ok(1);
        }
        let cols: Vec<String> = assignments.keys().map(|c| qi(c)).collect();
        let query = format!(
            "UPDATE {t} AS tgt SET ({cols}) = (SELECT {cols} FROM {rec}) WHERE {pred}",
            t = self.name,
            cols = cols.join(", "),
            rec = self.record_literal(assignments),
            pred = Self::locator_predicate(locator),
        );
        Spi::connect_mut(|client| {
            let table = client.update(&query, None, &[]).map_err(spi_err)?;
            Ok(table.len() as u64)
        })
    }

    fn delete(&mut self, locator: &RowLocator) -> Result<u64, StoreError> {
        let query = format!(
            "DELETE FROM {} AS tgt WHERE {}",
            self.name,
            Self::locator_predicate(locator)
        );
        Spi::connect_mut(|client| {
            let table = client.update(&query, None, &[]).map_err(spi_err)?;
            Ok(table.len() as u64)
        })
    }

    fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        Err(StoreError::UnknownSavepoint(name.to_string()))
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        Err(StoreError::UnknownSavepoint(name.to_string()))
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        Err(StoreError::UnknownSavepoint(name.to_string()))
    }

    fn supports_savepoints(&self) -> bool {
        false
    }
}

// ── Source table ──

#[derive(Debug, Clone)]
pub struct PgSource {
    name: String,
}

impl PgSource {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

impl SourceTable for PgSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> Result<Vec<ColumnDescriptor>, MergeError> {
        read_columns(&self.name)
    }

    fn records(&self) -> Result<Vec<Record>, MergeError> {
        let query = format!("SELECT to_jsonb(src) FROM {} AS src", self.name);
        Spi::connect(|client| {
            let table = client.select(&query, None, &[]).map_err(catalog_err)?;
            json_rows(table).map_err(MergeError::Store)
        })
    }

    fn write_back(&mut self, row_id_column: &str, row_id: i64, values: &Record) -> Result<(), StoreError> {
        let cols: Vec<String> = values.keys().map(|c| qi(c)).collect();
        let query = format!(
            "UPDATE {t} AS src SET ({cols}) = (SELECT {cols} FROM jsonb_populate_record(NULL::{t}, {json}::jsonb)) \
             WHERE src.{rid} = {row_id}",
            t = self.name,
            cols = cols.join(", "),
            json = ql(&Value::Object(values.clone()).to_string()),
            rid = qi(row_id_column),
        );
        Spi::connect_mut(|client| {
            client.update(&query, None, &[]).map_err(spi_err)?;
            Ok(())
        })
    }
}

// ── SQL entry points ──

fn parse_config(config: pgrx::JsonB) -> MergeConfig {
    let pgrx::JsonB(value) = config;
    serde_json::from_value(value).unwrap_or_else(|e| pgrx::error!("invalid temporal_merge config: {}", e))
}

/// Plan, apply, and return `{"plan": [...], "feedback": [...]}`.
#[pg_extern]
fn temporal_merge_native(config: pgrx::JsonB) -> pgrx::JsonB {
    let config = parse_config(config);
    let mut target = PgTable::new(&config.target_table);
    let mut source = PgSource::new(&config.source_table);
    let outcome = crate::temporal_merge(&mut target, &mut source, &config)
        .unwrap_or_else(|e| pgrx::error!("temporal_merge [{}]: {}", e.kind().as_str(), e));
    pgrx::JsonB(json!({
        "plan": outcome.plan,
        "feedback": outcome.feedback,
    }))
}

/// Plan only; the target is not modified.
#[pg_extern]
fn temporal_merge_plan_native(config: pgrx::JsonB) -> pgrx::JsonB {
    let config = parse_config(config);
    let target = PgTable::new(&config.target_table);
    let source = PgSource::new(&config.source_table);
    let output = crate::plan(&target, &source, &config)
        .unwrap_or_else(|e| pgrx::error!("temporal_merge_plan [{}]: {}", e.kind().as_str(), e));
    pgrx::JsonB(json!(output.rows))
}

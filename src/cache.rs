//! Per-call-shape preparation and an optional cache of it.
//!
//! Resolving column roles and building the read layout depends only on the
//! configuration and the table shapes, so repeated merges of the same shape
//! can reuse the result. The cache is owned by the caller; nothing here is
//! process-wide.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::MergeConfig;
use crate::error::{ConfigError, MergeError};
use crate::introspect::{build_planner_context, ColumnDescriptor, UniqueKeyDescriptor};
use crate::reader::{build_read_layout, ReadLayout};
use crate::types::{EraMetadata, PlannerContext};

/// Everything the planner needs that does not depend on row contents.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub ctx: PlannerContext,
    pub layout: ReadLayout,
}

/// Validate a call and resolve its column layout.
pub fn prepare(
    config: &MergeConfig,
    era: EraMetadata,
    target_cols: &[ColumnDescriptor],
    source_cols: &[ColumnDescriptor],
    unique_keys: &[UniqueKeyDescriptor],
) -> Result<Prepared, MergeError> {
    let ctx = build_planner_context(config, era, target_cols, source_cols, unique_keys)?;
    let layout = build_read_layout(&ctx, source_cols, target_cols);
    Ok(Prepared { ctx, layout })
}

fn fingerprint(
    config: &MergeConfig,
    era: &EraMetadata,
    target_cols: &[ColumnDescriptor],
    source_cols: &[ColumnDescriptor],
    unique_keys: &[UniqueKeyDescriptor],
) -> Result<String, ConfigError> {
    serde_json::to_string(&(config, era, target_cols, source_cols, unique_keys))
        .map_err(|e| ConfigError::Document(e.to_string()))
}

/// Prepared call shapes keyed by an xxh3 hash of the configuration and the
/// catalog description. A hit also compares the full fingerprint, so a hash
/// collision is a miss rather than a wrong layout.
#[derive(Debug, Default)]
pub struct PlanCache {
    entries: HashMap<u64, (String, Arc<Prepared>)>,
    hits: u64,
    misses: u64,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_prepare(
        &mut self,
        config: &MergeConfig,
        era: EraMetadata,
        target_cols: &[ColumnDescriptor],
        source_cols: &[ColumnDescriptor],
        unique_keys: &[UniqueKeyDescriptor],
    ) -> Result<Arc<Prepared>, MergeError> {
        let shape = fingerprint(config, &era, target_cols, source_cols, unique_keys)?;
        let key = xxh3_64(shape.as_bytes());
        if let Some((stored, prepared)) = self.entries.get(&key) {
            if *stored == shape {
                self.hits += 1;
                return Ok(Arc::clone(prepared));
            }
        }
        self.misses += 1;
        let prepared = Arc::new(prepare(config, era, target_cols, source_cols, unique_keys)?);
        debug!(
            target = config.target_table.as_str(),
            source = config.source_table.as_str(),
            entries = self.entries.len() + 1,
            "plan cache miss"
        );
        self.entries.insert(key, (shape, Arc::clone(&prepared)));
        Ok(prepared)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

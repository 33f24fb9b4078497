//! Per-event indexing metadata.
//!
//! Metadata is recomputed for every event from three layers, later layers
//! winning:
//!
//! ```text
//! namespace default  ──▶  [[mapping]] entry  ──▶  mapper overrides (_meta)
//!   index = lowercase(ns)    index, pipeline        index, id, routing, ...
//!   version = ts.version()
//!   version_type = external
//! ```
//!
//! Only the stateful delete strategy persists any of it, as a [`StoredMeta`]
//! record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{split_namespace, ChangeEvent};
use crate::store::StoredMeta;

/// Version type used for every versioned write.
pub const VERSION_TYPE_EXTERNAL: &str = "external";

/// Static namespace → index/pipeline mapping entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub namespace: String,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
}

/// Lookup table built once from the configured mappings.
#[derive(Debug, Clone, Default)]
pub struct IndexMappings {
    by_namespace: HashMap<String, IndexMapping>,
}

impl IndexMappings {
    pub fn new(mappings: impl IntoIterator<Item = IndexMapping>) -> Self {
        let by_namespace = mappings
            .into_iter()
            .map(|m| (m.namespace.clone(), m))
            .collect();
        Self { by_namespace }
    }

    /// Destination index for a namespace: the mapped name, or the lowercased
    /// namespace.
    pub fn index_for(&self, namespace: &str) -> String {
        self.by_namespace
            .get(namespace)
            .and_then(|m| m.index.clone())
            .unwrap_or_else(|| default_index_name(namespace))
    }

    pub fn pipeline_for(&self, namespace: &str) -> Option<String> {
        self.by_namespace
            .get(namespace)
            .and_then(|m| m.pipeline.clone())
    }

    /// Indexes to delete when `db.col` is dropped.
    pub fn indexes_for_collection(&self, namespace: &str) -> Vec<String> {
        vec![self.index_for(namespace)]
    }

    /// Indexes to delete when a whole database is dropped: the default
    /// `db.*` pattern plus every explicitly mapped index of that database.
    pub fn indexes_for_database(&self, database: &str) -> Vec<String> {
        let mut out = vec![format!("{}.*", database.to_lowercase())];
        let mut mapped: Vec<String> = self
            .by_namespace
            .values()
            .filter(|m| split_namespace(&m.namespace).0 == database)
            .filter_map(|m| m.index.clone())
            .filter(|idx| !out.contains(idx))
            .collect();
        mapped.sort();
        mapped.dedup();
        out.extend(mapped);
        out
    }
}

/// Default index name for a namespace.
pub fn default_index_name(namespace: &str) -> String {
    namespace.to_lowercase()
}

/// Overrides a mapper may attach to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaOverrides {
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub routing: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub version_type: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub retry_on_conflict: Option<u32>,
}

impl MetaOverrides {
    pub fn is_empty(&self) -> bool {
        *self == MetaOverrides::default()
    }

    /// Merge `other` on top of `self`; set fields of `other` win.
    pub fn merge(&mut self, other: MetaOverrides) {
        self.skip |= other.skip;
        if other.index.is_some() {
            self.index = other.index;
        }
        if other.id.is_some() {
            self.id = other.id;
        }
        if other.routing.is_some() {
            self.routing = other.routing;
        }
        if other.parent.is_some() {
            self.parent = other.parent;
        }
        if other.version.is_some() {
            self.version = other.version;
        }
        if other.version_type.is_some() {
            self.version_type = other.version_type;
        }
        if other.pipeline.is_some() {
            self.pipeline = other.pipeline;
        }
        if other.retry_on_conflict.is_some() {
            self.retry_on_conflict = other.retry_on_conflict;
        }
    }
}

/// Destination metadata for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexingMeta {
    pub index: String,
    pub id: String,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub version: i64,
    pub version_type: String,
    pub pipeline: Option<String>,
    pub retry_on_conflict: u32,
    pub skip: bool,
}

impl IndexingMeta {
    /// Namespace default combined with the static mapping.
    pub fn derive(event: &ChangeEvent, mappings: &IndexMappings) -> Self {
        Self {
            index: mappings.index_for(&event.namespace),
            id: event.id.to_stable_string(),
            routing: None,
            parent: None,
            version: event.timestamp.version(),
            version_type: VERSION_TYPE_EXTERNAL.to_string(),
            pipeline: mappings.pipeline_for(&event.namespace),
            retry_on_conflict: 0,
            skip: false,
        }
    }

    /// Apply mapper overrides on top of the derived defaults.
    pub fn apply(&mut self, overrides: &MetaOverrides) {
        self.skip |= overrides.skip;
        if let Some(index) = &overrides.index {
            self.index = index.clone();
        }
        if let Some(id) = &overrides.id {
            self.id = id.clone();
        }
        if overrides.routing.is_some() {
            self.routing = overrides.routing.clone();
        }
        if overrides.parent.is_some() {
            self.parent = overrides.parent.clone();
        }
        if let Some(version) = overrides.version {
            self.version = version;
        }
        if let Some(vt) = &overrides.version_type {
            self.version_type = vt.clone();
        }
        if overrides.pipeline.is_some() {
            self.pipeline = overrides.pipeline.clone();
        }
        if let Some(retries) = overrides.retry_on_conflict {
            self.retry_on_conflict = retries;
        }
    }

    /// Whether a stateful delete would need a persisted record to find this
    /// document again, given the index the namespace maps to by default.
    pub fn needs_stored_record(&self, default_index: &str) -> bool {
        self.index != default_index
            || self.routing.is_some()
            || self.parent.is_some()
            || self.pipeline.is_some()
    }

    pub fn to_stored(&self, namespace: &str, source_id: &str) -> StoredMeta {
        StoredMeta {
            namespace: namespace.to_string(),
            id: source_id.to_string(),
            index: self.index.clone(),
            routing: self.routing.clone(),
            parent: self.parent.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

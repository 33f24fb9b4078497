//! Extension traits for event transformation, filtering and post-processing.
//!
//! The engine only ever calls these traits. Each has a native variant
//! implemented in Rust and registered on a [`PluginRegistry`], and a Lua
//! variant compiled from `[[script]]`, `[[filter]]` and `[[pipeline]]` config
//! tables (see [`crate::script`]).
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                PluginRegistry                 │
//! │  ┌─────────────┐ ┌──────────────┐ ┌─────────┐ │
//! │  │ Transformer │ │DocumentFilter│ │Pipeline │ │
//! │  │ native/Lua  │ │ native/Lua   │ │Builder  │ │
//! │  └─────────────┘ └──────────────┘ └─────────┘ │
//! │  ┌────────────────────────────────────────┐   │
//! │  │ PostProcessor (native only)            │   │
//! │  └────────────────────────────────────────┘   │
//! └───────────────────────┬───────────────────────┘
//!                         ▼
//!        filter chain → mapper chain → indexer
//! ```
//!
//! Plugins are keyed by namespace, or registered globally. At most one
//! transformer, filter and pipeline builder may exist per key; registering a
//! second one (for example a native transformer and a script for the same
//! namespace) is a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use docsync_core::meta::MetaOverrides;
use docsync_core::models::{ChangeEvent, Document, Operation, UpdateDescription};
use docsync_core::store::{IndexBackend, SourceStore};
use serde_json::Value;

// ═══════════════════════════════════════════════════════════════════════
// Transformer
// ═══════════════════════════════════════════════════════════════════════

/// What a transformer or filter sees of an event.
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    pub namespace: &'a str,
    pub operation: Operation,
    pub document: &'a Document,
    pub update: Option<&'a UpdateDescription>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformAction {
    /// Keep the document as it is.
    Passthrough,
    Replace(Document),
    /// Discard the event; updates become deletes.
    Drop,
    /// Suppress the write but still count the event as applied.
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub action: TransformAction,
    pub meta: MetaOverrides,
}

impl TransformOutput {
    pub fn passthrough() -> Self {
        Self::with_action(TransformAction::Passthrough)
    }

    pub fn replace(doc: Document) -> Self {
        Self::with_action(TransformAction::Replace(doc))
    }

    pub fn drop() -> Self {
        Self::with_action(TransformAction::Drop)
    }

    pub fn skip() -> Self {
        Self::with_action(TransformAction::Skip)
    }

    pub fn with_meta(mut self, meta: MetaOverrides) -> Self {
        self.meta = meta;
        self
    }

    fn with_action(action: TransformAction) -> Self {
        Self {
            action,
            meta: MetaOverrides::default(),
        }
    }
}

/// Rewrites a document and its destination metadata.
///
/// Called synchronously from a blocking task; implementations may do
/// CPU-bound work but should not wait on I/O.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use docsync::plugins::{TransformInput, TransformOutput, Transformer};
///
/// struct StripSecrets;
///
/// impl Transformer for StripSecrets {
///     fn name(&self) -> &str { "strip-secrets" }
///
///     fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
///         let mut doc = input.document.clone();
///         doc.remove("password");
///         Ok(TransformOutput::replace(doc))
///     }
/// }
/// ```
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;
    fn transform(&self, input: &TransformInput) -> Result<TransformOutput>;
}

// ═══════════════════════════════════════════════════════════════════════
// Filter and pipeline
// ═══════════════════════════════════════════════════════════════════════

/// Document-level predicate; only consulted for inserts and updates that
/// carry a document.
pub trait DocumentFilter: Send + Sync {
    fn name(&self) -> &str;
    fn filter(&self, input: &TransformInput) -> Result<bool>;
}

/// Builds aggregation stages applied to direct reads (`change_events =
/// false`) and the live feed (`change_events = true`) of a namespace.
pub trait PipelineBuilder: Send + Sync {
    fn name(&self) -> &str;
    fn pipeline(&self, namespace: &str, change_events: bool) -> Result<Vec<Value>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Post-processor
// ═══════════════════════════════════════════════════════════════════════

/// Handles available to a post-processor.
#[derive(Clone)]
pub struct PostContext {
    pub index: Arc<dyn IndexBackend>,
    pub source: Arc<dyn SourceStore>,
}

/// Invoked on a copy of every routed event, off the indexing path.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, event: &ChangeEvent, ctx: &PostContext) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Plugins by namespace; the `None` key holds the global one.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    transformers: HashMap<Option<String>, Arc<dyn Transformer>>,
    filters: HashMap<Option<String>, Arc<dyn DocumentFilter>>,
    pipelines: HashMap<Option<String>, Arc<dyn PipelineBuilder>>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transformer(
        &mut self,
        namespace: Option<&str>,
        transformer: Arc<dyn Transformer>,
    ) -> Result<()> {
        insert_unique(&mut self.transformers, "transformer", namespace, transformer, |t| {
            t.name().to_string()
        })
    }

    pub fn register_filter(
        &mut self,
        namespace: Option<&str>,
        filter: Arc<dyn DocumentFilter>,
    ) -> Result<()> {
        insert_unique(&mut self.filters, "filter", namespace, filter, |f| {
            f.name().to_string()
        })
    }

    pub fn register_pipeline(
        &mut self,
        namespace: Option<&str>,
        builder: Arc<dyn PipelineBuilder>,
    ) -> Result<()> {
        insert_unique(&mut self.pipelines, "pipeline", namespace, builder, |p| {
            p.name().to_string()
        })
    }

    pub fn register_post_processor(&mut self, processor: Arc<dyn PostProcessor>) {
        self.post_processors.push(processor);
    }

    /// Global transformer first, then the namespace one.
    pub fn transformers_for(&self, namespace: &str) -> Vec<Arc<dyn Transformer>> {
        layered(&self.transformers, namespace)
    }

    /// Global filter first, then the namespace one. Both must accept.
    pub fn filters_for(&self, namespace: &str) -> Vec<Arc<dyn DocumentFilter>> {
        layered(&self.filters, namespace)
    }

    /// The namespace builder, falling back to the global one.
    pub fn pipeline_for(&self, namespace: &str) -> Option<Arc<dyn PipelineBuilder>> {
        self.pipelines
            .get(&Some(namespace.to_string()))
            .or_else(|| self.pipelines.get(&None))
            .cloned()
    }

    pub fn post_processors(&self) -> &[Arc<dyn PostProcessor>] {
        &self.post_processors
    }

    pub fn has_transformers(&self) -> bool {
        !self.transformers.is_empty()
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    pub fn has_pipelines(&self) -> bool {
        !self.pipelines.is_empty()
    }
}

fn insert_unique<T: ?Sized>(
    map: &mut HashMap<Option<String>, Arc<T>>,
    kind: &str,
    namespace: Option<&str>,
    plugin: Arc<T>,
    name_of: impl Fn(&T) -> String,
) -> Result<()> {
    let key = namespace.map(str::to_string);
    if let Some(existing) = map.get(&key) {
        bail!(
            "{} '{}' conflicts with '{}' already registered for {}",
            kind,
            name_of(&plugin),
            name_of(existing),
            namespace.unwrap_or("all namespaces")
        );
    }
    map.insert(key, plugin);
    Ok(())
}

fn layered<T: ?Sized>(map: &HashMap<Option<String>, Arc<T>>, namespace: &str) -> Vec<Arc<T>> {
    let mut out = Vec::new();
    if let Some(global) = map.get(&None) {
        out.push(global.clone());
    }
    if let Some(local) = map.get(&Some(namespace.to_string())) {
        out.push(local.clone());
    }
    out
}

//! Immutable per-process context.
//!
//! Everything derived from configuration at startup (the index mappings,
//! the relation table, the filter chain, namespace sets, and the plugin
//! registry) is built once into a [`SyncContext`] and shared behind an
//! `Arc` by every stage. Nothing in it changes after startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use docsync_core::filter::{DocumentPredicate, FilterChain, StandardFilters};
use docsync_core::meta::IndexMappings;
use docsync_core::models::ChangeEvent;
use docsync_core::relation::RelationTable;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::config::Config;
use crate::error::{ErrorReporter, SyncError};
use crate::plugins::{PluginRegistry, TransformInput};

/// A set of namespaces given as exact names or globs (`db.*`).
#[derive(Debug, Clone)]
pub struct NamespaceSet {
    globs: GlobSet,
    len: usize,
}

impl NamespaceSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut len = 0;
        for p in patterns.iter().filter(|p| !p.is_empty()) {
            builder.add(
                Glob::new(p).with_context(|| format!("Invalid namespace pattern: {}", p))?,
            );
            len += 1;
        }
        Ok(Self {
            globs: builder.build()?,
            len,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.globs.is_match(namespace)
    }

    /// Empty means every namespace.
    pub fn contains_or_all(&self, namespace: &str) -> bool {
        self.is_empty() || self.contains(namespace)
    }
}

pub struct SyncContext {
    pub config: Config,
    pub mappings: IndexMappings,
    pub relations: RelationTable,
    pub filters: FilterChain,
    pub plugins: PluginRegistry,
    pub time_machine: NamespaceSet,
    pub file_namespaces: NamespaceSet,
    pub routing_namespaces: NamespaceSet,
    /// `change-stream-namespaces`; empty means the whole deployment.
    pub change_namespaces: NamespaceSet,
    pub reporter: ErrorReporter,
}

impl SyncContext {
    pub fn new(config: Config, plugins: PluginRegistry, reporter: ErrorReporter) -> Result<Arc<Self>> {
        let standard = StandardFilters {
            admin_database: config.admin_namespace.clone(),
            namespace_regex: config.namespace_regex()?,
            namespace_exclude_regex: config.namespace_exclude_regex()?,
            namespace_drop_regex: config.namespace_drop_regex()?,
            namespace_drop_exclude_regex: config.namespace_drop_exclude_regex()?,
            worker: config
                .worker
                .as_ref()
                .filter(|_| !config.workers.is_empty())
                .map(|w| (w.clone(), config.workers.clone())),
        };
        let mut filters = FilterChain::standard(standard);
        if plugins.has_filters() {
            let registry = plugins.clone();
            let reporter = reporter.clone();
            filters.push(DocumentPredicate::new("document-filter", move |event: &ChangeEvent| {
                run_document_filters(&registry, &reporter, event)
            }));
        }

        Ok(Arc::new(Self {
            mappings: IndexMappings::new(config.mappings.clone()),
            relations: RelationTable::new(config.relations()?),
            time_machine: NamespaceSet::new(&config.time_machine_namespaces)?,
            file_namespaces: NamespaceSet::new(&config.file_namespaces)?,
            routing_namespaces: NamespaceSet::new(&config.routing_namespaces)?,
            change_namespaces: NamespaceSet::new(&config.change_stream_namespaces)?,
            filters,
            plugins,
            reporter,
            config,
        }))
    }

    /// Whether the attachment pipeline handles this event.
    pub fn has_file_content(&self, event: &ChangeEvent) -> bool {
        self.config.index_files
            && event.document.is_some()
            && !event.is_delete()
            && self.file_namespaces.contains(&event.namespace)
    }

    /// Run the filter chain. Document filters may run scripts, so when any
    /// are registered the chain is evaluated on a blocking thread.
    pub async fn screen(self: &Arc<Self>, event: ChangeEvent) -> Result<Screened> {
        if !self.plugins.has_filters() {
            return Ok(self.verdict(event));
        }
        let ctx = self.clone();
        tokio::task::spawn_blocking(move || ctx.verdict(event))
            .await
            .context("filter task panicked")
    }

    fn verdict(&self, event: ChangeEvent) -> Screened {
        match self.filters.rejected_by(&event) {
            Some(filter) => Screened::Rejected(event, filter.to_string()),
            None => Screened::Accepted(event),
        }
    }

    pub fn is_time_machine(&self, event: &ChangeEvent) -> bool {
        !self.time_machine.is_empty()
            && self.time_machine.contains(&event.namespace)
            && (event.is_live() || self.config.time_machine_direct_reads)
    }
}

/// Result of [`SyncContext::screen`].
#[derive(Debug)]
pub enum Screened {
    Accepted(ChangeEvent),
    /// Rejected, with the name of the filter that rejected it.
    Rejected(ChangeEvent, String),
}

/// All document filters for the namespace must accept. A filter error
/// rejects the event and is reported.
fn run_document_filters(
    registry: &PluginRegistry,
    reporter: &ErrorReporter,
    event: &ChangeEvent,
) -> bool {
    let Some(document) = event.document.as_ref() else {
        return true;
    };
    let input = TransformInput {
        namespace: &event.namespace,
        operation: event.operation,
        document,
        update: event.update_description.as_ref(),
    };
    for filter in registry.filters_for(&event.namespace) {
        match filter.filter(&input) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(filter = filter.name(), id = %event.id, "document filter failed");
                reporter.report(SyncError::transform(&event.namespace, e));
                return false;
            }
        }
    }
    true
}

//! Indexing pipeline.
//!
//! ```text
//!              ┌──────────────┐
//!  events ──▶  │ dispatch by  │──▶ worker 0 ─┐
//!              │ hash(ns, id) │──▶ worker 1 ─┼──▶ BulkProcessor ──▶ IndexBackend
//!              └──────────────┘──▶ worker N ─┘
//! ```
//!
//! Every event for one document lands on the same worker, so the actions
//! for a document reach the bulk processor in feed order. Workers run the
//! mapper chain, resolve delete targets and turn events into
//! [`BulkAction`]s. Drops bypass the workers: the caller flushes everything
//! in flight and then deletes the indexes directly.
//!
//! Every non-delete write carries `version = timestamp.version()` with
//! external versioning, so re-delivery is idempotent at the index.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use docsync_core::meta::IndexingMeta;
use docsync_core::models::{ChangeEvent, Document, Operation, ID_FIELD};
use docsync_core::store::{ActionMeta, BulkAction, IndexBackend, StateStore};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bulk::{BulkCommand, BulkProcessor, BulkSettings};
use crate::config::DeleteStrategy;
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::stats::IndexStats;
use crate::transform::{apply_mappers, Mapped};

/// Ingest pipeline used for attachment content extraction.
pub const ATTACHMENT_PIPELINE: &str = "attachment";

/// Document field carrying base64 attachment content.
pub const FILE_FIELD: &str = "file";

pub enum IndexCommand {
    Event(ChangeEvent),
    /// Acknowledged once everything queued before it was handed to the bulk
    /// processor.
    Barrier(oneshot::Sender<()>),
}

/// Cloneable sending side of the indexing pipeline.
#[derive(Clone)]
pub struct IndexerHandle {
    workers: Arc<Vec<mpsc::Sender<IndexCommand>>>,
    bulk: mpsc::Sender<BulkCommand>,
    ctx: Arc<SyncContext>,
    index: Arc<dyn IndexBackend>,
    state: Arc<dyn StateStore>,
}

impl IndexerHandle {
    /// Queue an insert, update or delete. Returns `false` once the pipeline
    /// has shut down.
    pub async fn send(&self, event: ChangeEvent) -> bool {
        let slot = worker_slot(&event, self.workers.len());
        self.workers[slot]
            .send(IndexCommand::Event(event))
            .await
            .is_ok()
    }

    /// Wait until every queued event has been written to the index.
    pub async fn flush(&self) {
        for worker in self.workers.iter() {
            let (ack, done) = oneshot::channel();
            if worker.send(IndexCommand::Barrier(ack)).await.is_ok() {
                let _ = done.await;
            }
        }
        let (ack, done) = oneshot::channel();
        if self.bulk.send(BulkCommand::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Apply a collection or database drop: flush, then delete the mapped
    /// indexes and any stored delete metadata.
    pub async fn drop_namespace(&self, event: &ChangeEvent) -> Result<()> {
        let config = &self.ctx.config;
        let (indexes, enabled) = match event.operation {
            Operation::DropDatabase => (
                self.ctx.mappings.indexes_for_database(&event.namespace),
                config.dropped_databases,
            ),
            Operation::DropCollection => (
                self.ctx.mappings.indexes_for_collection(&event.namespace),
                config.dropped_collections,
            ),
            _ => bail!("{} is not a drop", event.operation.name()),
        };
        self.flush().await;
        if !enabled {
            debug!(namespace = %event.namespace, "drop handling disabled, ignoring");
            return Ok(());
        }

        info!(namespace = %event.namespace, indexes = ?indexes, "dropping indexes");
        self.index
            .delete_indexes(&indexes)
            .await
            .with_context(|| format!("Failed to drop indexes for {}", event.namespace))?;

        if config.delete_strategy() == DeleteStrategy::Stateful {
            if let Err(e) = self.state.purge_meta(&event.namespace).await {
                warn!(namespace = %event.namespace, error = %e, "unable to delete stored metadata");
            }
        }
        Ok(())
    }
}

fn worker_slot(event: &ChangeEvent, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    event.namespace.hash(&mut hasher);
    event.id.to_stable_string().hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Running index workers and their bulk processor.
pub struct Indexer {
    handle: IndexerHandle,
    workers: Vec<JoinHandle<()>>,
    bulk: JoinHandle<()>,
}

impl Indexer {
    /// Spawn `index-workers` workers and the bulk processor. Puts the
    /// attachment ingest pipeline first when files are indexed.
    pub async fn start(
        ctx: Arc<SyncContext>,
        index: Arc<dyn IndexBackend>,
        state: Arc<dyn StateStore>,
        stats: Arc<IndexStats>,
    ) -> Result<Self> {
        let config = &ctx.config;
        if config.index_files && !config.disable_file_pipeline_put {
            index
                .put_pipeline(ATTACHMENT_PIPELINE, &attachment_pipeline())
                .await
                .context("Failed to install the attachment pipeline")?;
        }

        let processor = BulkProcessor::new(
            index.clone(),
            BulkSettings::from_config(config),
            stats.clone(),
            ctx.reporter.clone(),
        );
        let (bulk_tx, bulk) = processor.spawn(config.channel_size);

        let mut senders = Vec::with_capacity(config.index_workers);
        let mut workers = Vec::with_capacity(config.index_workers);
        for _ in 0..config.index_workers.max(1) {
            let (tx, rx) = mpsc::channel(config.channel_size);
            let worker = IndexWorker {
                ctx: ctx.clone(),
                index: index.clone(),
                state: state.clone(),
                bulk: bulk_tx.clone(),
                stats: stats.clone(),
            };
            senders.push(tx);
            workers.push(tokio::spawn(worker.run(rx)));
        }

        Ok(Self {
            handle: IndexerHandle {
                workers: Arc::new(senders),
                bulk: bulk_tx,
                ctx,
                index,
                state,
            },
            workers,
            bulk,
        })
    }

    pub fn handle(&self) -> IndexerHandle {
        self.handle.clone()
    }

    /// Drain the workers and the bulk buffer. Every other handle must have
    /// been dropped already.
    pub async fn shutdown(self) {
        drop(self.handle);
        for worker in self.workers {
            let _ = worker.await;
        }
        let _ = self.bulk.await;
    }
}

pub fn attachment_pipeline() -> Value {
    json!({
        "description": "Extract file information",
        "processors": [
            { "attachment": { "field": FILE_FIELD } }
        ]
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════

struct IndexWorker {
    ctx: Arc<SyncContext>,
    index: Arc<dyn IndexBackend>,
    state: Arc<dyn StateStore>,
    bulk: mpsc::Sender<BulkCommand>,
    stats: Arc<IndexStats>,
}

impl IndexWorker {
    async fn run(self, mut rx: mpsc::Receiver<IndexCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                IndexCommand::Event(event) => self.process(event).await,
                IndexCommand::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn process(&self, event: ChangeEvent) {
        let namespace = event.namespace.clone();
        let result = match event.operation {
            Operation::Insert | Operation::Update => self.write(event).await,
            Operation::Delete => self.delete(&event).await,
            Operation::DropCollection | Operation::DropDatabase => Ok(()),
        };
        if let Err(e) = result {
            self.ctx
                .reporter
                .report(SyncError::index(e.context(format!("namespace {}", namespace))));
        }
    }

    async fn write(&self, event: ChangeEvent) -> Result<()> {
        let Some((mut event, mapped)) = self.map(event).await? else {
            return Ok(());
        };
        let overrides = match mapped {
            Mapped::Write(overrides) => overrides,
            Mapped::Skip => {
                self.stats.record_skip();
                return Ok(());
            }
            Mapped::Drop if event.is_update() => return self.delete(&event).await,
            Mapped::Drop => return Ok(()),
        };

        let mut meta = IndexingMeta::derive(&event, &self.ctx.mappings);
        meta.apply(&overrides);
        if meta.skip {
            self.stats.record_skip();
            return Ok(());
        }

        match event.document.take() {
            Some(doc) => {
                let source_id = event.id.to_stable_string();
                if source_id.is_empty() || meta.id.is_empty() {
                    bail!("unable to index document with an empty _id");
                }
                if self.ctx.config.delete_strategy() == DeleteStrategy::Stateful
                    && meta.needs_stored_record(&self.ctx.mappings.index_for(&event.namespace))
                {
                    if let Err(e) = self
                        .state
                        .save_meta(&meta.to_stored(&event.namespace, &source_id))
                        .await
                    {
                        warn!(id = %source_id, error = %e, "unable to save routing info");
                    }
                }
                for action in index_actions(&self.ctx, &event, doc, &meta) {
                    self.emit(action).await?;
                }
                Ok(())
            }
            None => match event.update_description.take() {
                Some(desc) if event.is_update() => {
                    let action = BulkAction::Update {
                        meta: addressing(&meta),
                        doc: desc.to_partial_document(),
                        upsert: false,
                    };
                    self.emit(action).await
                }
                _ if event.is_update() => self.delete(&event).await,
                _ => Ok(()),
            },
        }
    }

    /// Run the mapper chain off the async runtime. `None` when a
    /// transformer failed; the failure is already reported.
    async fn map(&self, mut event: ChangeEvent) -> Result<Option<(ChangeEvent, Mapped)>> {
        if !self.ctx.plugins.has_transformers() || event.document.is_none() {
            return Ok(Some((event, Mapped::Write(Default::default()))));
        }
        let ctx = self.ctx.clone();
        let (event, mapped) = tokio::task::spawn_blocking(move || {
            let mapped = apply_mappers(&ctx.plugins, &mut event);
            (event, mapped)
        })
        .await
        .context("mapper task panicked")?;
        match mapped {
            Ok(m) => Ok(Some((event, m))),
            Err(e) => {
                warn!(namespace = %event.namespace, id = %event.id, "transform failed, event dropped");
                self.ctx
                    .reporter
                    .report(SyncError::transform(&event.namespace, e));
                Ok(None)
            }
        }
    }

    async fn delete(&self, event: &ChangeEvent) -> Result<()> {
        let config = &self.ctx.config;
        let strategy = config.delete_strategy();
        if strategy == DeleteStrategy::Ignore {
            return Ok(());
        }
        let id = event.id.to_stable_string();
        if id.is_empty() {
            bail!("unable to delete document with an empty _id");
        }
        let default_index = self.ctx.mappings.index_for(&event.namespace);
        let mut meta = ActionMeta {
            index: default_index.clone(),
            id: id.clone(),
            ..Default::default()
        };
        if !config.index_as_update {
            meta.version = Some(event.timestamp.version());
            meta.version_type = Some(docsync_core::meta::VERSION_TYPE_EXTERNAL.to_string());
        }

        let routed = self.ctx.routing_namespaces.contains_or_all(&event.namespace);
        match strategy {
            DeleteStrategy::Stateful if routed => {
                if let Some(stored) = self.state.take_meta(&event.namespace, &id).await? {
                    meta.index = stored.index;
                    meta.routing = stored.routing;
                    meta.parent = stored.parent;
                }
            }
            DeleteStrategy::Stateless if routed => {
                let hits = self
                    .index
                    .find_by_id(&config.delete_index_pattern, &id, false)
                    .await?;
                let hit = match hits.len() {
                    0 => {
                        warn!(
                            id = %id,
                            namespace = %event.namespace,
                            pattern = %config.delete_index_pattern,
                            "delete skipped: document not found in the index"
                        );
                        self.stats.record_delete_miss();
                        return Ok(());
                    }
                    1 => &hits[0],
                    n => match hits.iter().find(|h| h.index == default_index) {
                        Some(hit) => hit,
                        None => bail!(
                            "found {} documents with id {} in {}, none in {}; not deleting",
                            n,
                            id,
                            config.delete_index_pattern,
                            default_index
                        ),
                    },
                };
                meta.index = hit.index.clone();
                meta.routing = hit.routing.clone();
                meta.parent = hit.parent.clone();
            }
            _ => {}
        }
        self.emit(BulkAction::Delete { meta }).await
    }

    async fn emit(&self, action: BulkAction) -> Result<()> {
        self.bulk
            .send(BulkCommand::Add(action))
            .await
            .map_err(|_| anyhow::anyhow!("bulk processor has stopped"))
    }
}

/// Index, routing and parent only; partial updates carry no version.
fn addressing(meta: &IndexingMeta) -> ActionMeta {
    ActionMeta {
        index: meta.index.clone(),
        id: meta.id.clone(),
        routing: meta.routing.clone(),
        parent: meta.parent.clone(),
        ..Default::default()
    }
}

/// Build the write (and time machine copy) for a document event.
pub fn index_actions(
    ctx: &SyncContext,
    event: &ChangeEvent,
    mut doc: Document,
    meta: &IndexingMeta,
) -> Vec<BulkAction> {
    let config = &ctx.config;
    doc.remove(ID_FIELD);
    if config.index_oplog_time {
        add_oplog_time(ctx, event, &mut doc);
    }

    let ingest_attachment = ctx.has_file_content(event) && doc.contains_key(FILE_FIELD);
    let pipeline = if ingest_attachment {
        Some(ATTACHMENT_PIPELINE.to_string())
    } else {
        meta.pipeline.clone()
    };
    let retry_on_conflict = (meta.retry_on_conflict > 0).then_some(meta.retry_on_conflict);

    let mut actions = Vec::with_capacity(2);
    if ctx.is_time_machine(event) {
        actions.push(time_machine_action(ctx, event, &doc, meta, pipeline.clone()));
    }

    let primary = if config.index_as_update && pipeline.is_none() {
        BulkAction::Update {
            meta: ActionMeta {
                retry_on_conflict,
                ..addressing(meta)
            },
            doc,
            upsert: true,
        }
    } else {
        BulkAction::Index {
            meta: ActionMeta {
                version: (meta.version != 0).then_some(meta.version),
                version_type: (!meta.version_type.is_empty()).then(|| meta.version_type.clone()),
                pipeline,
                ..addressing(meta)
            },
            doc,
        }
    };
    actions.insert(0, primary);
    actions
}

fn add_oplog_time(ctx: &SyncContext, event: &ChangeEvent, doc: &mut Document) {
    let config = &ctx.config;
    doc.insert(
        config.oplog_ts_field_name.clone(),
        Value::from(event.timestamp.version()),
    );
    doc.insert(
        config.oplog_date_field_name.clone(),
        Value::String(
            event
                .timestamp
                .datetime()
                .format(&config.oplog_date_field_format)
                .to_string(),
        ),
    );
}

fn time_machine_action(
    ctx: &SyncContext,
    event: &ChangeEvent,
    doc: &Document,
    meta: &IndexingMeta,
    pipeline: Option<String>,
) -> BulkAction {
    let config = &ctx.config;
    let source_id = event.id.to_stable_string();
    let mut copy = doc.clone();
    copy.insert("_source_id".to_string(), Value::String(source_id.clone()));
    if !config.index_oplog_time {
        add_oplog_time(ctx, event, &mut copy);
    }
    let index = format!(
        "{}.{}.{}",
        config.time_machine_index_prefix,
        meta.index,
        Utc::now().format(&config.time_machine_index_suffix)
    )
    .to_lowercase();
    BulkAction::Index {
        meta: ActionMeta {
            index,
            id: Uuid::new_v4().to_string(),
            routing: Some(source_id),
            pipeline,
            ..Default::default()
        },
        doc: copy,
    }
}

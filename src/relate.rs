//! Relationship expander.
//!
//! A root event whose namespace has relations is queued here; a pool of
//! `relate-threads` workers expands it breadth-first:
//!
//! ```text
//! depth 1:  root (db.a)            ──relation──▶  matches in db.b
//! depth 2:  each db.b match        ──relation──▶  matches in db.c
//! ...
//! ```
//!
//! Every match becomes a `DerivedJoin` event with the root's operation. A
//! relation with `max-depth = n > 0` caps how far the chain that passed
//! through it may go; the cap is inherited by everything derived from it.
//!
//! The queue is bounded and never blocks the event loop: when it is full
//! the expansion is skipped with a warning.

use std::sync::Arc;

use anyhow::{Context, Result};
use docsync_core::models::{ChangeEvent, DocId, Document, EventSource, OpTimestamp, ID_FIELD};
use docsync_core::relation::Relation;
use docsync_core::store::{IndexBackend, SourceStore};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::attachment::EventSink;
use crate::context::{Screened, SyncContext};
use crate::error::SyncError;

/// Depth limit of a chain that has not passed a bounded relation.
const UNBOUNDED: i32 = i32::MAX;

/// Non-blocking sending side of the relate queue.
#[derive(Clone)]
pub struct RelateQueue {
    tx: mpsc::Sender<ChangeEvent>,
}

impl RelateQueue {
    /// Queue a root event. Returns `false` when the queue was full and the
    /// event was skipped.
    pub fn offer(&self, event: ChangeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                warn!(
                    namespace = %event.namespace,
                    id = %event.id,
                    "Relate queue is full. Skipping relate for {}.({}) to keep pipeline healthy.",
                    event.namespace,
                    event.id
                );
                false
            }
        }
    }
}

/// Start the relate workers. The returned queue holds `relate-buffer`
/// events.
pub fn spawn_relate_workers(
    ctx: Arc<SyncContext>,
    source: Arc<dyn SourceStore>,
    sink: EventSink,
) -> (RelateQueue, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(ctx.config.relate_buffer.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..ctx.config.relate_threads.max(1))
        .map(|_| {
            let rx = rx.clone();
            let expander = Expander {
                ctx: ctx.clone(),
                source: source.clone(),
                sink: sink.clone(),
            };
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(root) = next else { break };
                    if let Err(e) = expander.expand(root).await {
                        expander.ctx.reporter.report(SyncError::relate(e));
                    }
                }
            })
        })
        .collect();
    (RelateQueue { tx }, handles)
}

pub struct Expander {
    ctx: Arc<SyncContext>,
    source: Arc<dyn SourceStore>,
    sink: EventSink,
}

impl Expander {
    pub fn new(ctx: Arc<SyncContext>, source: Arc<dyn SourceStore>, sink: EventSink) -> Self {
        Self { ctx, source, sink }
    }

    /// Expand one root event to completion.
    pub async fn expand(&self, root: ChangeEvent) -> Result<()> {
        let operation = root.operation;
        let update = root.update_description.clone();
        let mut batch = vec![(root, UNBOUNDED)];
        let mut depth = 1;

        while !batch.is_empty() {
            let mut next = Vec::new();
            for (event, limit) in batch {
                for r in self.ctx.relations.for_namespace(&event.namespace) {
                    if !applies_at(r, depth, limit) {
                        continue;
                    }
                    let child_limit = inherit_limit(r, limit);

                    if event.is_delete() && r.is_identity() {
                        let mut derived = event.clone();
                        derived.namespace = r.with_namespace.clone();
                        derived.source = EventSource::DerivedJoin;
                        derived.resume_token = None;
                        let Screened::Accepted(derived) = self.ctx.screen(derived).await? else {
                            continue;
                        };
                        self.sink.post(&derived).await;
                        self.sink.index(derived.clone()).await;
                        next.push((derived, child_limit));
                        continue;
                    }

                    let Some(doc) = event.document.as_ref() else {
                        continue;
                    };
                    let value = match r.source_value(doc) {
                        Ok(Some(v)) => v,
                        Ok(None) => continue,
                        Err(e) => {
                            self.ctx.reporter.report(SyncError::relate(e));
                            continue;
                        }
                    };
                    let selector = r.selector(value);
                    let matches = self
                        .source
                        .find(&r.with_namespace, &selector)
                        .await
                        .with_context(|| format!("related query on {} failed", r.with_namespace))?;
                    debug!(
                        from = %event.namespace,
                        to = %r.with_namespace,
                        matches = matches.len(),
                        depth,
                        "relation expanded"
                    );

                    for found in matches {
                        let Some(id) = DocId::from_document(&found) else {
                            continue;
                        };
                        let derived = ChangeEvent {
                            id,
                            namespace: r.with_namespace.clone(),
                            operation,
                            document: Some(found),
                            update_description: update.clone(),
                            source: EventSource::DerivedJoin,
                            timestamp: OpTimestamp::now(),
                            resume_token: None,
                        };
                        let Screened::Accepted(derived) = self.ctx.screen(derived).await? else {
                            continue;
                        };
                        self.sink.post(&derived).await;

                        let (skip, visit) = self.next_step(&derived, depth + 1, child_limit);
                        if visit {
                            next.push((derived.clone(), child_limit));
                        }
                        if !skip {
                            self.sink.index(derived).await;
                        }
                    }
                }
            }
            depth += 1;
            batch = next;
        }
        Ok(())
    }

    /// Whether a derived event will itself be expanded (`visit`), and if so
    /// whether its own document stays out of the index (`skip`).
    fn next_step(&self, derived: &ChangeEvent, depth: i32, limit: i32) -> (bool, bool) {
        let relations = self.ctx.relations.for_namespace(&derived.namespace);
        let visit = relations.iter().any(|r| applies_at(r, depth, limit));
        let skip = visit && !relations.iter().any(|r| r.keep_src);
        (skip, visit)
    }
}

fn applies_at(r: &Relation, depth: i32, limit: i32) -> bool {
    depth <= limit && (r.max_depth <= 0 || depth <= r.max_depth)
}

fn inherit_limit(r: &Relation, limit: i32) -> i32 {
    if r.max_depth > 0 {
        limit.min(r.max_depth)
    } else {
        limit
    }
}

/// Document data for relating a delete. Relations that only join on `_id`
/// need nothing but the id; otherwise the deleted document is read back from
/// the index before the delete is applied.
pub async fn deleted_source(
    ctx: &SyncContext,
    index: &dyn IndexBackend,
    event: &ChangeEvent,
) -> Option<Document> {
    let relations = ctx.relations.for_namespace(&event.namespace);
    if relations.is_empty() {
        return None;
    }
    if relations.iter().all(|r| r.src_field == ID_FIELD) {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), event.id.to_value());
        return Some(doc);
    }

    let id = event.id.to_stable_string();
    let pattern = &ctx.config.delete_index_pattern;
    let hits = match index.find_by_id(pattern, &id, true).await {
        Ok(hits) => hits,
        Err(e) => {
            error!(id = %id, error = %e, "Unable to find deleted document");
            return None;
        }
    };
    let default_index = ctx.mappings.index_for(&event.namespace);
    let hit = match hits.len() {
        0 => {
            error!(id = %id, "Found no hits for deleted document");
            return None;
        }
        1 => &hits[0],
        _ => match hits.iter().find(|h| h.index == default_index) {
            Some(hit) => hit,
            None => {
                error!(id = %id, "Found multiple hits for deleted document");
                return None;
            }
        },
    };
    let Some(mut source) = hit.source.clone() else {
        error!(id = %id, "Source unavailable for deleted document");
        return None;
    };
    source.insert(ID_FIELD.to_string(), event.id.to_value());
    Some(source)
}

/// A delete event carrying the data needed to relate it.
pub fn with_data(event: &ChangeEvent, data: Document) -> ChangeEvent {
    let mut rooted = event.detached();
    rooted.document = Some(data);
    rooted
}

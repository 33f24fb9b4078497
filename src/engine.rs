//! Event loop and pipeline wiring.
//!
//! ```text
//!  LiveFeed ──┐                          ┌──▶ relate workers ──┐
//!             ├─ filters ──▶ event loop ─┤                     ├──▶ EventSink ──▶ downloaders ──┐
//!  Direct  ───┘             (checkpoint, └─────────────────────┘        │                      │
//!                            lease, http, post)                          └──────▶ index workers ◀┘
//!                                                                                      │
//!                                                                                BulkProcessor
//! ```
//!
//! Readers run the filter chain before handing events to the loop, so a
//! slow document filter never holds up heartbeats or shutdown. Rejected
//! events still reach the loop to advance the checkpoint.
//!
//! The loop owns the source channel and the [`Coordinator`]. While the
//! process is not the active cluster member it stops receiving, so readers
//! block on the full channel and nothing is lost.
//!
//! Shutdown drains in dependency order: readers, relate workers,
//! downloaders and post-processors, index workers, bulk processor. The final
//! checkpoint is written last. A fail-fast error skips the drain and the
//! checkpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use docsync_core::models::ChangeEvent;
use docsync_core::store::{IndexBackend, ReplicationLog, SourceStore, StateStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attachment::{spawn_downloaders, EventSink};
use crate::context::{Screened, SyncContext};
use crate::coordinator::{Coordinator, ProcessState};
use crate::direct::DirectReader;
use crate::error::SyncError;
use crate::indexer::{Indexer, IndexerHandle};
use crate::live::{spawn_live_feed, StartState};
use crate::plugins::PostContext;
use crate::postprocess::spawn_post_processors;
use crate::relate::{deleted_source, spawn_relate_workers, with_data, RelateQueue};
use crate::server::{run_server, InstanceRequest, InstanceStatus};
use crate::stats::IndexStats;

/// What readers put on the source channel.
#[derive(Debug)]
pub enum SourceMessage {
    /// An event that passed the filter chain.
    Event(ChangeEvent),
    /// An event rejected by the filter chain; it only moves the checkpoint.
    Filtered(ChangeEvent),
    /// Every direct read namespace has been scanned.
    DirectReadsDone,
}

impl SourceMessage {
    /// Screen a reader's event through the filter chain. `None` when the
    /// chain itself failed; the failure has been reported.
    pub async fn screen(ctx: &Arc<SyncContext>, event: ChangeEvent) -> Option<Self> {
        let namespace = event.namespace.clone();
        match ctx.screen(event).await {
            Ok(Screened::Accepted(event)) => Some(SourceMessage::Event(event)),
            Ok(Screened::Rejected(event, filter)) => {
                debug!(namespace = %event.namespace, filter = %filter, "event filtered");
                Some(SourceMessage::Filtered(event))
            }
            Err(e) => {
                ctx.reporter.report(SyncError::transform(&namespace, e));
                None
            }
        }
    }
}

/// The four backends the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub source: Arc<dyn SourceStore>,
    pub log: Arc<dyn ReplicationLog>,
    pub state: Arc<dyn StateStore>,
    pub index: Arc<dyn IndexBackend>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Drained and checkpointed; errors may still have been reported.
    Stopped,
    /// A fail-fast error stopped the run.
    Aborted,
}

pub struct Engine {
    ctx: Arc<SyncContext>,
    stores: Stores,
    stats: Arc<IndexStats>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(ctx: Arc<SyncContext>, stores: Stores) -> Self {
        Self {
            ctx,
            stores,
            stats: Arc::new(IndexStats::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel to request a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<IndexStats> {
        self.stats.clone()
    }

    pub async fn run(self) -> Result<Outcome> {
        let ctx = self.ctx.clone();
        let config = &ctx.config;
        let stores = self.stores.clone();

        // ── consumers, last stage first ──
        let indexer = Indexer::start(
            ctx.clone(),
            stores.index.clone(),
            stores.state.clone(),
            self.stats.clone(),
        )
        .await?;

        let post = spawn_post_processors(
            ctx.clone(),
            PostContext {
                index: stores.index.clone(),
                source: stores.source.clone(),
            },
        );
        let (post_tx, post_workers) = match post {
            Some((tx, handles)) => (Some(tx), handles),
            None => (None, Vec::new()),
        };

        let (files_tx, downloaders) = if config.index_files {
            let (tx, handles) = spawn_downloaders(ctx.clone(), stores.source.clone(), indexer.handle());
            (Some(tx), handles)
        } else {
            (None, Vec::new())
        };

        let sink = EventSink::new(ctx.clone(), indexer.handle(), files_tx, post_tx);

        let (relate, relate_workers) = if ctx.relations.is_empty() {
            (None, Vec::new())
        } else {
            let (queue, handles) =
                spawn_relate_workers(ctx.clone(), stores.source.clone(), sink.clone());
            (Some(queue), handles)
        };

        let mut coordinator = Coordinator::new(config, stores.state.clone(), ctx.reporter.clone());
        coordinator.start().await;

        // ── producers ──
        let (source_tx, source_rx) = mpsc::channel(config.channel_size);
        let readers_cancel = CancellationToken::new();
        let mut readers = Vec::new();
        if !config.disable_change_events {
            let start = StartState::load(config, stores.state.as_ref(), stores.log.as_ref()).await?;
            readers.push(spawn_live_feed(
                ctx.clone(),
                stores.log.clone(),
                start,
                source_tx.clone(),
                readers_cancel.clone(),
            ));
        }
        if config.has_direct_reads() {
            readers.push(
                DirectReader::new(
                    ctx.clone(),
                    stores.source.clone(),
                    stores.state.clone(),
                    source_tx.clone(),
                    readers_cancel.clone(),
                )
                .spawn(),
            );
        }
        drop(source_tx);

        // ── http ──
        let (instance_tx, instance_rx) = mpsc::channel::<InstanceRequest>(8);
        let http_cancel = CancellationToken::new();
        let http = if config.enable_http_server {
            let stats = config.stats.then(|| self.stats.clone());
            let addr = config.http_server_addr.clone();
            let cancel = http_cancel.clone();
            let reporter = ctx.reporter.clone();
            let tx = instance_tx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = run_server(&addr, stats, tx, cancel).await {
                    reporter.report(SyncError::Config(format!("{:#}", e)));
                }
            }))
        } else {
            None
        };

        let mut event_loop = EventLoop {
            ctx: ctx.clone(),
            stores: stores.clone(),
            indexer: indexer.handle(),
            sink,
            relate,
            stats: self.stats.clone(),
            coordinator: &mut coordinator,
        };
        let aborted = event_loop
            .run(source_rx, instance_rx, self.shutdown.clone())
            .await;
        drop(event_loop);
        drop(instance_tx);

        readers_cancel.cancel();
        if aborted {
            warn!("stopping without draining after a fail-fast error");
            coordinator.release().await;
            http_cancel.cancel();
            return Ok(Outcome::Aborted);
        }

        info!("shutting down");
        let grace = Duration::from_secs(config.graceful_shutdown_timeout.max(1));
        let drain = async {
            join_all(readers).await;
            join_all(relate_workers).await;
            join_all(downloaders).await;
            join_all(post_workers).await;
            indexer.shutdown().await;
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(timeout_secs = grace.as_secs(), "graceful shutdown timed out, in-flight work lost");
            coordinator.release().await;
            http_cancel.cancel();
            return Ok(Outcome::Stopped);
        }

        if let Err(e) = coordinator.save().await {
            ctx.reporter.report(SyncError::coordinator(e));
        }
        coordinator.release().await;
        http_cancel.cancel();
        if let Some(http) = http {
            let _ = http.await;
        }
        if config.stats {
            self.stats.log();
        }
        info!("shutdown complete");
        Ok(Outcome::Stopped)
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

fn ticker(secs: u64) -> Interval {
    let mut t = interval(Duration::from_secs(secs.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

struct EventLoop<'a> {
    ctx: Arc<SyncContext>,
    stores: Stores,
    indexer: IndexerHandle,
    sink: EventSink,
    relate: Option<RelateQueue>,
    stats: Arc<IndexStats>,
    coordinator: &'a mut Coordinator,
}

impl EventLoop<'_> {
    /// Runs until shutdown is requested, the sources are exhausted after
    /// `exit-after-direct-reads`, or a fail-fast error. Returns `true` for
    /// the last.
    async fn run(
        &mut self,
        mut source: mpsc::Receiver<SourceMessage>,
        mut instance: mpsc::Receiver<InstanceRequest>,
        shutdown: CancellationToken,
    ) -> bool {
        let ctx = self.ctx.clone();
        let config = &ctx.config;
        let fatal = ctx.reporter.fatal();
        let clustered = self.coordinator.cluster().is_some();
        let mut heartbeat = ticker(config.heartbeat_interval);
        let mut checkpoint = ticker(config.checkpoint_interval);
        let mut stats = ticker(config.stats_duration);
        let mut source_open = true;

        loop {
            let enabled = self.coordinator.is_enabled();
            tokio::select! {
                biased;
                _ = fatal.cancelled() => return true,
                _ = shutdown.cancelled() => return false,
                _ = heartbeat.tick(), if clustered => self.heartbeat().await,
                _ = checkpoint.tick() => self.checkpoint().await,
                _ = stats.tick(), if config.stats => self.stats.log(),
                Some(reply) = instance.recv() => {
                    let _ = reply.send(self.instance_status());
                }
                msg = source.recv(), if enabled && source_open => match msg {
                    Some(SourceMessage::Event(event)) => {
                        self.coordinator.record(&event);
                        self.route(event).await;
                    }
                    Some(SourceMessage::Filtered(event)) => self.coordinator.record(&event),
                    Some(SourceMessage::DirectReadsDone) => {
                        if self.direct_reads_done().await {
                            return false;
                        }
                    }
                    None => {
                        debug!("all readers finished");
                        source_open = false;
                    }
                },
            }
        }
    }

    async fn heartbeat(&mut self) {
        match self.coordinator.heartbeat().await {
            Some(ProcessState::Pausing) => {
                self.indexer.flush().await;
                if let Err(e) = self.coordinator.save().await {
                    self.ctx.reporter.report(SyncError::coordinator(e));
                }
                self.coordinator.paused();
                info!("work paused");
            }
            Some(ProcessState::Enabled) => info!("work resumed"),
            _ => {}
        }
    }

    /// Persist the position, but only if new events were applied.
    async fn checkpoint(&mut self) {
        if !self.coordinator.has_pending() {
            return;
        }
        if !self.ctx.config.resume_write_unsafe {
            self.indexer.flush().await;
        }
        if let Err(e) = self.coordinator.save().await {
            self.ctx.reporter.report(SyncError::coordinator(e));
        }
    }

    /// Returns whether the loop should stop.
    async fn direct_reads_done(&mut self) -> bool {
        let config = &self.ctx.config;
        info!("direct reads done");
        if config.resume {
            match self.stores.log.latest_timestamp().await {
                Ok(Some(ts)) => {
                    self.indexer.flush().await;
                    if let Err(e) = self.coordinator.save_timestamp(ts).await {
                        self.ctx.reporter.report(SyncError::coordinator(e));
                    }
                }
                Ok(None) => {}
                Err(e) => self.ctx.reporter.report(SyncError::source(e)),
            }
        }
        config.exit_after_direct_reads
    }

    fn instance_status(&self) -> InstanceStatus {
        let holder = self.coordinator.holder();
        let last_ts = self.coordinator.last_timestamp();
        InstanceStatus {
            enabled: self.coordinator.is_enabled(),
            state: self.coordinator.status(),
            pid: holder.pid,
            hostname: holder.host.clone(),
            instance_id: holder.instance_id.clone(),
            resume_name: self.coordinator.resume_name().to_string(),
            cluster_name: self.coordinator.cluster().map(String::from),
            last_ts,
            last_ts_formatted: (!last_ts.is_zero()).then(|| last_ts.datetime().to_rfc3339()),
        }
    }

    async fn route(&self, event: ChangeEvent) {
        self.sink.post(&event).await;

        if event.is_drop() {
            if let Err(e) = self.indexer.drop_namespace(&event).await {
                self.ctx.reporter.report(SyncError::index(e));
            }
        } else if event.is_delete() {
            self.route_delete(event).await;
        } else {
            self.route_data(event).await;
        }
    }

    async fn route_delete(&self, event: ChangeEvent) {
        if let Some(queue) = self.relating(&event) {
            if let Some(data) = deleted_source(&self.ctx, self.stores.index.as_ref(), &event).await
            {
                if !queue.offer(with_data(&event, data)) {
                    self.stats.record_relate_skip();
                }
            }
        }
        self.sink.index(event).await;
    }

    async fn route_data(&self, event: ChangeEvent) {
        if let Some(queue) = self.relating(&event) {
            if event.document.is_some() {
                if !queue.offer(event.detached()) {
                    self.stats.record_relate_skip();
                }
                if !self.ctx.relations.keeps_source(&event.namespace) {
                    return;
                }
            }
        }
        self.sink.index(event).await;
    }

    /// Relations expand live-feed events only.
    fn relating(&self, event: &ChangeEvent) -> Option<&RelateQueue> {
        self.relate
            .as_ref()
            .filter(|_| event.is_live() && self.ctx.relations.has_relations(&event.namespace))
    }
}

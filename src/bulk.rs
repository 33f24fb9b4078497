//! Bulk request batching.
//!
//! A single [`BulkProcessor`] task owns the pending buffer and is the only
//! caller of [`IndexBackend::bulk`]. Index workers hand it finished actions;
//! it flushes when any threshold is reached:
//!
//! | Threshold | Config |
//! |-----------|--------|
//! | buffered actions | `elasticsearch-max-docs` (-1 = none) |
//! | estimated request bytes | `elasticsearch-max-bytes` |
//! | time since last flush | `elasticsearch-max-seconds` |
//!
//! Item failures are reported one by one and never fail the rest of the
//! batch. Version conflicts and deletes of missing documents are expected
//! outcomes of replay and are not failures.

use std::sync::Arc;
use std::time::Duration;

use docsync_core::store::{BulkAction, IndexBackend};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ErrorReporter, SyncError};
use crate::stats::IndexStats;

pub enum BulkCommand {
    Add(BulkAction),
    /// Flush everything buffered, then acknowledge.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct BulkSettings {
    pub max_docs: Option<usize>,
    pub max_bytes: usize,
    pub max_seconds: u64,
}

impl BulkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_docs: config.max_docs(),
            max_bytes: config.elasticsearch_max_bytes,
            max_seconds: config.max_seconds().max(1),
        }
    }
}

pub struct BulkProcessor {
    backend: Arc<dyn IndexBackend>,
    settings: BulkSettings,
    stats: Arc<IndexStats>,
    reporter: ErrorReporter,
    buffer: Vec<BulkAction>,
    bytes: usize,
}

impl BulkProcessor {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        settings: BulkSettings,
        stats: Arc<IndexStats>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            backend,
            settings,
            stats,
            reporter,
            buffer: Vec::new(),
            bytes: 0,
        }
    }

    /// Run until every sender is dropped, then flush what is left.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<BulkCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<BulkCommand>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.max_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(BulkCommand::Add(action)) => {
                        self.add(action);
                        if self.is_full() {
                            self.flush().await;
                            ticker.reset();
                        }
                    }
                    Some(BulkCommand::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }
        self.flush().await;
        debug!("bulk processor stopped");
    }

    fn add(&mut self, action: BulkAction) {
        self.bytes += action.estimated_size();
        self.buffer.push(action);
    }

    fn is_full(&self) -> bool {
        self.settings
            .max_docs
            .is_some_and(|max| self.buffer.len() >= max)
            || self.bytes >= self.settings.max_bytes
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let actions = std::mem::take(&mut self.buffer);
        self.bytes = 0;
        debug!(actions = actions.len(), "flushing bulk request");

        match self.backend.bulk(&actions).await {
            Ok(response) => {
                self.stats.record(&response);
                for item in response.failures() {
                    self.reporter.report(SyncError::BatchWrite(format!(
                        "{} {}/{} failed with status {}: {}",
                        item.action,
                        item.index,
                        item.id,
                        item.status,
                        item.error.as_deref().unwrap_or("unknown error")
                    )));
                }
                let conflicts = response
                    .items
                    .iter()
                    .filter(|i| i.is_version_conflict())
                    .count();
                if conflicts > 0 {
                    debug!(conflicts, "stale versions rejected by the index");
                }
            }
            Err(e) => {
                warn!(actions = actions.len(), "bulk request failed");
                self.stats.record_request_failure(actions.len());
                self.reporter
                    .report(SyncError::BatchWrite(format!("{:#}", e)));
            }
        }
    }
}

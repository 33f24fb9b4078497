//! Live feed reader.
//!
//! One reader task per replication stream (shard). A supervisor polls
//! [`ReplicationLog::streams`] every `shard-discovery-interval` seconds and
//! starts a reader for each stream it has not seen yet.
//!
//! Where a stream starts:
//!
//! | Condition | Position |
//! |-----------|----------|
//! | `resume-from-timestamp` set | that timestamp, inclusive |
//! | `resume` with a saved token (token strategy) | after the token |
//! | `resume` with a saved checkpoint | after the checkpoint |
//! | `replay` | the beginning of the log |
//! | otherwise | after the newest entry at startup |
//!
//! Streams discovered after startup read from their saved token or from the
//! beginning. Read errors are reported and retried with backoff from the
//! last position handed downstream, so a reconnect loses nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docsync_core::models::{ChangeEvent, Document, OpTimestamp};
use docsync_core::relation::matches_selector;
use docsync_core::store::{FeedPosition, ReplicationLog, StateStore};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ResumeStrategy};
use crate::context::SyncContext;
use crate::engine::SourceMessage;
use crate::error::SyncError;
use crate::transform::load_selector;

const READ_BATCH: usize = 500;
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Saved positions read once at startup.
#[derive(Debug, Default)]
pub struct StartState {
    pub tokens: HashMap<String, Value>,
    pub checkpoint: Option<OpTimestamp>,
    pub latest: Option<OpTimestamp>,
}

impl StartState {
    pub async fn load(
        config: &Config,
        state: &dyn StateStore,
        log: &dyn ReplicationLog,
    ) -> anyhow::Result<Self> {
        let mut start = StartState::default();
        if config.resume {
            if config.resume_strategy() == ResumeStrategy::Token {
                start.tokens = state
                    .load_tokens(&config.resume_name)
                    .await
                    .context("Failed to load stream tokens")?;
            }
            start.checkpoint = state
                .load_checkpoint(&config.resume_name)
                .await
                .context("Failed to load checkpoint")?;
        }
        start.latest = log
            .latest_timestamp()
            .await
            .context("Failed to read the replication log head")?;
        Ok(start)
    }

    /// Position for a stream present at startup.
    pub fn position(&self, config: &Config, stream: &str) -> FeedPosition {
        if let Some(ts) = config.resume_from() {
            return FeedPosition::After(OpTimestamp::from_version(ts.version().saturating_sub(1)));
        }
        if config.resume {
            if let Some(token) = self.tokens.get(stream) {
                return FeedPosition::Token(token.clone());
            }
            if let Some(ts) = self.checkpoint {
                return FeedPosition::After(ts);
            }
        }
        if config.replay {
            return FeedPosition::Beginning;
        }
        match self.latest {
            Some(ts) => FeedPosition::After(ts),
            None => FeedPosition::Beginning,
        }
    }

    /// Position for a stream that appeared while running.
    pub fn discovered_position(&self, stream: &str) -> FeedPosition {
        match self.tokens.get(stream) {
            Some(token) => FeedPosition::Token(token.clone()),
            None => FeedPosition::Beginning,
        }
    }
}

/// Start the supervisor. It stops, along with every stream reader, when
/// `cancel` fires or the downstream channel closes.
pub fn spawn_live_feed(
    ctx: Arc<SyncContext>,
    log: Arc<dyn ReplicationLog>,
    start: StartState,
    tx: mpsc::Sender<SourceMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let discover = ctx.config.shard_discovery_interval > 0;
        let interval = Duration::from_secs(ctx.config.shard_discovery_interval.max(1));
        let mut known: HashSet<String> = HashSet::new();
        let mut readers = Vec::new();
        let mut first = true;

        loop {
            match log.streams().await {
                Ok(streams) => {
                    for stream in streams {
                        if !known.insert(stream.clone()) {
                            continue;
                        }
                        let position = if first {
                            start.position(&ctx.config, &stream)
                        } else {
                            info!(stream = %stream, "new stream discovered");
                            start.discovered_position(&stream)
                        };
                        debug!(stream = %stream, position = ?position, "starting stream reader");
                        let reader = StreamReader {
                            ctx: ctx.clone(),
                            log: log.clone(),
                            stream,
                            position,
                            tx: tx.clone(),
                            cancel: cancel.clone(),
                            selectors: HashMap::new(),
                        };
                        readers.push(tokio::spawn(reader.run()));
                    }
                    first = false;
                }
                Err(e) => ctx
                    .reporter
                    .report(SyncError::source(e.context("stream discovery failed"))),
            }

            if !discover && !first {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tx.closed() => {}
                }
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        for reader in readers {
            let _ = reader.await;
        }
        debug!("live feed stopped");
    })
}

struct StreamReader {
    ctx: Arc<SyncContext>,
    log: Arc<dyn ReplicationLog>,
    stream: String,
    position: FeedPosition,
    tx: mpsc::Sender<SourceMessage>,
    cancel: CancellationToken,
    selectors: HashMap<String, Option<Document>>,
}

impl StreamReader {
    async fn run(mut self) {
        let mut backoff = POLL_INTERVAL;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let batch = match self.log.read(&self.stream, &self.position, READ_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.ctx.reporter.report(SyncError::source(
                        e.context(format!("reading stream {} failed", self.stream)),
                    ));
                    warn!(stream = %self.stream, retry_in = ?backoff, "reconnecting live feed");
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            backoff = POLL_INTERVAL;

            if batch.is_empty() {
                if !self.pause(POLL_INTERVAL).await {
                    break;
                }
                continue;
            }

            for event in batch {
                self.position = match &event.resume_token {
                    Some(token) => FeedPosition::Token(token.token.clone()),
                    None => FeedPosition::After(event.timestamp),
                };
                if !self.in_scope(&event).await {
                    continue;
                }
                let Some(message) = SourceMessage::screen(&self.ctx, event).await else {
                    continue;
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    sent = self.tx.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!(stream = %self.stream, "stream reader stopped");
    }

    /// Sleep unless cancelled first. Returns `false` when cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn in_scope(&mut self, event: &ChangeEvent) -> bool {
        if !watches(&self.ctx, event) {
            return false;
        }
        let Some(doc) = &event.document else {
            return true;
        };
        if !self.ctx.plugins.has_pipelines() {
            return true;
        }
        let selector = self.selector(&event.namespace).await;
        selector.map_or(true, |s| matches_selector(doc, s))
    }

    async fn selector(&mut self, namespace: &str) -> Option<&Document> {
        if !self.selectors.contains_key(namespace) {
            let selector = match load_selector(&self.ctx.plugins, namespace, true).await {
                Ok(s) => s,
                Err(e) => {
                    self.ctx.reporter.report(SyncError::transform(namespace, e));
                    None
                }
            };
            self.selectors.insert(namespace.to_string(), selector);
        }
        self.selectors.get(namespace).and_then(|s| s.as_ref())
    }
}

/// `change-stream-namespaces` scoping. A bare database name covers every
/// collection in it.
pub fn watches(ctx: &SyncContext, event: &ChangeEvent) -> bool {
    let set = &ctx.change_namespaces;
    set.is_empty() || set.contains(&event.namespace) || set.contains(event.database())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorReporter;
    use crate::plugins::PluginRegistry;
    use docsync_core::models::DocId;

    fn ctx(config: Config) -> Arc<SyncContext> {
        SyncContext::new(config, PluginRegistry::new(), ErrorReporter::new(false)).unwrap()
    }

    #[test]
    fn test_start_positions() {
        let start = StartState {
            tokens: HashMap::from([("rs0".to_string(), Value::from(7))]),
            checkpoint: Some(OpTimestamp::new(50, 1)),
            latest: Some(OpTimestamp::new(90, 0)),
        };

        let mut config = Config::default();
        assert_eq!(
            start.position(&config, "rs0"),
            FeedPosition::After(OpTimestamp::new(90, 0))
        );

        config.replay = true;
        assert_eq!(start.position(&config, "rs0"), FeedPosition::Beginning);

        config.resume = true;
        assert_eq!(
            start.position(&config, "rs0"),
            FeedPosition::Token(Value::from(7))
        );
        assert_eq!(
            start.position(&config, "rs1"),
            FeedPosition::After(OpTimestamp::new(50, 1))
        );

        config.resume_from_timestamp = 60;
        assert_eq!(
            start.position(&config, "rs0"),
            FeedPosition::After(OpTimestamp::new(59, u32::MAX))
        );
    }

    #[test]
    fn test_bare_database_watches_all_collections() {
        let config = Config {
            change_stream_namespaces: vec!["shop".into(), "crm.users".into()],
            ..Config::default()
        };
        let ctx = ctx(config);
        assert!(watches(&ctx, &ChangeEvent::delete("shop.orders", DocId::Int(1))));
        assert!(watches(&ctx, &ChangeEvent::delete("crm.users", DocId::Int(1))));
        assert!(!watches(&ctx, &ChangeEvent::delete("crm.leads", DocId::Int(1))));
        assert!(watches(&ctx, &ChangeEvent::drop_database("shop")));
    }

    #[test]
    fn test_default_watches_everything() {
        let ctx = ctx(Config::default());
        assert!(watches(&ctx, &ChangeEvent::delete("any.thing", DocId::Int(1))));
    }
}

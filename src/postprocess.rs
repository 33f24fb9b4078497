//! Post-processor pool.
//!
//! Routed events are copied onto a queue consumed by `post-processors`
//! workers. Each worker runs every registered [`PostProcessor`] in
//! registration order. Failures are reported and never reach indexing.

use std::sync::Arc;

use docsync_core::models::ChangeEvent;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::plugins::PostContext;

/// Spawn the workers. Returns `None` when no post-processor is registered.
pub fn spawn_post_processors(
    ctx: Arc<SyncContext>,
    post_ctx: PostContext,
) -> Option<(mpsc::Sender<ChangeEvent>, Vec<JoinHandle<()>>)> {
    if ctx.plugins.post_processors().is_empty() {
        return None;
    }
    let (tx, rx) = mpsc::channel(ctx.config.channel_size);
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..ctx.config.post_processors.max(1))
        .map(|_| {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let post_ctx = post_ctx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(event) = next else { break };
                    run_all(&ctx, &post_ctx, &event).await;
                }
                debug!("post-processor worker stopped");
            })
        })
        .collect();
    Some((tx, handles))
}

async fn run_all(ctx: &SyncContext, post_ctx: &PostContext, event: &ChangeEvent) {
    for processor in ctx.plugins.post_processors() {
        if let Err(e) = processor.process(event, post_ctx).await {
            ctx.reporter.report(SyncError::transform(
                &event.namespace,
                e.context(format!("post-processor {} failed", processor.name())),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorReporter;
    use crate::plugins::{PluginRegistry, PostProcessor};
    use anyhow::Result;
    use async_trait::async_trait;
    use docsync_core::models::DocId;
    use docsync_core::store::memory::{InMemoryIndex, InMemorySource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl PostProcessor for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        async fn process(&self, event: &ChangeEvent, _ctx: &PostContext) -> Result<()> {
            if event.namespace == "db.bad" {
                anyhow::bail!("rejected");
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_every_event_is_processed() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut plugins = PluginRegistry::new();
        plugins.register_post_processor(counter.clone());
        let reporter = ErrorReporter::new(false);
        let ctx = SyncContext::new(Config::default(), plugins, reporter.clone()).unwrap();
        let post_ctx = PostContext {
            index: Arc::new(InMemoryIndex::new()),
            source: Arc::new(InMemorySource::new()),
        };

        let (tx, handles) = spawn_post_processors(ctx, post_ctx).unwrap();
        for i in 0..5 {
            tx.send(ChangeEvent::delete("db.col", DocId::Int(i)))
                .await
                .unwrap();
        }
        tx.send(ChangeEvent::delete("db.bad", DocId::Int(0)))
            .await
            .unwrap();
        drop(tx);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(counter.0.load(Ordering::SeqCst), 5);
        assert_eq!(reporter.error_count(), 1);
    }

    #[test]
    fn test_no_processors_no_pool() {
        let ctx = SyncContext::new(
            Config::default(),
            PluginRegistry::new(),
            ErrorReporter::new(false),
        )
        .unwrap();
        let post_ctx = PostContext {
            index: Arc::new(InMemoryIndex::new()),
            source: Arc::new(InMemorySource::new()),
        };
        assert!(spawn_post_processors(ctx, post_ctx).is_none());
    }
}

//! Direct reader: a one-time scan of whole namespaces.
//!
//! Every document becomes an insert tagged `DirectRead`. Large namespaces
//! are split into key-range segments scanned concurrently; at most
//! `direct-read-concur` segments run at once across all namespaces.
//!
//! ```text
//! count / (split-max + 1) < 5000  ──▶  one segment
//! otherwise                       ──▶  split-max + 1 key ranges
//! ```
//!
//! In bounded mode every segment stops at the largest key present when the
//! scan started. With `direct-read-stateful`, finished namespaces are
//! recorded and skipped on the next start. Once every namespace is done a
//! [`SourceMessage::DirectReadsDone`] is sent.

use std::sync::Arc;

use anyhow::{Context, Result};
use docsync_core::models::{split_namespace, ChangeEvent, DocId, Document, EventSource, OpTimestamp};
use docsync_core::store::{ScanRange, SourceStore, StateStore};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::compile_regex;
use crate::context::SyncContext;
use crate::engine::SourceMessage;
use crate::error::SyncError;
use crate::transform::load_selector;

const PAGE_SIZE: usize = 500;
const MIN_SEGMENT_SIZE: u64 = 5000;

/// Keys in `(after, through]`; `None` leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub after: Option<i64>,
    pub through: Option<i64>,
}

/// Split `[min, max]` into scan segments.
pub fn plan_segments(count: u64, min: i64, max: i64, split_max: i32, bounded: bool) -> Vec<Segment> {
    let last = bounded.then_some(max);
    if split_max <= 0 || count / (split_max as u64 + 1) < MIN_SEGMENT_SIZE {
        return vec![Segment {
            after: None,
            through: last,
        }];
    }
    // keys may span the whole i64 range
    let parts = split_max as i128 + 1;
    let span = max as i128 - min as i128 + 1;
    let width = (span + parts - 1) / parts;
    let base = min as i128 - 1;
    let bound = |k: i128| i64::try_from(base + k * width).ok();
    let mut segments = Vec::with_capacity(parts as usize);
    for k in 0..parts {
        let after = if k > 0 { bound(k) } else { None };
        let through = if k == parts - 1 { last } else { bound(k + 1) };
        if (k > 0 && after.is_none()) || (k < parts - 1 && through.is_none()) {
            return vec![Segment {
                after: None,
                through: last,
            }];
        }
        segments.push(Segment { after, through });
    }
    segments
}

pub struct DirectReader {
    ctx: Arc<SyncContext>,
    source: Arc<dyn SourceStore>,
    state: Arc<dyn StateStore>,
    tx: mpsc::Sender<SourceMessage>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

impl DirectReader {
    pub fn new(
        ctx: Arc<SyncContext>,
        source: Arc<dyn SourceStore>,
        state: Arc<dyn StateStore>,
        tx: mpsc::Sender<SourceMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.direct_read_concur.max(1)));
        Self {
            ctx,
            source,
            state,
            tx,
            cancel,
            permits,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let reader = Arc::new(self);
            if let Err(e) = reader.clone().run().await {
                reader.ctx.reporter.report(SyncError::source(e));
            }
            if !reader.cancel.is_cancelled() {
                let _ = reader.tx.send(SourceMessage::DirectReadsDone).await;
            }
        })
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut namespaces = self.namespaces().await?;
        let config = &self.ctx.config;
        if config.direct_read_stateful {
            let done = self
                .state
                .completed_direct_reads(&config.resume_name)
                .await
                .context("Failed to load completed direct reads")?;
            namespaces.retain(|ns| {
                let skip = done.contains(ns);
                if skip {
                    info!(namespace = %ns, "direct read already completed, skipping");
                }
                !skip
            });
        }
        info!(namespaces = namespaces.len(), "starting direct reads");

        let tasks: Vec<_> = namespaces
            .into_iter()
            .map(|ns| {
                let reader = self.clone();
                tokio::spawn(async move {
                    match reader.clone().read_namespace(&ns).await {
                        Ok(true) => reader.mark_complete(&ns).await,
                        Ok(false) => {}
                        Err(e) => reader
                            .ctx
                            .reporter
                            .report(SyncError::source(e.context(format!("direct read of {} failed", ns)))),
                    }
                })
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("direct reads completed");
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let config = &self.ctx.config;
        if !config.direct_reads_dynamic() {
            return Ok(config
                .direct_read_namespaces
                .iter()
                .filter(|ns| !ns.is_empty())
                .cloned()
                .collect());
        }
        let include = compile_regex(
            "direct-read-dynamic-include-regex",
            &config.direct_read_dynamic_include_regex,
        )?;
        let exclude = compile_regex(
            "direct-read-dynamic-exclude-regex",
            &config.direct_read_dynamic_exclude_regex,
        )?;
        let all = self
            .source
            .namespaces()
            .await
            .context("Failed to list namespaces")?;
        Ok(all
            .into_iter()
            .filter(|ns| {
                let (db, col) = split_namespace(ns);
                db != config.admin_namespace && !col.starts_with("system.")
            })
            .filter(|ns| include.as_ref().map_or(true, |re| re.is_match(ns)))
            .filter(|ns| !exclude.as_ref().is_some_and(|re| re.is_match(ns)))
            .collect())
    }

    /// Scan one namespace. Returns `false` if it was cut short.
    async fn read_namespace(self: Arc<Self>, ns: &str) -> Result<bool> {
        let selector = load_selector(&self.ctx.plugins, ns, false).await?;
        let Some((min, max)) = self.source.key_bounds(ns).await? else {
            debug!(namespace = %ns, "namespace is empty");
            return Ok(true);
        };
        let count = self.source.count(ns).await?;
        let config = &self.ctx.config;
        let segments = plan_segments(
            count,
            min,
            max,
            config.direct_read_split_max,
            config.direct_read_bounded,
        );
        debug!(namespace = %ns, count, segments = segments.len(), "direct read planned");

        let tasks: Vec<_> = segments
            .into_iter()
            .map(|segment| {
                let reader = self.clone();
                let ns = ns.to_string();
                let selector = selector.clone();
                tokio::spawn(async move { reader.read_segment(&ns, segment, selector).await })
            })
            .collect();

        let mut complete = true;
        for task in tasks {
            match task.await {
                Ok(Ok(finished)) => complete &= finished,
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(anyhow::anyhow!("segment task failed: {}", e)),
            }
        }
        Ok(complete)
    }

    async fn read_segment(
        &self,
        ns: &str,
        segment: Segment,
        selector: Option<Document>,
    ) -> Result<bool> {
        let _permit = self.permits.acquire().await?;
        let mut range = ScanRange {
            after: segment.after,
            through: segment.through,
            limit: PAGE_SIZE,
            selector,
        };
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let page = self.source.scan(ns, &range).await?;
            let Some(last) = page.last().map(|d| d.key) else {
                return Ok(true);
            };
            let full = page.len() == range.limit;
            for scanned in page {
                let Some(id) = DocId::from_document(&scanned.document) else {
                    warn!(namespace = %ns, key = scanned.key, "document without _id skipped");
                    continue;
                };
                let event = ChangeEvent::insert(ns, id, scanned.document)
                    .with_source(EventSource::DirectRead)
                    .with_timestamp(OpTimestamp::now_seconds());
                let Some(message) = SourceMessage::screen(&self.ctx, event).await else {
                    continue;
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(false),
                    sent = self.tx.send(message) => {
                        if sent.is_err() {
                            return Ok(false);
                        }
                    }
                }
            }
            if !full {
                return Ok(true);
            }
            range.after = Some(last);
        }
    }

    async fn mark_complete(&self, ns: &str) {
        if !self.ctx.config.direct_read_stateful {
            return;
        }
        if let Err(e) = self
            .state
            .mark_direct_read_complete(&self.ctx.config.resume_name, ns)
            .await
        {
            warn!(namespace = %ns, error = %e, "unable to record completed direct read");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_namespace_is_one_segment() {
        let segments = plan_segments(9000, 1, 9000, 9, false);
        assert_eq!(
            segments,
            vec![Segment {
                after: None,
                through: None
            }]
        );
        let bounded = plan_segments(9000, 1, 9000, 0, true);
        assert_eq!(bounded[0].through, Some(9000));
    }

    #[test]
    fn test_large_namespace_splits_cover_range() {
        let segments = plan_segments(100_000, 1, 100_000, 3, true);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].after, None);
        assert_eq!(segments[3].through, Some(100_000));
        for pair in segments.windows(2) {
            assert_eq!(pair[0].through, pair[1].after);
        }
    }

    #[test]
    fn test_unbounded_last_segment_is_open() {
        let segments = plan_segments(100_000, 1, 100_000, 1, false);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].through, None);
    }

    #[test]
    fn test_full_key_range_splits_without_overflow() {
        let segments = plan_segments(1_000_000, i64::MIN, i64::MAX, 3, true);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].after, None);
        assert_eq!(segments[3].through, Some(i64::MAX));
        for pair in segments.windows(2) {
            assert_eq!(pair[0].through, pair[1].after);
            assert!(pair[0].through.unwrap() < pair[1].through.unwrap_or(i64::MAX));
        }

        let negative = plan_segments(1_000_000, -5_000_000_000, 4_000_000_000_000_000_000, 9, false);
        assert_eq!(negative.len(), 10);
        assert_eq!(negative[9].through, None);
    }
}

//! Bulk indexing statistics.
//!
//! Counters are updated by the bulk processor after every flush and read by
//! the `/stats` endpoint and the periodic `stats` log line.

use std::sync::atomic::{AtomicU64, Ordering};

use docsync_core::store::BulkResponse;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Default)]
pub struct IndexStats {
    flushed: AtomicU64,
    committed: AtomicU64,
    indexed: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    skipped: AtomicU64,
    relate_skipped: AtomicU64,
    delete_missed: AtomicU64,
}

/// Point-in-time copy of [`IndexStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub flushed: u64,
    pub committed: u64,
    pub indexed: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub skipped: u64,
    pub relate_skipped: u64,
    pub delete_missed: u64,
}

impl IndexStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one bulk request and the outcome of each of its items.
    pub fn record(&self, response: &BulkResponse) {
        self.flushed.fetch_add(1, Ordering::Relaxed);
        self.committed
            .fetch_add(response.items.len() as u64, Ordering::Relaxed);
        for item in &response.items {
            let counter = match (item.action.as_str(), item.status) {
                ("index", 201) | ("update", 201) => &self.created,
                ("index", _) => &self.indexed,
                ("update", _) => &self.updated,
                _ => &self.deleted,
            };
            if item.is_version_conflict() {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
            } else if item.is_failure() {
                self.failed.fetch_add(1, Ordering::Relaxed);
            } else {
                counter.fetch_add(1, Ordering::Relaxed);
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// A whole request failed before any item result was returned.
    pub fn record_request_failure(&self, actions: usize) {
        self.flushed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(actions as u64, Ordering::Relaxed);
    }

    /// An event the mapper chose not to write.
    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A relation expansion dropped because the relate queue was full.
    pub fn record_relate_skip(&self) {
        self.relate_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A stateless delete that found no document to remove.
    pub fn record_delete_miss(&self) {
        self.delete_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flushed: self.flushed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            relate_skipped: self.relate_skipped.load(Ordering::Relaxed),
            delete_missed: self.delete_missed.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            target: "stats",
            flushed = s.flushed,
            committed = s.committed,
            indexed = s.indexed,
            created = s.created,
            updated = s.updated,
            deleted = s.deleted,
            succeeded = s.succeeded,
            failed = s.failed,
            conflicts = s.conflicts,
            skipped = s.skipped,
            relate_skipped = s.relate_skipped,
            delete_missed = s.delete_missed,
            "indexing stats"
        );
    }
}

//! Storage abstractions for docsync.
//!
//! The engine talks to four pluggable backends:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`SourceStore`] | documents of the primary store: scans, queries, attachments |
//! | [`ReplicationLog`] | ordered change feed, one stream per shard |
//! | [`StateStore`] | checkpoints, tokens, the cluster lease, delete metadata |
//! | [`IndexBackend`] | the search index receiving bulk writes |
//!
//! Implementations must be `Send + Sync`; they are shared behind `Arc`
//! across worker pools. [`memory`] provides in-memory versions of all four.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ChangeEvent, DocId, Document, OpTimestamp};

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

/// A page request over one namespace, in scan-key order.
#[derive(Debug, Clone, Default)]
pub struct ScanRange {
    /// Exclusive lower bound on the scan key.
    pub after: Option<i64>,
    /// Inclusive upper bound on the scan key (bounded snapshots, splits).
    pub through: Option<i64>,
    pub limit: usize,
    /// Equality selector from `$match` pipeline stages.
    pub selector: Option<Document>,
}

/// A document returned from a scan, with its position.
#[derive(Debug, Clone)]
pub struct ScannedDoc {
    pub key: i64,
    pub document: Document,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All namespaces currently holding documents.
    async fn namespaces(&self) -> Result<Vec<String>>;

    async fn count(&self, namespace: &str) -> Result<u64>;

    /// Smallest and largest scan keys of a namespace.
    async fn key_bounds(&self, namespace: &str) -> Result<Option<(i64, i64)>>;

    async fn scan(&self, namespace: &str, range: &ScanRange) -> Result<Vec<ScannedDoc>>;

    /// All documents matching an equality selector.
    async fn find(&self, namespace: &str, selector: &Document) -> Result<Vec<Document>>;

    async fn find_by_id(&self, namespace: &str, id: &DocId) -> Result<Option<Document>>;

    /// Read up to `len` bytes of a document's attachment starting at
    /// `offset`. `None` when the document has no attachment.
    async fn read_attachment(
        &self,
        namespace: &str,
        id: &DocId,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Replication log
// ═══════════════════════════════════════════════════════════════════════

/// Where a live feed stream starts reading.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPosition {
    /// Replay the whole log.
    Beginning,
    /// Entries strictly after this timestamp.
    After(OpTimestamp),
    /// Entries strictly after this stream token.
    Token(Value),
}

#[async_trait]
pub trait ReplicationLog: Send + Sync {
    /// Stream ids of the current topology (one per shard).
    async fn streams(&self) -> Result<Vec<String>>;

    /// Read up to `limit` events after `from`. Every returned event carries a
    /// resume token for its stream.
    async fn read(
        &self,
        stream: &str,
        from: &FeedPosition,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>>;

    /// Timestamp of the newest entry across all streams.
    async fn latest_timestamp(&self) -> Result<Option<OpTimestamp>>;
}

// ═══════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════

/// Identity of a process contending for a cluster lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub name: String,
    pub instance_id: String,
    pub pid: u32,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub cluster: String,
    pub holder: LeaseHolder,
    pub expires_at: DateTime<Utc>,
}

/// Routing metadata persisted at index time for stateful deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMeta {
    pub namespace: String,
    pub id: String,
    pub index: String,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub pipeline: Option<String>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<OpTimestamp>>;
    async fn save_checkpoint(&self, name: &str, ts: OpTimestamp) -> Result<()>;

    async fn load_tokens(&self, name: &str) -> Result<HashMap<String, Value>>;
    async fn save_token(&self, name: &str, stream: &str, token: &Value) -> Result<()>;

    /// Claim the lease if it is free or expired. Returns whether `holder`
    /// now owns it.
    async fn try_acquire_lease(
        &self,
        cluster: &str,
        holder: &LeaseHolder,
        ttl: Duration,
    ) -> Result<bool>;

    /// Extend the lease if `holder` still owns it.
    async fn renew_lease(&self, cluster: &str, holder: &LeaseHolder, ttl: Duration)
        -> Result<bool>;

    async fn release_lease(&self, cluster: &str, holder: &LeaseHolder) -> Result<()>;

    async fn lease(&self, cluster: &str) -> Result<Option<LeaseRecord>>;

    async fn save_meta(&self, meta: &StoredMeta) -> Result<()>;

    /// Read and delete the record for `(namespace, id)`.
    async fn take_meta(&self, namespace: &str, id: &str) -> Result<Option<StoredMeta>>;

    /// Delete all records of a namespace, or of every collection in a
    /// database when `namespace` has no collection part.
    async fn purge_meta(&self, namespace: &str) -> Result<u64>;

    async fn completed_direct_reads(&self, name: &str) -> Result<Vec<String>>;
    async fn mark_direct_read_complete(&self, name: &str, namespace: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Index
// ═══════════════════════════════════════════════════════════════════════

/// Addressing and versioning for one bulk action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionMeta {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on_conflict: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    Index { meta: ActionMeta, doc: Document },
    /// Partial update; `upsert` creates the document when it is missing.
    Update {
        meta: ActionMeta,
        doc: Document,
        upsert: bool,
    },
    Delete { meta: ActionMeta },
}

impl BulkAction {
    pub fn meta(&self) -> &ActionMeta {
        match self {
            BulkAction::Index { meta, .. }
            | BulkAction::Update { meta, .. }
            | BulkAction::Delete { meta } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BulkAction::Index { .. } => "index",
            BulkAction::Update { .. } => "update",
            BulkAction::Delete { .. } => "delete",
        }
    }

    /// Approximate request size in bytes, used for the byte threshold.
    pub fn estimated_size(&self) -> usize {
        let meta_len = serde_json::to_string(self.meta())
            .map(|s| s.len())
            .unwrap_or(0);
        let body_len = match self {
            BulkAction::Index { doc, .. } | BulkAction::Update { doc, .. } => {
                serde_json::to_string(doc).map(|s| s.len()).unwrap_or(0)
            }
            BulkAction::Delete { .. } => 0,
        };
        meta_len + body_len + 32
    }
}

/// Outcome of one action inside a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub action: String,
    pub index: String,
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemResult {
    /// A rejected out-of-date external version.
    pub fn is_version_conflict(&self) -> bool {
        self.status == 409
    }

    pub fn is_failure(&self) -> bool {
        self.status >= 300 && !self.is_version_conflict() && !self.is_missing_delete()
    }

    fn is_missing_delete(&self) -> bool {
        self.action == "delete" && self.status == 404
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|i| i.is_failure())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// A document located by id search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub source: Option<Document>,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkResponse>;

    /// Delete indexes by name or glob pattern.
    async fn delete_indexes(&self, patterns: &[String]) -> Result<()>;

    /// Term search on `_id` over the indexes matching `pattern`.
    async fn find_by_id(&self, pattern: &str, id: &str, with_source: bool)
        -> Result<Vec<SearchHit>>;

    async fn put_pipeline(&self, name: &str, body: &Value) -> Result<()>;
}

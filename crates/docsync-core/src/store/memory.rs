//! In-memory implementations of the store traits, for tests and embedding.
//!
//! Everything lives in `HashMap`/`BTreeMap` behind `std::sync::RwLock`.
//!
//! - [`InMemorySource`] is both a [`SourceStore`] and a [`ReplicationLog`]:
//!   its mutation helpers write the document and append a log entry.
//! - [`InMemoryState`] holds checkpoints, tokens, leases, and delete metadata.
//! - [`InMemoryIndex`] applies bulk actions with external version checks
//!   and tombstones, close enough to a real search index for the engine's
//!   idempotence and ordering guarantees to be tested against it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;

use crate::models::{
    split_namespace, ChangeEvent, DocId, Document, OpTimestamp, Operation, ResumeToken,
    UpdateDescription,
};
use crate::relation::matches_selector;

use super::{
    ActionMeta, BulkAction, BulkItemResult, BulkResponse, FeedPosition, IndexBackend,
    LeaseHolder, LeaseRecord, ReplicationLog, ScanRange, ScannedDoc, SearchHit, SourceStore,
    StateStore, StoredMeta,
};

/// Stream id used when no other stream is named.
pub const DEFAULT_STREAM: &str = "rs0";

// ═══════════════════════════════════════════════════════════════════════
// Source + replication log
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Collection {
    next_key: i64,
    docs: BTreeMap<i64, Document>,
    keys: HashMap<String, i64>,
}

impl Collection {
    fn upsert(&mut self, id: &DocId, doc: Document) {
        let sid = id.to_stable_string();
        if let Some(key) = self.keys.get(&sid) {
            self.docs.insert(*key, doc);
        } else {
            self.next_key += 1;
            self.keys.insert(sid, self.next_key);
            self.docs.insert(self.next_key, doc);
        }
    }

    fn get(&self, id: &DocId) -> Option<&Document> {
        self.keys
            .get(&id.to_stable_string())
            .and_then(|k| self.docs.get(k))
    }

    fn remove(&mut self, id: &DocId) {
        if let Some(key) = self.keys.remove(&id.to_stable_string()) {
            self.docs.remove(&key);
        }
    }
}

struct LogEntry {
    seq: i64,
    stream: String,
    event: ChangeEvent,
}

#[derive(Default)]
struct SourceInner {
    collections: BTreeMap<String, Collection>,
    log: Vec<LogEntry>,
    clock: OpTimestamp,
    streams: BTreeSet<String>,
    attachments: HashMap<(String, String), Vec<u8>>,
}

impl SourceInner {
    fn tick(&mut self) -> OpTimestamp {
        let now = Utc::now().timestamp() as u32;
        self.clock = if now > self.clock.t {
            OpTimestamp::new(now, 1)
        } else {
            OpTimestamp::new(self.clock.t, self.clock.i + 1)
        };
        self.clock
    }

    fn append(&mut self, stream: &str, mut event: ChangeEvent) -> OpTimestamp {
        let ts = self.tick();
        event.timestamp = ts;
        self.streams.insert(stream.to_string());
        let seq = self.log.len() as i64 + 1;
        self.log.push(LogEntry {
            seq,
            stream: stream.to_string(),
            event,
        });
        ts
    }
}

/// Document store with an attached replication log.
pub struct InMemorySource {
    inner: RwLock<SourceInner>,
}

impl InMemorySource {
    pub fn new() -> Self {
        let mut inner = SourceInner::default();
        inner.streams.insert(DEFAULT_STREAM.to_string());
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Store a document without logging it, as data that predates the feed.
    pub fn put(&self, namespace: &str, doc: Document) -> Result<()> {
        let id = doc_id(&doc)?;
        let mut inner = self.inner.write().unwrap();
        inner
            .collections
            .entry(namespace.to_string())
            .or_default()
            .upsert(&id, doc);
        Ok(())
    }

    pub fn insert(&self, namespace: &str, doc: Document) -> Result<OpTimestamp> {
        self.insert_on(DEFAULT_STREAM, namespace, doc)
    }

    pub fn insert_on(&self, stream: &str, namespace: &str, doc: Document) -> Result<OpTimestamp> {
        let id = doc_id(&doc)?;
        let mut inner = self.inner.write().unwrap();
        inner
            .collections
            .entry(namespace.to_string())
            .or_default()
            .upsert(&id, doc.clone());
        Ok(inner.append(stream, ChangeEvent::insert(namespace, id, doc)))
    }

    /// Replace a document and log the full new version.
    pub fn replace(&self, namespace: &str, doc: Document) -> Result<OpTimestamp> {
        let id = doc_id(&doc)?;
        let mut inner = self.inner.write().unwrap();
        inner
            .collections
            .entry(namespace.to_string())
            .or_default()
            .upsert(&id, doc.clone());
        Ok(inner.append(DEFAULT_STREAM, ChangeEvent::update(namespace, id, doc)))
    }

    /// Apply a partial update and log only the update description.
    pub fn update_fields(
        &self,
        namespace: &str,
        id: &DocId,
        desc: UpdateDescription,
    ) -> Result<OpTimestamp> {
        let mut inner = self.inner.write().unwrap();
        let col = inner
            .collections
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("unknown namespace {}", namespace))?;
        let mut doc = col
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no document {} in {}", id, namespace))?;
        for (k, v) in &desc.updated_fields {
            doc.insert(k.clone(), v.clone());
        }
        for k in &desc.removed_fields {
            doc.remove(k);
        }
        col.upsert(id, doc);
        let mut event = ChangeEvent::new(namespace, id.clone(), Operation::Update);
        event.update_description = Some(desc);
        Ok(inner.append(DEFAULT_STREAM, event))
    }

    pub fn delete(&self, namespace: &str, id: &DocId) -> OpTimestamp {
        let mut inner = self.inner.write().unwrap();
        if let Some(col) = inner.collections.get_mut(namespace) {
            col.remove(id);
        }
        inner.append(DEFAULT_STREAM, ChangeEvent::delete(namespace, id.clone()))
    }

    pub fn drop_collection(&self, namespace: &str) -> OpTimestamp {
        let mut inner = self.inner.write().unwrap();
        inner.collections.remove(namespace);
        inner.append(DEFAULT_STREAM, ChangeEvent::drop_collection(namespace))
    }

    pub fn drop_database(&self, database: &str) -> OpTimestamp {
        let mut inner = self.inner.write().unwrap();
        inner
            .collections
            .retain(|ns, _| split_namespace(ns).0 != database);
        inner.append(DEFAULT_STREAM, ChangeEvent::drop_database(database))
    }

    pub fn put_attachment(&self, namespace: &str, id: &DocId, data: Vec<u8>) {
        let mut inner = self.inner.write().unwrap();
        inner
            .attachments
            .insert((namespace.to_string(), id.to_stable_string()), data);
    }

    /// Register a stream (shard) with no entries yet.
    pub fn add_stream(&self, stream: &str) {
        self.inner
            .write()
            .unwrap()
            .streams
            .insert(stream.to_string());
    }

    pub fn log_len(&self) -> usize {
        self.inner.read().unwrap().log.len()
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn doc_id(doc: &Document) -> Result<DocId> {
    match DocId::from_document(doc) {
        Some(id) => Ok(id),
        None => bail!("document has no usable _id"),
    }
}

#[async_trait]
impl SourceStore for InMemorySource {
    async fn namespaces(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .collections
            .iter()
            .filter(|(_, c)| !c.docs.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect())
    }

    async fn count(&self, namespace: &str) -> Result<u64> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .collections
            .get(namespace)
            .map(|c| c.docs.len() as u64)
            .unwrap_or(0))
    }

    async fn key_bounds(&self, namespace: &str) -> Result<Option<(i64, i64)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.collections.get(namespace).and_then(|c| {
            let first = c.docs.keys().next()?;
            let last = c.docs.keys().next_back()?;
            Some((*first, *last))
        }))
    }

    async fn scan(&self, namespace: &str, range: &ScanRange) -> Result<Vec<ScannedDoc>> {
        let inner = self.inner.read().unwrap();
        let Some(col) = inner.collections.get(namespace) else {
            return Ok(Vec::new());
        };
        let lower = range.after.map(|a| a + 1).unwrap_or(i64::MIN);
        let upper = range.through.unwrap_or(i64::MAX);
        if lower > upper {
            return Ok(Vec::new());
        }
        Ok(col
            .docs
            .range(lower..=upper)
            .filter(|(_, d)| range.selector.as_ref().map_or(true, |s| matches_selector(d, s)))
            .take(range.limit.max(1))
            .map(|(k, d)| ScannedDoc {
                key: *k,
                document: d.clone(),
            })
            .collect())
    }

    async fn find(&self, namespace: &str, selector: &Document) -> Result<Vec<Document>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .collections
            .get(namespace)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|d| matches_selector(d, selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_id(&self, namespace: &str, id: &DocId) -> Result<Option<Document>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .collections
            .get(namespace)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn read_attachment(
        &self,
        namespace: &str,
        id: &DocId,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .attachments
            .get(&(namespace.to_string(), id.to_stable_string()))
            .map(|data| {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                data[start..end].to_vec()
            }))
    }
}

#[async_trait]
impl ReplicationLog for InMemorySource {
    async fn streams(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().unwrap().streams.iter().cloned().collect())
    }

    async fn read(
        &self,
        stream: &str,
        from: &FeedPosition,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.read().unwrap();
        let after_seq = match from {
            FeedPosition::Token(v) => v.as_i64(),
            _ => None,
        };
        Ok(inner
            .log
            .iter()
            .filter(|e| e.stream == stream)
            .filter(|e| match from {
                FeedPosition::Beginning => true,
                FeedPosition::After(ts) => e.event.timestamp > *ts,
                FeedPosition::Token(_) => after_seq.map_or(true, |s| e.seq > s),
            })
            .take(limit)
            .map(|e| {
                let mut event = e.event.clone();
                event.resume_token = Some(ResumeToken {
                    stream_id: e.stream.clone(),
                    token: Value::from(e.seq),
                });
                event
            })
            .collect())
    }

    async fn latest_timestamp(&self) -> Result<Option<OpTimestamp>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.log.iter().map(|e| e.event.timestamp).max())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct StateInner {
    checkpoints: HashMap<String, OpTimestamp>,
    tokens: HashMap<String, HashMap<String, Value>>,
    leases: HashMap<String, LeaseRecord>,
    meta: HashMap<(String, String), StoredMeta>,
    direct_reads: HashMap<String, BTreeSet<String>>,
    checkpoint_writes: usize,
}

/// Checkpoint, lease, and metadata state held in memory.
#[derive(Default)]
pub struct InMemoryState {
    inner: RwLock<StateInner>,
    fail_lease_writes: AtomicBool,
}

impl InMemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every lease operation fail, as an unreachable store would.
    pub fn fail_lease_writes(&self, fail: bool) {
        self.fail_lease_writes.store(fail, Ordering::SeqCst);
    }

    /// Push a lease's expiry into the past.
    pub fn expire_lease(&self, cluster: &str) {
        if let Some(rec) = self.inner.write().unwrap().leases.get_mut(cluster) {
            rec.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    /// Number of checkpoint saves so far.
    pub fn checkpoint_writes(&self) -> usize {
        self.inner.read().unwrap().checkpoint_writes
    }

    pub fn meta_len(&self) -> usize {
        self.inner.read().unwrap().meta.len()
    }

    fn check_lease_writes(&self) -> Result<()> {
        if self.fail_lease_writes.load(Ordering::SeqCst) {
            bail!("lease store unavailable");
        }
        Ok(())
    }
}

fn expiry(ttl: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[async_trait]
impl StateStore for InMemoryState {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<OpTimestamp>> {
        Ok(self.inner.read().unwrap().checkpoints.get(name).copied())
    }

    async fn save_checkpoint(&self, name: &str, ts: OpTimestamp) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.checkpoints.insert(name.to_string(), ts);
        inner.checkpoint_writes += 1;
        Ok(())
    }

    async fn load_tokens(&self, name: &str) -> Result<HashMap<String, Value>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .tokens
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_token(&self, name: &str, stream: &str, token: &Value) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .tokens
            .entry(name.to_string())
            .or_default()
            .insert(stream.to_string(), token.clone());
        inner.checkpoint_writes += 1;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        cluster: &str,
        holder: &LeaseHolder,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_lease_writes()?;
        let mut inner = self.inner.write().unwrap();
        let free = match inner.leases.get(cluster) {
            None => true,
            Some(rec) => rec.expires_at <= Utc::now() || rec.holder == *holder,
        };
        if free {
            inner.leases.insert(
                cluster.to_string(),
                LeaseRecord {
                    cluster: cluster.to_string(),
                    holder: holder.clone(),
                    expires_at: expiry(ttl),
                },
            );
        }
        Ok(free)
    }

    async fn renew_lease(
        &self,
        cluster: &str,
        holder: &LeaseHolder,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_lease_writes()?;
        let mut inner = self.inner.write().unwrap();
        match inner.leases.get_mut(cluster) {
            Some(rec) if rec.holder == *holder => {
                rec.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, cluster: &str, holder: &LeaseHolder) -> Result<()> {
        self.check_lease_writes()?;
        let mut inner = self.inner.write().unwrap();
        if inner
            .leases
            .get(cluster)
            .is_some_and(|rec| rec.holder == *holder)
        {
            inner.leases.remove(cluster);
        }
        Ok(())
    }

    async fn lease(&self, cluster: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.inner.read().unwrap().leases.get(cluster).cloned())
    }

    async fn save_meta(&self, meta: &StoredMeta) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .meta
            .insert((meta.namespace.clone(), meta.id.clone()), meta.clone());
        Ok(())
    }

    async fn take_meta(&self, namespace: &str, id: &str) -> Result<Option<StoredMeta>> {
        Ok(self
            .inner
            .write()
            .unwrap()
            .meta
            .remove(&(namespace.to_string(), id.to_string())))
    }

    async fn purge_meta(&self, namespace: &str) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.meta.len();
        let whole_db = split_namespace(namespace).1.is_empty();
        inner.meta.retain(|(ns, _), _| {
            if whole_db {
                split_namespace(ns).0 != namespace
            } else {
                ns != namespace
            }
        });
        Ok((before - inner.meta.len()) as u64)
    }

    async fn completed_direct_reads(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .direct_reads
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_direct_read_complete(&self, name: &str, namespace: &str) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .direct_reads
            .entry(name.to_string())
            .or_default()
            .insert(namespace.to_string());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Index
// ═══════════════════════════════════════════════════════════════════════

/// A live document in the in-memory index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDoc {
    pub source: Document,
    pub version: i64,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub pipeline: Option<String>,
}

struct Slot {
    doc: Option<IndexedDoc>,
    version: i64,
}

/// Search index stand-in with external versioning.
#[derive(Default)]
pub struct InMemoryIndex {
    indices: RwLock<BTreeMap<String, HashMap<String, Slot>>>,
    pipelines: RwLock<HashMap<String, Value>>,
    rejected_indexes: RwLock<HashSet<String>>,
    bulk_calls: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: &str, id: &str) -> Option<IndexedDoc> {
        self.indices
            .read()
            .unwrap()
            .get(index)
            .and_then(|docs| docs.get(id))
            .and_then(|slot| slot.doc.clone())
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indices.read().unwrap().keys().cloned().collect()
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.indices
            .read()
            .unwrap()
            .get(index)
            .map(|docs| docs.values().filter(|s| s.doc.is_some()).count())
            .unwrap_or(0)
    }

    pub fn total_docs(&self) -> usize {
        self.indices
            .read()
            .unwrap()
            .values()
            .map(|docs| docs.values().filter(|s| s.doc.is_some()).count())
            .sum()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn pipeline(&self, name: &str) -> Option<Value> {
        self.pipelines.read().unwrap().get(name).cloned()
    }

    /// Fail every write into `index` with a mapping error.
    pub fn reject_writes_to(&self, index: &str) {
        self.rejected_indexes
            .write()
            .unwrap()
            .insert(index.to_string());
    }

    fn apply(&self, action: &BulkAction) -> BulkItemResult {
        let meta = action.meta();
        let result = |status: u16, error: Option<String>| BulkItemResult {
            action: action.kind().to_string(),
            index: meta.index.clone(),
            id: meta.id.clone(),
            status,
            error,
        };

        if self.rejected_indexes.read().unwrap().contains(&meta.index) {
            return result(400, Some("mapper_parsing_exception".into()));
        }
        if let Some(p) = &meta.pipeline {
            if !self.pipelines.read().unwrap().contains_key(p) {
                return result(400, Some(format!("pipeline with id [{}] does not exist", p)));
            }
        }

        let mut indices = self.indices.write().unwrap();
        let docs = indices.entry(meta.index.clone()).or_default();
        let current = docs.get(&meta.id);
        let current_version = current.map(|s| s.version);
        let live = current.and_then(|s| s.doc.clone());

        if let (Some(v), Some(cur)) = (external_version(meta), current_version) {
            if !matches!(action, BulkAction::Update { .. }) && v <= cur {
                return result(
                    409,
                    Some(format!(
                        "version conflict, current version [{}] is higher or equal to the one provided [{}]",
                        cur, v
                    )),
                );
            }
        }
        let next_version =
            external_version(meta).unwrap_or_else(|| current_version.unwrap_or(0) + 1);

        match action {
            BulkAction::Index { doc, .. } => {
                let created = live.is_none();
                docs.insert(meta.id.clone(), live_slot(meta, doc.clone(), next_version));
                result(if created { 201 } else { 200 }, None)
            }
            BulkAction::Update { doc, upsert, .. } => match live {
                Some(existing) => {
                    let mut source = existing.source;
                    merge_into(&mut source, doc);
                    let version = current_version.unwrap_or(0) + 1;
                    docs.insert(meta.id.clone(), live_slot(meta, source, version));
                    result(200, None)
                }
                None if *upsert => {
                    let version = current_version.unwrap_or(0) + 1;
                    docs.insert(meta.id.clone(), live_slot(meta, doc.clone(), version));
                    result(201, None)
                }
                None => result(404, Some("document_missing_exception".into())),
            },
            BulkAction::Delete { .. } => {
                docs.insert(
                    meta.id.clone(),
                    Slot {
                        doc: None,
                        version: next_version,
                    },
                );
                if live.is_some() {
                    result(200, None)
                } else {
                    result(404, None)
                }
            }
        }
    }
}

fn external_version(meta: &ActionMeta) -> Option<i64> {
    match (meta.version, meta.version_type.as_deref()) {
        (Some(v), Some("external")) | (Some(v), Some("external_gt")) => Some(v),
        _ => None,
    }
}

fn live_slot(meta: &ActionMeta, source: Document, version: i64) -> Slot {
    Slot {
        doc: Some(IndexedDoc {
            source,
            version,
            routing: meta.routing.clone(),
            parent: meta.parent.clone(),
            pipeline: meta.pipeline.clone(),
        }),
        version,
    }
}

/// Recursive partial-document merge.
fn merge_into(target: &mut Document, patch: &Document) {
    for (k, v) in patch {
        match (target.get_mut(k), v) {
            (Some(Value::Object(t)), Value::Object(p)) => merge_into(t, p),
            _ => {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

fn glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        for part in pattern.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            builder.add(Glob::new(part)?);
        }
    }
    Ok(builder.build()?)
}

#[async_trait]
impl IndexBackend for InMemoryIndex {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkResponse> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BulkResponse {
            items: actions.iter().map(|a| self.apply(a)).collect(),
        })
    }

    async fn delete_indexes(&self, patterns: &[String]) -> Result<()> {
        let set = glob_set(patterns)?;
        self.indices
            .write()
            .unwrap()
            .retain(|name, _| !set.is_match(name));
        Ok(())
    }

    async fn find_by_id(
        &self,
        pattern: &str,
        id: &str,
        with_source: bool,
    ) -> Result<Vec<SearchHit>> {
        let set = glob_set(&[pattern.to_string()])?;
        let indices = self.indices.read().unwrap();
        Ok(indices
            .iter()
            .filter(|(name, _)| set.is_match(name.as_str()))
            .filter_map(|(name, docs)| {
                let doc = docs.get(id)?.doc.as_ref()?;
                Some(SearchHit {
                    index: name.clone(),
                    id: id.to_string(),
                    routing: doc.routing.clone(),
                    parent: doc.parent.clone(),
                    source: with_source.then(|| doc.source.clone()),
                })
            })
            .collect())
    }

    async fn put_pipeline(&self, name: &str, body: &Value) -> Result<()> {
        self.pipelines
            .write()
            .unwrap()
            .insert(name.to_string(), body.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn index_action(id: &str, version: i64, data: &str) -> BulkAction {
        BulkAction::Index {
            meta: ActionMeta {
                index: "db.col".into(),
                id: id.into(),
                version: Some(version),
                version_type: Some("external".into()),
                ..Default::default()
            },
            doc: doc(json!({ "data": data })),
        }
    }

    #[tokio::test]
    async fn test_external_version_rejects_stale_writes() {
        let index = InMemoryIndex::new();
        let r = index.bulk(&[index_action("1", 10, "a")]).await.unwrap();
        assert_eq!(r.items[0].status, 201);

        let r = index
            .bulk(&[index_action("1", 10, "b"), index_action("1", 9, "c")])
            .await
            .unwrap();
        assert!(r.items.iter().all(|i| i.is_version_conflict()));
        assert!(!r.has_failures());
        assert_eq!(index.get("db.col", "1").unwrap().source["data"], json!("a"));
    }

    #[tokio::test]
    async fn test_tombstone_blocks_older_reinsert() {
        let index = InMemoryIndex::new();
        index.bulk(&[index_action("1", 10, "a")]).await.unwrap();
        let delete = BulkAction::Delete {
            meta: ActionMeta {
                index: "db.col".into(),
                id: "1".into(),
                version: Some(12),
                version_type: Some("external".into()),
                ..Default::default()
            },
        };
        index.bulk(&[delete]).await.unwrap();
        assert!(index.get("db.col", "1").is_none());
        let r = index.bulk(&[index_action("1", 11, "late")]).await.unwrap();
        assert_eq!(r.items[0].status, 409);
    }

    #[tokio::test]
    async fn test_delete_indexes_by_pattern() {
        let index = InMemoryIndex::new();
        for name in ["db.a", "db.b", "other.a"] {
            let mut a = index_action("1", 1, "x");
            if let BulkAction::Index { meta, .. } = &mut a {
                meta.index = name.into();
            }
            index.bulk(&[a]).await.unwrap();
        }
        index.delete_indexes(&["db.*".into()]).await.unwrap();
        assert_eq!(index.index_names(), vec!["other.a".to_string()]);
    }

    #[tokio::test]
    async fn test_log_reads_by_token_and_timestamp() {
        let source = InMemorySource::new();
        let t1 = source.insert("db.a", doc(json!({"_id": 1}))).unwrap();
        let t2 = source.insert("db.a", doc(json!({"_id": 2}))).unwrap();
        assert!(t2 > t1);

        let all = source
            .read(DEFAULT_STREAM, &FeedPosition::Beginning, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let token = all[0].resume_token.clone().unwrap().token;
        let rest = source
            .read(DEFAULT_STREAM, &FeedPosition::Token(token), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, DocId::Int(2));
        let after = source
            .read(DEFAULT_STREAM, &FeedPosition::After(t2), 10)
            .await
            .unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expired() {
        let state = InMemoryState::new();
        let holder = |id: &str| LeaseHolder {
            name: "c".into(),
            instance_id: id.into(),
            pid: 1,
            host: "h".into(),
        };
        let ttl = Duration::from_secs(30);
        assert!(state.try_acquire_lease("c", &holder("a"), ttl).await.unwrap());
        assert!(!state.try_acquire_lease("c", &holder("b"), ttl).await.unwrap());
        assert!(!state.renew_lease("c", &holder("b"), ttl).await.unwrap());
        state.expire_lease("c");
        assert!(state.try_acquire_lease("c", &holder("b"), ttl).await.unwrap());
        assert!(!state.renew_lease("c", &holder("a"), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_meta_is_single_use_and_purgeable() {
        let state = InMemoryState::new();
        let meta = |ns: &str, id: &str| StoredMeta {
            namespace: ns.into(),
            id: id.into(),
            index: "custom".into(),
            routing: Some("r".into()),
            parent: None,
            pipeline: None,
        };
        state.save_meta(&meta("db.a", "1")).await.unwrap();
        assert!(state.take_meta("db.a", "1").await.unwrap().is_some());
        assert!(state.take_meta("db.a", "1").await.unwrap().is_none());

        state.save_meta(&meta("db.a", "2")).await.unwrap();
        state.save_meta(&meta("db.b", "3")).await.unwrap();
        state.save_meta(&meta("other.a", "4")).await.unwrap();
        assert_eq!(state.purge_meta("db").await.unwrap(), 2);
        assert_eq!(state.meta_len(), 1);
    }
}

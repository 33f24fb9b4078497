//! Event filter chain.
//!
//! Filters are evaluated in order and the chain stops at the first
//! rejection. [`FilterChain::standard`] assembles the built-in filters in
//! their fixed relative order:
//!
//! | # | Filter | Rejects |
//! |---|--------|---------|
//! | 1 | [`AdminNamespaceFilter`] | events on docsync's own bookkeeping database |
//! | 2 | [`SystemCollectionFilter`] | `system.*` collections |
//! | 3 | [`ChunksFilter`] | GridFS-style `*.chunks` sub-collections |
//! | 4 | [`NamespaceRegexFilter`] | namespaces outside the allow/deny regexes |
//! | 5 | [`WorkerFilter`] | namespaces owned by another worker |
//! | 6 | [`DocumentPredicate`] | documents rejected by a plugin predicate |
//!
//! The document predicate is appended by the caller with
//! [`FilterChain::push`] and only inspects inserts and updates that carry a
//! document.

use std::collections::BTreeMap;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::{ChangeEvent, Operation};

/// A predicate over change events.
pub trait EventFilter: Send + Sync {
    fn name(&self) -> &str;
    fn accept(&self, event: &ChangeEvent) -> bool;
}

/// Ordered, short-circuiting filter composition.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn EventFilter>>,
}

/// Inputs for the built-in part of the chain.
#[derive(Debug, Clone, Default)]
pub struct StandardFilters {
    pub admin_database: String,
    pub namespace_regex: Option<Regex>,
    pub namespace_exclude_regex: Option<Regex>,
    pub namespace_drop_regex: Option<Regex>,
    pub namespace_drop_exclude_regex: Option<Regex>,
    /// `(this worker, all workers)`
    pub worker: Option<(String, Vec<String>)>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(opts: StandardFilters) -> Self {
        let mut chain = Self::new();
        chain.push(AdminNamespaceFilter::new(opts.admin_database));
        chain.push(SystemCollectionFilter);
        chain.push(ChunksFilter);
        chain.push(NamespaceRegexFilter {
            include: opts.namespace_regex,
            exclude: opts.namespace_exclude_regex,
            drop_include: opts.namespace_drop_regex,
            drop_exclude: opts.namespace_drop_exclude_regex,
        });
        if let Some((worker, workers)) = opts.worker {
            chain.push(WorkerFilter::new(worker, &workers));
        }
        chain
    }

    pub fn push(&mut self, filter: impl EventFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn accept(&self, event: &ChangeEvent) -> bool {
        self.rejected_by(event).is_none()
    }

    /// Name of the first filter rejecting the event, if any.
    pub fn rejected_by(&self, event: &ChangeEvent) -> Option<&str> {
        self.filters
            .iter()
            .find(|f| !f.accept(event))
            .map(|f| f.name())
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

/// Rejects everything in the bookkeeping database so the engine never
/// replicates its own checkpoints and leases.
pub struct AdminNamespaceFilter {
    database: String,
}

impl AdminNamespaceFilter {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }
}

impl EventFilter for AdminNamespaceFilter {
    fn name(&self) -> &str {
        "admin-namespace"
    }

    fn accept(&self, event: &ChangeEvent) -> bool {
        let db = event.database();
        db != self.database && db != "admin" && db != "local"
    }
}

pub struct SystemCollectionFilter;

impl EventFilter for SystemCollectionFilter {
    fn name(&self) -> &str {
        "system-collection"
    }

    fn accept(&self, event: &ChangeEvent) -> bool {
        !event.collection().starts_with("system.")
    }
}

pub struct ChunksFilter;

impl EventFilter for ChunksFilter {
    fn name(&self) -> &str {
        "chunks"
    }

    fn accept(&self, event: &ChangeEvent) -> bool {
        !event.collection().ends_with(".chunks")
    }
}

/// Allow/deny regexes. Drop events are judged only by the drop variants;
/// data events only by the namespace variants.
#[derive(Debug, Default)]
pub struct NamespaceRegexFilter {
    pub include: Option<Regex>,
    pub exclude: Option<Regex>,
    pub drop_include: Option<Regex>,
    pub drop_exclude: Option<Regex>,
}

impl EventFilter for NamespaceRegexFilter {
    fn name(&self) -> &str {
        "namespace-regex"
    }

    fn accept(&self, event: &ChangeEvent) -> bool {
        let ns = event.namespace.as_str();
        let (include, exclude) = if event.is_drop() {
            (&self.drop_include, &self.drop_exclude)
        } else {
            (&self.include, &self.exclude)
        };
        if let Some(re) = include {
            if !re.is_match(ns) {
                return false;
            }
        }
        if let Some(re) = exclude {
            if re.is_match(ns) {
                return false;
            }
        }
        true
    }
}

/// Consistent-hash ring over worker names.
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
}

const RING_REPLICAS: usize = 64;

impl HashRing {
    pub fn new(nodes: &[String]) -> Self {
        let mut ring = BTreeMap::new();
        for node in nodes {
            for replica in 0..RING_REPLICAS {
                ring.insert(hash_key(&format!("{}#{}", node, replica)), node.clone());
            }
        }
        Self { ring }
    }

    /// Owner of a key: the first ring point at or after its hash.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let h = hash_key(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }
}

fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Keeps only namespaces this worker owns on the ring.
pub struct WorkerFilter {
    worker: String,
    ring: HashRing,
}

impl WorkerFilter {
    pub fn new(worker: impl Into<String>, workers: &[String]) -> Self {
        Self {
            worker: worker.into(),
            ring: HashRing::new(workers),
        }
    }
}

impl EventFilter for WorkerFilter {
    fn name(&self) -> &str {
        "worker"
    }

    fn accept(&self, event: &ChangeEvent) -> bool {
        // database drops have no collection to hash
        if event.operation == Operation::DropDatabase {
            return true;
        }
        self.ring.owner(&event.namespace) == Some(self.worker.as_str())
    }
}

/// Adapts a document-level predicate into the chain. Events without a
/// document, deletes and drops always pass.
pub struct DocumentPredicate<F> {
    name: String,
    predicate: F,
}

impl<F> DocumentPredicate<F>
where
    F: Fn(&ChangeEvent) -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> EventFilter for DocumentPredicate<F>
where
    F: Fn(&ChangeEvent) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, event: &ChangeEvent) -> bool {
        let inspectable = matches!(event.operation, Operation::Insert | Operation::Update)
            && event.document.is_some();
        !inspectable || (self.predicate)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocId;

    fn ins(ns: &str) -> ChangeEvent {
        ChangeEvent::insert(ns, DocId::Int(1), Default::default())
    }

    #[test]
    fn test_builtin_filters_reject_internal_namespaces() {
        let chain = FilterChain::standard(StandardFilters {
            admin_database: "docsync".into(),
            ..Default::default()
        });
        assert_eq!(chain.rejected_by(&ins("docsync.checkpoints")), Some("admin-namespace"));
        assert_eq!(chain.rejected_by(&ins("db.system.views")), Some("system-collection"));
        assert_eq!(chain.rejected_by(&ins("db.fs.chunks")), Some("chunks"));
        assert!(chain.accept(&ins("db.fs.files")));
        assert!(chain.accept(&ins("db.users")));
    }

    #[test]
    fn test_drop_events_use_drop_regexes() {
        let f = NamespaceRegexFilter {
            include: Some(Regex::new(r"^db\.keep$").unwrap()),
            exclude: None,
            drop_include: None,
            drop_exclude: Some(Regex::new(r"^db\.precious$").unwrap()),
        };
        assert!(f.accept(&ins("db.keep")));
        assert!(!f.accept(&ins("db.other")));
        assert!(f.accept(&ChangeEvent::drop_collection("db.other")));
        assert!(!f.accept(&ChangeEvent::drop_collection("db.precious")));
    }

    #[test]
    fn test_workers_partition_namespaces() {
        let workers: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let filters: Vec<WorkerFilter> = workers
            .iter()
            .map(|w| WorkerFilter::new(w.clone(), &workers))
            .collect();
        for i in 0..200 {
            let event = ins(&format!("db.col{}", i));
            let owners = filters.iter().filter(|f| f.accept(&event)).count();
            assert_eq!(owners, 1, "namespace db.col{} must have one owner", i);
        }
    }

    #[test]
    fn test_document_predicate_skips_deletes() {
        let pred = DocumentPredicate::new("never", |_e: &ChangeEvent| false);
        assert!(!pred.accept(&ins("db.a")));
        assert!(pred.accept(&ChangeEvent::delete("db.a", DocId::Int(1))));
        assert!(pred.accept(&ChangeEvent::drop_collection("db.a")));
    }
}

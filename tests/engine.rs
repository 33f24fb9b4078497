//! End-to-end runs of the engine against the in-memory stores.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use docsync::config::Config;
use docsync::context::SyncContext;
use docsync::engine::{Engine, Outcome, Stores};
use docsync::error::ErrorReporter;
use docsync::plugins::{DocumentFilter, PluginRegistry, PostContext, PostProcessor, TransformInput};
use docsync::script::register_scripts;
use docsync::stats::IndexStats;
use docsync_core::models::{ChangeEvent, DocId, Document, EventSource, UpdateDescription};
use docsync_core::store::memory::{InMemoryIndex, InMemorySource, InMemoryState};
use docsync_core::store::StateStore;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

struct Harness {
    source: Arc<InMemorySource>,
    state: Arc<InMemoryState>,
    index: Arc<InMemoryIndex>,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: Arc::new(InMemorySource::new()),
            state: Arc::new(InMemoryState::new()),
            index: Arc::new(InMemoryIndex::new()),
        }
    }

    fn stores(&self) -> Stores {
        Stores {
            source: self.source.clone(),
            log: self.source.clone(),
            state: self.state.clone(),
            index: self.index.clone(),
        }
    }

    fn start(&self, toml: &str) -> Running {
        self.start_with(toml, PluginRegistry::new())
    }

    fn start_with(&self, toml: &str, mut plugins: PluginRegistry) -> Running {
        let config = Config::from_toml_str(toml).unwrap();
        register_scripts(&mut plugins, &config).unwrap();
        let reporter = ErrorReporter::new(config.fail_fast);
        let ctx = SyncContext::new(config, plugins, reporter.clone()).unwrap();
        let engine = Engine::new(ctx, self.stores());
        let shutdown = engine.shutdown_token();
        Running {
            shutdown,
            reporter,
            stats: engine.stats(),
            handle: tokio::spawn(engine.run()),
        }
    }

    fn indexed(&self, index: &str, id: &str) -> Option<Document> {
        self.index.get(index, id).map(|d| d.source)
    }
}

struct Running {
    shutdown: CancellationToken,
    reporter: ErrorReporter,
    stats: Arc<IndexStats>,
    handle: JoinHandle<Result<Outcome>>,
}

impl Running {
    async fn stop(self) -> (Outcome, ErrorReporter) {
        self.shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(20), self.handle)
            .await
            .expect("engine did not stop")
            .unwrap()
            .unwrap();
        (outcome, self.reporter)
    }

    async fn finish(self) -> (Outcome, ErrorReporter) {
        let outcome = tokio::time::timeout(Duration::from_secs(20), self.handle)
            .await
            .expect("engine did not finish")
            .unwrap()
            .unwrap();
        (outcome, self.reporter)
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Records the ids of every event handed to post-processors.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, EventSource)>>,
}

impl Recorder {
    fn ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl PostProcessor for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn process(&self, event: &ChangeEvent, _ctx: &PostContext) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((event.id.to_stable_string(), event.source));
        Ok(())
    }
}

fn recording() -> (Arc<Recorder>, PluginRegistry) {
    let recorder = Arc::new(Recorder::default());
    let mut plugins = PluginRegistry::new();
    plugins.register_post_processor(recorder.clone());
    (recorder, plugins)
}

const REPLAY: &str = "replay = true\nelasticsearch-max-seconds = 1\n";

// ── Basic flow ──

#[tokio::test]
async fn test_insert_update_delete_scenario() {
    let h = Harness::new();
    let run = h.start(REPLAY);

    h.source
        .insert("ns.coll", doc(json!({"_id": "1", "data": "x"})))
        .unwrap();
    wait_for("insert", || {
        h.indexed("ns.coll", "1").map(|d| d["data"] == json!("x")) == Some(true)
    })
    .await;

    let mut desc = UpdateDescription::default();
    desc.updated_fields.insert("data".into(), json!("y"));
    h.source
        .update_fields("ns.coll", &DocId::String("1".into()), desc)
        .unwrap();
    wait_for("update", || {
        h.indexed("ns.coll", "1").map(|d| d["data"] == json!("y")) == Some(true)
    })
    .await;

    h.source.delete("ns.coll", &DocId::String("1".into()));
    wait_for("delete", || h.indexed("ns.coll", "1").is_none()).await;

    let (outcome, reporter) = run.stop().await;
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(reporter.error_count(), 0);
}

#[tokio::test]
async fn test_replaying_the_feed_is_idempotent() {
    let h = Harness::new();
    for i in 0..20 {
        h.source
            .insert("shop.items", doc(json!({"_id": i, "n": i})))
            .unwrap();
    }
    h.source
        .replace("shop.items", doc(json!({"_id": 3, "n": 300})))
        .unwrap();
    h.source
        .insert("shop.items", doc(json!({"_id": "last"})))
        .unwrap();

    for _ in 0..2 {
        let run = h.start(REPLAY);
        wait_for("sentinel", || h.indexed("shop.items", "last").is_some()).await;
        let (outcome, reporter) = run.stop().await;
        assert_eq!(outcome, Outcome::Stopped);
        assert_eq!(reporter.error_count(), 0);
        assert_eq!(h.index.doc_count("shop.items"), 21);
        assert_eq!(h.indexed("shop.items", "3").unwrap()["n"], json!(300));
    }
}

#[tokio::test]
async fn test_last_live_write_wins_per_document() {
    let h = Harness::new();
    for n in 0..50 {
        h.source
            .replace("shop.counters", doc(json!({"_id": "k", "n": n})))
            .unwrap();
    }
    h.source
        .insert("shop.counters", doc(json!({"_id": "done"})))
        .unwrap();

    let run = h.start("replay = true\nindex-workers = 4\n");
    wait_for("sentinel", || h.indexed("shop.counters", "done").is_some()).await;
    run.stop().await;
    assert_eq!(h.indexed("shop.counters", "k").unwrap()["n"], json!(49));
}

// ── Relations ──

const CUSTOMER_ORDERS: &str = r#"
replay = true

[[relate]]
namespace = "shop.customers"
with-namespace = "shop.orders"
src-field = "_id"
match-field = "customer_id"
"#;

#[tokio::test]
async fn test_join_expansion_replaces_source_document() {
    let h = Harness::new();
    h.source
        .put("shop.orders", doc(json!({"_id": "o1", "customer_id": 5})))
        .unwrap();
    h.source
        .put("shop.orders", doc(json!({"_id": "o2", "customer_id": 5})))
        .unwrap();
    h.source
        .put("shop.orders", doc(json!({"_id": "o3", "customer_id": 6})))
        .unwrap();

    let (recorder, plugins) = recording();
    let run = h.start_with(CUSTOMER_ORDERS, plugins);
    h.source
        .insert("shop.customers", doc(json!({"_id": 5, "name": "ada"})))
        .unwrap();
    wait_for("derived orders", || {
        h.indexed("shop.orders", "o1").is_some() && h.indexed("shop.orders", "o2").is_some()
    })
    .await;
    run.stop().await;

    assert!(h.indexed("shop.orders", "o3").is_none());
    assert!(h.indexed("shop.customers", "5").is_none());
    let derived = recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, source)| *source == EventSource::DerivedJoin)
        .count();
    assert_eq!(derived, 2);
}

#[tokio::test]
async fn test_keep_src_indexes_source_too() {
    let h = Harness::new();
    h.source
        .put("shop.orders", doc(json!({"_id": "o1", "customer_id": 5})))
        .unwrap();

    let run = h.start(&format!("{}keep-src = true\n", CUSTOMER_ORDERS));
    h.source
        .insert("shop.customers", doc(json!({"_id": 5, "name": "ada"})))
        .unwrap();
    wait_for("both documents", || {
        h.indexed("shop.orders", "o1").is_some() && h.indexed("shop.customers", "5").is_some()
    })
    .await;
    run.stop().await;
}

const CHAIN: &str = r#"
replay = true

[[relate]]
namespace = "db.a"
with-namespace = "db.b"
match-field = "a_id"
{depth}

[[relate]]
namespace = "db.b"
with-namespace = "db.c"
match-field = "b_id"
"#;

fn seed_chain(h: &Harness) {
    h.source
        .put("db.b", doc(json!({"_id": "b1", "a_id": 1})))
        .unwrap();
    h.source
        .put("db.c", doc(json!({"_id": "c1", "b_id": "b1"})))
        .unwrap();
}

#[tokio::test]
async fn test_depth_bound_stops_chain() {
    let h = Harness::new();
    seed_chain(&h);
    let run = h.start(&CHAIN.replace("{depth}", "max-depth = 1"));
    h.source.insert("db.a", doc(json!({"_id": 1}))).unwrap();
    wait_for("b1", || h.indexed("db.b", "b1").is_some()).await;
    run.stop().await;

    assert!(h.indexed("db.c", "c1").is_none());
    assert!(h.indexed("db.a", "1").is_none());
}

#[tokio::test]
async fn test_unbounded_chain_reaches_the_end() {
    let h = Harness::new();
    seed_chain(&h);
    let run = h.start(&CHAIN.replace("{depth}", ""));
    h.source.insert("db.a", doc(json!({"_id": 1}))).unwrap();
    wait_for("c1", || h.indexed("db.c", "c1").is_some()).await;
    run.stop().await;

    // b1 has relations of its own and none keeps its source
    assert!(h.indexed("db.b", "b1").is_none());
}

#[tokio::test]
async fn test_flooded_relate_queue_does_not_stall() {
    let h = Harness::new();
    for i in 0..300 {
        h.source
            .put("shop.orders", doc(json!({"_id": format!("o{}", i), "customer_id": i})))
            .unwrap();
        h.source
            .insert("shop.customers", doc(json!({"_id": i})))
            .unwrap();
    }
    h.source
        .insert("shop.other", doc(json!({"_id": "sentinel"})))
        .unwrap();

    let run = h.start(&format!(
        "relate-buffer = 1\nrelate-threads = 1\n{}",
        CUSTOMER_ORDERS
    ));
    wait_for("sentinel", || h.indexed("shop.other", "sentinel").is_some()).await;
    let stats = run.stats.clone();
    let (outcome, reporter) = run.stop().await;

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(reporter.error_count(), 0);
    let skipped = stats.snapshot().relate_skipped;
    assert!(skipped > 0, "no relate was skipped");
    let orders = h.index.doc_count("shop.orders");
    assert_eq!(orders as u64 + skipped, 300, "orders indexed: {}", orders);
}

// ── Drops and deletes ──

#[tokio::test]
async fn test_drops_delete_mapped_indexes_only() {
    let h = Harness::new();
    let run = h.start(
        r#"
replay = true

[[mapping]]
namespace = "shop.items"
index = "items-v1"
"#,
    );
    h.source.insert("shop.items", doc(json!({"_id": 1}))).unwrap();
    h.source.insert("shop.users", doc(json!({"_id": 1}))).unwrap();
    h.source.insert("other.items", doc(json!({"_id": 1}))).unwrap();
    wait_for("initial documents", || h.index.total_docs() == 3).await;

    h.source.drop_collection("shop.items");
    wait_for("collection drop", || {
        !h.index.index_names().contains(&"items-v1".to_string())
    })
    .await;
    assert!(h.indexed("shop.users", "1").is_some());
    assert!(h.indexed("other.items", "1").is_some());

    h.source.drop_database("shop");
    wait_for("database drop", || h.indexed("shop.users", "1").is_none()).await;
    assert!(h.indexed("other.items", "1").is_some());
    run.stop().await;
}

#[tokio::test]
async fn test_stateless_delete_of_unindexed_document_is_counted() {
    let h = Harness::new();
    h.source
        .put("shop.items", doc(json!({"_id": 5, "name": "ghost"})))
        .unwrap();
    h.source.delete("shop.items", &DocId::Int(5));
    h.source
        .insert("shop.items", doc(json!({"_id": 6, "name": "lamp"})))
        .unwrap();

    let run = h.start(REPLAY);
    wait_for("item 6", || h.indexed("shop.items", "6").is_some()).await;
    let stats = run.stats.clone();
    let (outcome, reporter) = run.stop().await;

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(reporter.error_count(), 0);
    assert_eq!(stats.snapshot().delete_missed, 1);
    assert!(h.indexed("shop.items", "5").is_none());
}

#[tokio::test]
async fn test_stateful_delete_reuses_stored_destination() {
    let h = Harness::new();
    let run = h.start(
        r#"
replay = true
delete-strategy = 1

[[script]]
namespace = "shop.items"
script = '''
function map(doc, ns, op)
    doc._meta = { index = "items-archive", routing = "r1" }
    return doc
end
'''
"#,
    );
    h.source
        .insert("shop.items", doc(json!({"_id": 7, "name": "lamp"})))
        .unwrap();
    wait_for("routed write", || h.index.get("items-archive", "7").is_some()).await;
    let stored = h.index.get("items-archive", "7").unwrap();
    assert_eq!(stored.routing.as_deref(), Some("r1"));
    assert_eq!(h.state.meta_len(), 1);
    assert!(h.indexed("shop.items", "7").is_none());

    h.source.delete("shop.items", &DocId::Int(7));
    wait_for("routed delete", || h.index.get("items-archive", "7").is_none()).await;
    assert_eq!(h.state.meta_len(), 0);
    assert!(h
        .state
        .take_meta("shop.items", "7")
        .await
        .unwrap()
        .is_none());

    let (_, reporter) = run.stop().await;
    assert_eq!(reporter.error_count(), 0);
}

// ── Plugins ──

/// Holds every document until a release arrives.
struct Gate {
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl DocumentFilter for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn filter(&self, _input: &TransformInput) -> Result<bool> {
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        Ok(true)
    }
}

#[tokio::test]
async fn test_slow_filter_does_not_hold_up_other_streams() {
    let h = Harness::new();
    h.source
        .insert_on("s1", "db.slow", doc(json!({"_id": 1})))
        .unwrap();
    h.source
        .insert_on("s2", "db.fast", doc(json!({"_id": 2})))
        .unwrap();

    let (release, gate) = std::sync::mpsc::channel();
    let mut plugins = PluginRegistry::new();
    plugins
        .register_filter(
            Some("db.slow"),
            Arc::new(Gate {
                release: Mutex::new(gate),
            }),
        )
        .unwrap();
    let run = h.start_with(REPLAY, plugins);

    wait_for("fast stream", || h.indexed("db.fast", "2").is_some()).await;
    assert!(h.indexed("db.slow", "1").is_none());

    release.send(()).unwrap();
    wait_for("slow stream", || h.indexed("db.slow", "1").is_some()).await;
    let (outcome, reporter) = run.stop().await;
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(reporter.error_count(), 0);
}

#[tokio::test]
async fn test_script_filter_and_transformer() {
    let h = Harness::new();
    h.source
        .insert("cms.posts", doc(json!({"_id": 1, "status": "draft", "title": "a"})))
        .unwrap();
    h.source
        .insert("cms.posts", doc(json!({"_id": 2, "status": "live", "title": "b"})))
        .unwrap();

    let run = h.start(
        r#"
replay = true

[[filter]]
namespace = "cms.posts"
script = 'function filter(doc) return doc.status ~= "draft" end'

[[script]]
namespace = "cms.posts"
script = '''
function map(doc)
    doc.title = string.upper(doc.title)
    return doc
end
'''
"#,
    );
    wait_for("live post", || h.indexed("cms.posts", "2").is_some()).await;
    run.stop().await;

    assert!(h.indexed("cms.posts", "1").is_none());
    assert_eq!(h.indexed("cms.posts", "2").unwrap()["title"], json!("B"));
}

#[tokio::test]
async fn test_failing_transformer_drops_event_and_continues() {
    let h = Harness::new();
    h.source
        .insert("cms.posts", doc(json!({"_id": 1, "boom": true})))
        .unwrap();
    h.source.insert("cms.posts", doc(json!({"_id": 2}))).unwrap();

    let run = h.start(
        r#"
replay = true

[[script]]
namespace = "cms.posts"
script = '''
function map(doc)
    if doc.boom then error("bad document") end
    return true
end
'''
"#,
    );
    wait_for("second post", || h.indexed("cms.posts", "2").is_some()).await;
    let (outcome, reporter) = run.stop().await;

    assert_eq!(outcome, Outcome::Stopped);
    assert!(h.indexed("cms.posts", "1").is_none());
    assert_eq!(reporter.error_count(), 1);
    assert!(reporter.failed());
}

// ── Direct reads ──

#[tokio::test]
async fn test_direct_reads_then_exit() {
    let h = Harness::new();
    for i in 0..120 {
        h.source.put("shop.items", doc(json!({"_id": i}))).unwrap();
    }
    h.source.put("shop.users", doc(json!({"_id": "u"}))).unwrap();

    let (recorder, plugins) = recording();
    let run = h.start_with(
        r#"
direct-read-namespaces = ["shop.items", "shop.users"]
disable-change-events = true
exit-after-direct-reads = true
"#,
        plugins,
    );
    let (outcome, reporter) = run.finish().await;

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(reporter.error_count(), 0);
    assert_eq!(h.index.doc_count("shop.items"), 120);
    assert_eq!(h.index.doc_count("shop.users"), 1);
    assert!(recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .all(|(_, source)| *source == EventSource::DirectRead));
}

#[tokio::test]
async fn test_stateful_direct_reads_are_not_repeated() {
    let h = Harness::new();
    h.source.put("shop.items", doc(json!({"_id": 1}))).unwrap();
    let toml = r#"
direct-read-namespaces = ["shop.items"]
direct-read-stateful = true
disable-change-events = true
exit-after-direct-reads = true
"#;
    let (first, plugins) = recording();
    h.start_with(toml, plugins).finish().await;
    assert_eq!(first.ids(), vec!["1".to_string()]);

    let (second, plugins) = recording();
    h.start_with(toml, plugins).finish().await;
    assert!(second.ids().is_empty());
}

// ── Attachments ──

#[tokio::test]
async fn test_attachment_size_limit() {
    let h = Harness::new();
    h.source
        .put_attachment("docs.files", &DocId::Int(1), b"hi!".to_vec());
    h.source
        .put_attachment("docs.files", &DocId::Int(2), vec![0u8; 64]);
    h.source
        .insert("docs.files", doc(json!({"_id": 1, "name": "small.txt"})))
        .unwrap();
    h.source
        .insert("docs.files", doc(json!({"_id": 2, "name": "big.bin"})))
        .unwrap();

    let run = h.start(
        r#"
replay = true
index-files = true
file-namespaces = ["docs.files"]
max-file-size = 16
"#,
    );
    wait_for("both files", || h.index.doc_count("docs.files") == 2).await;
    run.stop().await;

    assert!(h.index.pipeline("attachment").is_some());
    let small = h.index.get("docs.files", "1").unwrap();
    assert_eq!(small.source["file"], json!("aGkh"));
    assert_eq!(small.pipeline.as_deref(), Some("attachment"));
    let big = h.index.get("docs.files", "2").unwrap();
    assert!(!big.source.contains_key("file"));
    assert_eq!(big.source["name"], json!("big.bin"));
}

// ── Checkpoints and clustering ──

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let h = Harness::new();
    h.source.insert("shop.items", doc(json!({"_id": 1}))).unwrap();
    h.source.insert("shop.items", doc(json!({"_id": 2}))).unwrap();

    let toml = "resume = true\nreplay = true\n";
    let (first, plugins) = recording();
    let run = h.start_with(toml, plugins);
    wait_for("first run", || h.index.doc_count("shop.items") == 2).await;
    run.stop().await;
    assert_eq!(first.ids().len(), 2);
    let saved = h.state.load_checkpoint("default").await.unwrap();
    assert!(saved.is_some());

    h.source.insert("shop.items", doc(json!({"_id": 3}))).unwrap();
    let (second, plugins) = recording();
    let run = h.start_with(toml, plugins);
    wait_for("second run", || h.indexed("shop.items", "3").is_some()).await;
    run.stop().await;
    assert_eq!(second.ids(), vec!["3".to_string()]);
}

#[tokio::test]
async fn test_idle_run_writes_no_checkpoint() {
    let h = Harness::new();
    let run = h.start("resume = true\ncheckpoint-interval = 1\n");
    tokio::time::sleep(Duration::from_millis(2500)).await;
    run.stop().await;
    assert_eq!(h.state.checkpoint_writes(), 0);
}

#[tokio::test]
async fn test_standby_takes_over_released_lease() {
    let h = Harness::new();
    let toml = "cluster-name = \"blue\"\nreplay = true\nheartbeat-interval = 1\nlease-ttl = 3\n";

    let active = h.start(toml);
    h.source.insert("shop.items", doc(json!({"_id": 1}))).unwrap();
    wait_for("active instance", || h.indexed("shop.items", "1").is_some()).await;

    let (standby_seen, plugins) = recording();
    let standby = h.start_with(toml, plugins);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(standby_seen.ids().is_empty());

    active.stop().await;
    h.source.insert("shop.items", doc(json!({"_id": 2}))).unwrap();
    wait_for("standby takeover", || h.indexed("shop.items", "2").is_some()).await;
    let (outcome, _) = standby.stop().await;

    assert_eq!(outcome, Outcome::Stopped);
    assert!(standby_seen.ids().contains(&"2".to_string()));
}

//! SQLite source store against a temporary database file.

use std::sync::Arc;
use std::time::Duration;

use docsync::config::Config;
use docsync::context::SyncContext;
use docsync::engine::{Engine, Outcome, Stores};
use docsync::error::ErrorReporter;
use docsync::plugins::PluginRegistry;
use docsync::sqlite_source::SqliteSource;
use docsync_core::models::{DocId, Document, Operation, UpdateDescription};
use docsync_core::store::memory::InMemoryIndex;
use docsync_core::store::{
    FeedPosition, LeaseHolder, ReplicationLog, ScanRange, SourceStore, StateStore, StoredMeta,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

async fn open(tmp: &TempDir) -> SqliteSource {
    let url = format!("sqlite:{}/data/source.sqlite", tmp.path().display());
    let source = SqliteSource::open(&url, "docsync").await.unwrap();
    source.init().await.unwrap();
    source
}

fn holder(id: &str) -> LeaseHolder {
    LeaseHolder {
        name: "docsync".into(),
        instance_id: id.into(),
        pid: 42,
        host: "test".into(),
    }
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    source.init().await.unwrap();
    assert!(tmp.path().join("data/source.sqlite").exists());
}

#[tokio::test]
async fn test_writes_produce_ordered_feed() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;

    let t1 = source
        .insert("shop.items", doc(json!({"_id": 1, "name": "lamp"})))
        .await
        .unwrap();
    let mut desc = UpdateDescription::default();
    desc.updated_fields.insert("name".into(), json!("desk lamp"));
    desc.removed_fields.push("color".into());
    let t2 = source
        .update_fields("shop.items", &DocId::Int(1), desc.clone())
        .await
        .unwrap();
    let t3 = source.delete("shop.items", &DocId::Int(1)).await.unwrap();
    assert!(t1 < t2 && t2 < t3);

    let events = source
        .read("rs0", &FeedPosition::Beginning, 100)
        .await
        .unwrap();
    let ops: Vec<Operation> = events.iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Delete]);
    assert_eq!(events[0].id, DocId::Int(1));
    assert_eq!(events[0].document.as_ref().unwrap()["name"], json!("lamp"));
    assert!(events[1].document.is_none());
    assert_eq!(events[1].update_description.as_ref(), Some(&desc));
    assert_eq!(events[2].timestamp, t3);

    let after_first = events[0].resume_token.clone().unwrap().token;
    let rest = source
        .read("rs0", &FeedPosition::Token(after_first), 100)
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);

    let after_ts = source
        .read("rs0", &FeedPosition::After(t2), 100)
        .await
        .unwrap();
    assert_eq!(after_ts.len(), 1);
    assert_eq!(after_ts[0].operation, Operation::Delete);

    assert_eq!(source.latest_timestamp().await.unwrap(), Some(t3));
    assert_eq!(source.count("shop.items").await.unwrap(), 0);
}

#[tokio::test]
async fn test_streams_are_discovered_from_log() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    assert_eq!(source.streams().await.unwrap(), vec!["rs0".to_string()]);

    source
        .insert_on("shard-a", "db.a", doc(json!({"_id": 1})))
        .await
        .unwrap();
    source
        .insert_on("shard-b", "db.a", doc(json!({"_id": 2})))
        .await
        .unwrap();
    assert_eq!(
        source.streams().await.unwrap(),
        vec!["shard-a".to_string(), "shard-b".to_string()]
    );
    let a = source
        .read("shard-a", &FeedPosition::Beginning, 10)
        .await
        .unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].resume_token.as_ref().unwrap().stream_id, "shard-a");
}

#[tokio::test]
async fn test_scan_pages_and_selectors() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    for i in 0..10 {
        source
            .insert(
                "shop.items",
                doc(json!({"_id": i, "tenant": if i % 2 == 0 { "a" } else { "b" }})),
            )
            .await
            .unwrap();
    }
    let (min, max) = source.key_bounds("shop.items").await.unwrap().unwrap();
    assert_eq!(max - min, 9);

    let first = source
        .scan(
            "shop.items",
            &ScanRange {
                limit: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.len(), 4);
    let next = source
        .scan(
            "shop.items",
            &ScanRange {
                after: Some(first[3].key),
                limit: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(next.len(), 6);

    let tenant_a = source
        .scan(
            "shop.items",
            &ScanRange {
                limit: 100,
                selector: Some(doc(json!({"tenant": "a"}))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(tenant_a.len(), 5);

    let bounded = source
        .scan(
            "shop.items",
            &ScanRange {
                through: Some(min + 2),
                limit: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(bounded.len(), 3);
}

#[tokio::test]
async fn test_find_matches_nested_and_array_fields() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    source
        .insert(
            "shop.orders",
            doc(json!({"_id": "o1", "customer": {"id": 5}, "tags": ["red", "big"]})),
        )
        .await
        .unwrap();
    source
        .insert(
            "shop.orders",
            doc(json!({"_id": "o2", "customer": {"id": 6}, "tags": ["blue"]})),
        )
        .await
        .unwrap();

    let nested = source
        .find("shop.orders", &doc(json!({"customer": {"id": 5}})))
        .await
        .unwrap();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0]["_id"], json!("o1"));

    let dotted = source
        .find("shop.orders", &doc(json!({"customer.id": 6})))
        .await
        .unwrap();
    assert_eq!(dotted[0]["_id"], json!("o2"));

    let tagged = source
        .find("shop.orders", &doc(json!({"tags": "big"})))
        .await
        .unwrap();
    assert_eq!(tagged.len(), 1);

    let by_id = source
        .find_by_id("shop.orders", &DocId::String("o2".into()))
        .await
        .unwrap();
    assert!(by_id.is_some());
}

#[tokio::test]
async fn test_drop_database_removes_only_its_collections() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    source.insert("shop.a", doc(json!({"_id": 1}))).await.unwrap();
    source.insert("shop.b", doc(json!({"_id": 1}))).await.unwrap();
    source.insert("shop_x.a", doc(json!({"_id": 1}))).await.unwrap();

    source.drop_database("shop").await.unwrap();
    assert_eq!(source.namespaces().await.unwrap(), vec!["shop_x.a".to_string()]);

    let last = source
        .read("rs0", &FeedPosition::Beginning, 100)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(last.operation, Operation::DropDatabase);
    assert_eq!(last.namespace, "shop");
}

#[tokio::test]
async fn test_attachments_read_in_chunks() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    let id = DocId::Int(9);
    source
        .put_attachment("docs.files", &id, b"abcdefgh")
        .await
        .unwrap();

    let head = source.read_attachment("docs.files", &id, 0, 3).await.unwrap();
    assert_eq!(head.as_deref(), Some(&b"abc"[..]));
    let tail = source.read_attachment("docs.files", &id, 6, 10).await.unwrap();
    assert_eq!(tail.as_deref(), Some(&b"gh"[..]));
    let missing = source
        .read_attachment("docs.files", &DocId::Int(10), 0, 3)
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_checkpoints_and_tokens_round_trip() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    let ts = source.insert("db.a", doc(json!({"_id": 1}))).await.unwrap();

    assert!(source.load_checkpoint("default").await.unwrap().is_none());
    source.save_checkpoint("default", ts).await.unwrap();
    source.save_checkpoint("default", ts).await.unwrap();
    assert_eq!(source.load_checkpoint("default").await.unwrap(), Some(ts));

    source.save_token("default", "rs0", &json!(7)).await.unwrap();
    source.save_token("default", "rs0", &json!(8)).await.unwrap();
    let tokens = source.load_tokens("default").await.unwrap();
    assert_eq!(tokens.get("rs0"), Some(&json!(8)));
    assert!(source.load_tokens("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lease_is_exclusive_until_expiry() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    let ttl = Duration::from_secs(30);
    let (a, b) = (holder("a"), holder("b"));

    assert!(source.try_acquire_lease("blue", &a, ttl).await.unwrap());
    assert!(!source.try_acquire_lease("blue", &b, ttl).await.unwrap());
    assert!(source.renew_lease("blue", &a, ttl).await.unwrap());
    assert!(!source.renew_lease("blue", &b, ttl).await.unwrap());
    assert_eq!(source.lease("blue").await.unwrap().unwrap().holder, a);

    // a lease that has run out can be taken over
    assert!(source
        .try_acquire_lease("blue", &a, Duration::ZERO)
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(source.try_acquire_lease("blue", &b, ttl).await.unwrap());
    assert!(!source.renew_lease("blue", &a, ttl).await.unwrap());

    source.release_lease("blue", &a).await.unwrap();
    assert!(source.lease("blue").await.unwrap().is_some());
    source.release_lease("blue", &b).await.unwrap();
    assert!(source.lease("blue").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stored_meta_is_taken_once() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    let meta = StoredMeta {
        namespace: "shop.items".into(),
        id: "7".into(),
        index: "items-archive".into(),
        routing: Some("r1".into()),
        parent: None,
        pipeline: None,
    };
    source.save_meta(&meta).await.unwrap();
    assert_eq!(source.take_meta("shop.items", "7").await.unwrap(), Some(meta));
    assert!(source.take_meta("shop.items", "7").await.unwrap().is_none());
}

#[tokio::test]
async fn test_purge_meta_by_database() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    for ns in ["shop.a", "shop.b", "other.a"] {
        source
            .save_meta(&StoredMeta {
                namespace: ns.into(),
                id: "1".into(),
                index: "x".into(),
                routing: None,
                parent: None,
                pipeline: None,
            })
            .await
            .unwrap();
    }
    assert_eq!(source.purge_meta("shop").await.unwrap(), 2);
    assert_eq!(source.purge_meta("other.a").await.unwrap(), 1);
}

#[tokio::test]
async fn test_direct_read_records() {
    let tmp = TempDir::new().unwrap();
    let source = open(&tmp).await;
    source
        .mark_direct_read_complete("default", "shop.b")
        .await
        .unwrap();
    source
        .mark_direct_read_complete("default", "shop.a")
        .await
        .unwrap();
    source
        .mark_direct_read_complete("default", "shop.a")
        .await
        .unwrap();
    assert_eq!(
        source.completed_direct_reads("default").await.unwrap(),
        vec!["shop.a".to_string(), "shop.b".to_string()]
    );
}

#[tokio::test]
async fn test_engine_syncs_from_sqlite() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(open(&tmp).await);
    source
        .insert("shop.items", doc(json!({"_id": 1, "name": "lamp"})))
        .await
        .unwrap();
    source
        .insert("shop.items", doc(json!({"_id": 2, "name": "desk"})))
        .await
        .unwrap();
    source.delete("shop.items", &DocId::Int(2)).await.unwrap();
    source
        .insert("shop.items", doc(json!({"_id": 3, "name": "chair"})))
        .await
        .unwrap();

    let index = Arc::new(InMemoryIndex::new());
    let config = Config::from_toml_str("replay = true\nresume = true\n").unwrap();
    let reporter = ErrorReporter::new(false);
    let ctx = SyncContext::new(config, PluginRegistry::new(), reporter.clone()).unwrap();
    let engine = Engine::new(
        ctx,
        Stores {
            source: source.clone(),
            log: source.clone(),
            state: source.clone(),
            index: index.clone(),
        },
    );
    let shutdown = engine.shutdown_token();
    let run = tokio::spawn(engine.run());

    for _ in 0..200 {
        if index.get("shop.items", "3").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.cancel();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(reporter.error_count(), 0);
    assert_eq!(index.get("shop.items", "1").unwrap().source["name"], json!("lamp"));
    assert!(index.get("shop.items", "2").is_none());
    assert!(index.get("shop.items", "3").is_some());
    assert_eq!(
        source.load_checkpoint("default").await.unwrap(),
        source.latest_timestamp().await.unwrap()
    );
}

//! SQLite-backed source store.
//!
//! One database file plays every role the engine needs from the primary
//! store:
//!
//! | Table | Role |
//! |-------|------|
//! | `documents` | JSON documents keyed by `(namespace, doc_id)`, scanned by `seq` |
//! | `oplog` | the replication log; `stream` distinguishes shards |
//! | `attachments` | binary payloads for the attachment pipeline |
//! | `<admin>_checkpoints`, `_tokens` | resume positions |
//! | `<admin>_cluster` | the cluster lease |
//! | `<admin>_meta` | routing records for stateful deletes |
//! | `<admin>_directreads` | completed stateful direct reads |
//!
//! The write helpers ([`SqliteSource::insert`] and friends) update a document
//! and append its log entry in one transaction, so an application writing
//! through them produces a consistent feed.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_core::models::{
    split_namespace, ChangeEvent, DocId, Document, OpTimestamp, Operation, ResumeToken,
    UpdateDescription,
};
use docsync_core::relation::{flatten_selector, matches_selector};
use docsync_core::store::memory::DEFAULT_STREAM;
use docsync_core::store::{
    FeedPosition, LeaseHolder, LeaseRecord, ReplicationLog, ScanRange, ScannedDoc, SourceStore,
    StateStore, StoredMeta,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::db;
use crate::migrate::{run_migrations, AdminTables};

pub struct SqliteSource {
    pool: SqlitePool,
    tables: AdminTables,
}

impl SqliteSource {
    pub async fn open(url: &str, admin_namespace: &str) -> Result<Self> {
        let tables = AdminTables::new(admin_namespace)?;
        let pool = db::connect(url).await?;
        Ok(Self { pool, tables })
    }

    /// Create the schema if it does not exist yet.
    pub async fn init(&self) -> Result<()> {
        run_migrations(&self.pool, &self.tables).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════

    pub async fn insert(&self, namespace: &str, doc: Document) -> Result<OpTimestamp> {
        self.insert_on(DEFAULT_STREAM, namespace, doc).await
    }

    pub async fn insert_on(
        &self,
        stream: &str,
        namespace: &str,
        doc: Document,
    ) -> Result<OpTimestamp> {
        let id = doc_id(&doc)?;
        let mut tx = self.pool.begin().await?;
        upsert_document(&mut tx, namespace, &id, &doc).await?;
        let ts = append(&mut tx, stream, namespace, Operation::Insert, Some(&id), Some(&doc), None)
            .await?;
        tx.commit().await?;
        Ok(ts)
    }

    /// Replace a document and log the full new version.
    pub async fn replace(&self, namespace: &str, doc: Document) -> Result<OpTimestamp> {
        let id = doc_id(&doc)?;
        let mut tx = self.pool.begin().await?;
        upsert_document(&mut tx, namespace, &id, &doc).await?;
        let ts = append(
            &mut tx,
            DEFAULT_STREAM,
            namespace,
            Operation::Update,
            Some(&id),
            Some(&doc),
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(ts)
    }

    /// Apply a partial update and log only its description.
    pub async fn update_fields(
        &self,
        namespace: &str,
        id: &DocId,
        desc: UpdateDescription,
    ) -> Result<OpTimestamp> {
        let mut tx = self.pool.begin().await?;
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE namespace = ? AND doc_id = ?")
                .bind(namespace)
                .bind(id.to_stable_string())
                .fetch_optional(&mut *tx)
                .await?;
        let body = body.ok_or_else(|| anyhow!("no document {} in {}", id, namespace))?;
        let mut doc: Document = serde_json::from_str(&body)?;
        for (k, v) in &desc.updated_fields {
            doc.insert(k.clone(), v.clone());
        }
        for k in &desc.removed_fields {
            doc.remove(k);
        }
        upsert_document(&mut tx, namespace, id, &doc).await?;
        let ts = append(
            &mut tx,
            DEFAULT_STREAM,
            namespace,
            Operation::Update,
            Some(id),
            None,
            Some(&desc),
        )
        .await?;
        tx.commit().await?;
        Ok(ts)
    }

    pub async fn delete(&self, namespace: &str, id: &DocId) -> Result<OpTimestamp> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE namespace = ? AND doc_id = ?")
            .bind(namespace)
            .bind(id.to_stable_string())
            .execute(&mut *tx)
            .await?;
        let ts = append(
            &mut tx,
            DEFAULT_STREAM,
            namespace,
            Operation::Delete,
            Some(id),
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(ts)
    }

    pub async fn drop_collection(&self, namespace: &str) -> Result<OpTimestamp> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE namespace = ?")
            .bind(namespace)
            .execute(&mut *tx)
            .await?;
        let ts = append(
            &mut tx,
            DEFAULT_STREAM,
            namespace,
            Operation::DropCollection,
            None,
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(ts)
    }

    pub async fn drop_database(&self, database: &str) -> Result<OpTimestamp> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE namespace LIKE ? ESCAPE '\\'")
            .bind(format!("{}.%", escape_like(database)))
            .execute(&mut *tx)
            .await?;
        let ts = append(
            &mut tx,
            DEFAULT_STREAM,
            database,
            Operation::DropDatabase,
            None,
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(ts)
    }

    pub async fn put_attachment(&self, namespace: &str, id: &DocId, data: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO attachments (namespace, doc_id, data) VALUES (?, ?, ?)
             ON CONFLICT(namespace, doc_id) DO UPDATE SET data = excluded.data",
        )
        .bind(namespace)
        .bind(id.to_stable_string())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_page(
        &self,
        namespace: &str,
        after: Option<i64>,
        through: Option<i64>,
        selector: Option<&Document>,
        limit: i64,
    ) -> Result<Vec<(i64, Document)>> {
        let mut sql = String::from("SELECT seq, body FROM documents WHERE namespace = ?");
        let mut args = vec![SqlArg::Text(namespace.to_string())];
        if let Some(after) = after {
            sql.push_str(" AND seq > ?");
            args.push(SqlArg::Int(after));
        }
        if let Some(through) = through {
            sql.push_str(" AND seq <= ?");
            args.push(SqlArg::Int(through));
        }
        if let Some(selector) = selector {
            push_selector(&mut sql, &mut args, selector);
        }
        sql.push_str(" ORDER BY seq LIMIT ?");
        args.push(SqlArg::Int(limit));

        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("scan of {} failed", namespace))?;
        rows.iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                Ok((seq, parse_body(row)?))
            })
            .collect()
    }
}

fn doc_id(doc: &Document) -> Result<DocId> {
    DocId::from_document(doc).ok_or_else(|| anyhow!("document has no usable _id"))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn parse_body(row: &SqliteRow) -> Result<Document> {
    let body: String = row.get("body");
    serde_json::from_str(&body).context("corrupt document body")
}

async fn upsert_document(
    tx: &mut Transaction<'_, Sqlite>,
    namespace: &str,
    id: &DocId,
    doc: &Document,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO documents (namespace, doc_id, id_json, body) VALUES (?, ?, ?, ?)
         ON CONFLICT(namespace, doc_id) DO UPDATE SET body = excluded.body",
    )
    .bind(namespace)
    .bind(id.to_stable_string())
    .bind(id.to_value().to_string())
    .bind(serde_json::to_string(doc)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append a log entry with the next timestamp: the current second, or the
/// last entry's second with the ordinal bumped if the clock has not moved.
async fn append(
    tx: &mut Transaction<'_, Sqlite>,
    stream: &str,
    namespace: &str,
    op: Operation,
    id: Option<&DocId>,
    doc: Option<&Document>,
    desc: Option<&UpdateDescription>,
) -> Result<OpTimestamp> {
    let last: Option<(i64, i64)> =
        sqlx::query_as("SELECT ts_t, ts_i FROM oplog ORDER BY ts_t DESC, ts_i DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await?;
    let now = Utc::now().timestamp();
    let ts = match last {
        Some((t, i)) if t >= now => OpTimestamp::new(t as u32, i as u32 + 1),
        _ => OpTimestamp::new(now as u32, 1),
    };

    sqlx::query(
        "INSERT INTO oplog (ts_t, ts_i, stream, namespace, op, doc_id, document, update_description)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(ts.t as i64)
    .bind(ts.i as i64)
    .bind(stream)
    .bind(namespace)
    .bind(op.as_code())
    .bind(id.map(|id| id.to_value().to_string()))
    .bind(doc.map(serde_json::to_string).transpose()?)
    .bind(desc.map(serde_json::to_string).transpose()?)
    .execute(&mut **tx)
    .await?;
    Ok(ts)
}

// ═══════════════════════════════════════════════════════════════════════
// Selector → SQL
// ═══════════════════════════════════════════════════════════════════════

enum SqlArg {
    Text(String),
    Int(i64),
    Real(f64),
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    args: Vec<SqlArg>,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlArg::Text(s) => query.bind(s),
            SqlArg::Int(i) => query.bind(i),
            SqlArg::Real(f) => query.bind(f),
        };
    }
    query
}

fn json_path(dotted: &str) -> String {
    let mut path = String::from("$");
    for seg in dotted.split('.') {
        path.push_str(&format!(".\"{}\"", seg.replace('"', "\\\"")));
    }
    path
}

/// Push one `json_each` condition per scalar selector entry. `json_each`
/// yields the value itself for scalars and each element for arrays, which
/// gives array fields any-element semantics. Null and structured values are
/// left to [`matches_selector`].
fn push_selector(sql: &mut String, args: &mut Vec<SqlArg>, selector: &Document) {
    for (path, expected) in flatten_selector(selector) {
        let arg = match expected {
            Value::String(s) => SqlArg::Text(s),
            Value::Bool(b) => SqlArg::Int(b as i64),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlArg::Int(i),
                None => SqlArg::Real(n.as_f64().unwrap_or(0.0)),
            },
            _ => continue,
        };
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM json_each(documents.body, ?) AS je WHERE je.value = ?)",
        );
        args.push(SqlArg::Text(json_path(&path)));
        args.push(arg);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SourceStore
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
impl SourceStore for SqliteSource {
    async fn namespaces(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT namespace FROM documents ORDER BY namespace")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn count(&self, namespace: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn key_bounds(&self, namespace: &str) -> Result<Option<(i64, i64)>> {
        let (min, max): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(seq), MAX(seq) FROM documents WHERE namespace = ?")
                .bind(namespace)
                .fetch_one(&self.pool)
                .await?;
        Ok(min.zip(max))
    }

    async fn scan(&self, namespace: &str, range: &ScanRange) -> Result<Vec<ScannedDoc>> {
        let limit = range.limit.max(1);
        let mut out = Vec::new();
        let mut after = range.after;
        // rows the SQL filter keeps but the full selector rejects leave a
        // short page; keep reading until it is full or the range is exhausted
        loop {
            let page = self
                .fetch_page(
                    namespace,
                    after,
                    range.through,
                    range.selector.as_ref(),
                    limit as i64,
                )
                .await?;
            let exhausted = page.len() < limit;
            for (key, document) in page {
                after = Some(key);
                if range
                    .selector
                    .as_ref()
                    .map_or(true, |s| matches_selector(&document, s))
                {
                    out.push(ScannedDoc { key, document });
                    if out.len() == limit {
                        return Ok(out);
                    }
                }
            }
            if exhausted {
                return Ok(out);
            }
        }
    }

    async fn find(&self, namespace: &str, selector: &Document) -> Result<Vec<Document>> {
        let mut sql = String::from("SELECT seq, body FROM documents WHERE namespace = ?");
        let mut args = vec![SqlArg::Text(namespace.to_string())];
        push_selector(&mut sql, &mut args, selector);
        sql.push_str(" ORDER BY seq");
        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query on {} failed", namespace))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = parse_body(row)?;
            if matches_selector(&doc, selector) {
                out.push(doc);
            }
        }
        Ok(out)
    }

    async fn find_by_id(&self, namespace: &str, id: &DocId) -> Result<Option<Document>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE namespace = ? AND doc_id = ?")
                .bind(namespace)
                .bind(id.to_stable_string())
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b).context("corrupt document body"))
            .transpose()
    }

    async fn read_attachment(
        &self,
        namespace: &str,
        id: &DocId,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        let chunk: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT substr(data, ?, ?) FROM attachments WHERE namespace = ? AND doc_id = ?",
        )
        .bind(offset as i64 + 1)
        .bind(len as i64)
        .bind(namespace)
        .bind(id.to_stable_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(chunk)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ReplicationLog
// ═══════════════════════════════════════════════════════════════════════

fn row_to_event(row: &SqliteRow) -> Result<ChangeEvent> {
    let seq: i64 = row.get("seq");
    let stream: String = row.get("stream");
    let namespace: String = row.get("namespace");
    let code: String = row.get("op");
    let operation = Operation::from_code(&code)
        .ok_or_else(|| anyhow!("unknown op code '{}' at seq {}", code, seq))?;

    let id = match row.get::<Option<String>, _>("doc_id") {
        Some(raw) => {
            let value: Value = serde_json::from_str(&raw)?;
            DocId::from_value(&value).ok_or_else(|| anyhow!("bad doc_id at seq {}", seq))?
        }
        None => DocId::String(String::new()),
    };

    let mut event = ChangeEvent::new(namespace, id, operation).with_timestamp(OpTimestamp::new(
        row.get::<i64, _>("ts_t") as u32,
        row.get::<i64, _>("ts_i") as u32,
    ));
    if let Some(raw) = row.get::<Option<String>, _>("document") {
        event.document = Some(serde_json::from_str(&raw)?);
    }
    if let Some(raw) = row.get::<Option<String>, _>("update_description") {
        event.update_description = Some(serde_json::from_str(&raw)?);
    }
    event.resume_token = Some(ResumeToken {
        stream_id: stream,
        token: Value::from(seq),
    });
    Ok(event)
}

#[async_trait]
impl ReplicationLog for SqliteSource {
    async fn streams(&self) -> Result<Vec<String>> {
        let mut streams: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT stream FROM oplog ORDER BY stream")
                .fetch_all(&self.pool)
                .await?;
        if streams.is_empty() {
            streams.push(DEFAULT_STREAM.to_string());
        }
        Ok(streams)
    }

    async fn read(
        &self,
        stream: &str,
        from: &FeedPosition,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        const COLUMNS: &str = "seq, ts_t, ts_i, stream, namespace, op, doc_id, document, update_description";
        let rows = match from {
            FeedPosition::Beginning => {
                sqlx::query(&format!(
                    "SELECT {} FROM oplog WHERE stream = ? ORDER BY seq LIMIT ?",
                    COLUMNS
                ))
                .bind(stream)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            FeedPosition::After(ts) => {
                sqlx::query(&format!(
                    "SELECT {} FROM oplog WHERE stream = ?
                     AND (ts_t > ? OR (ts_t = ? AND ts_i > ?))
                     ORDER BY seq LIMIT ?",
                    COLUMNS
                ))
                .bind(stream)
                .bind(ts.t as i64)
                .bind(ts.t as i64)
                .bind(ts.i as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            FeedPosition::Token(token) => {
                let Some(after) = token.as_i64() else {
                    bail!("resume token for stream {} is not a sequence number", stream);
                };
                sqlx::query(&format!(
                    "SELECT {} FROM oplog WHERE stream = ? AND seq > ? ORDER BY seq LIMIT ?",
                    COLUMNS
                ))
                .bind(stream)
                .bind(after)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_event).collect()
    }

    async fn latest_timestamp(&self) -> Result<Option<OpTimestamp>> {
        let last: Option<(i64, i64)> =
            sqlx::query_as("SELECT ts_t, ts_i FROM oplog ORDER BY ts_t DESC, ts_i DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.map(|(t, i)| OpTimestamp::new(t as u32, i as u32)))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// StateStore
// ═══════════════════════════════════════════════════════════════════════

fn expiry_millis(ttl: Duration) -> i64 {
    Utc::now().timestamp_millis() + ttl.as_millis() as i64
}

#[async_trait]
impl StateStore for SqliteSource {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<OpTimestamp>> {
        let row: Option<(i64, i64)> = sqlx::query_as(&format!(
            r#"SELECT ts_t, ts_i FROM "{}" WHERE name = ?"#,
            self.tables.checkpoints
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(t, i)| OpTimestamp::new(t as u32, i as u32)))
    }

    async fn save_checkpoint(&self, name: &str, ts: OpTimestamp) -> Result<()> {
        sqlx::query(&format!(
            r#"INSERT INTO "{}" (name, ts_t, ts_i, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 ts_t = excluded.ts_t, ts_i = excluded.ts_i, updated_at = excluded.updated_at"#,
            self.tables.checkpoints
        ))
        .bind(name)
        .bind(ts.t as i64)
        .bind(ts.i as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_tokens(&self, name: &str) -> Result<HashMap<String, Value>> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            r#"SELECT stream, token FROM "{}" WHERE name = ?"#,
            self.tables.tokens
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(stream, token)| Ok((stream, serde_json::from_str(&token)?)))
            .collect()
    }

    async fn save_token(&self, name: &str, stream: &str, token: &Value) -> Result<()> {
        sqlx::query(&format!(
            r#"INSERT INTO "{}" (name, stream, token, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(name, stream) DO UPDATE SET
                 token = excluded.token, updated_at = excluded.updated_at"#,
            self.tables.tokens
        ))
        .bind(name)
        .bind(stream)
        .bind(token.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        cluster: &str,
        holder: &LeaseHolder,
        ttl: Duration,
    ) -> Result<bool> {
        let table = &self.tables.cluster;
        let result = sqlx::query(&format!(
            r#"INSERT INTO "{t}" (cluster, holder_name, instance_id, pid, host, expires_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(cluster) DO UPDATE SET
                 holder_name = excluded.holder_name,
                 instance_id = excluded.instance_id,
                 pid = excluded.pid,
                 host = excluded.host,
                 expires_at = excluded.expires_at
               WHERE "{t}".expires_at <= ? OR "{t}".instance_id = excluded.instance_id"#,
            t = table
        ))
        .bind(cluster)
        .bind(&holder.name)
        .bind(&holder.instance_id)
        .bind(holder.pid as i64)
        .bind(&holder.host)
        .bind(expiry_millis(ttl))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("lease write failed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(
        &self,
        cluster: &str,
        holder: &LeaseHolder,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"UPDATE "{}" SET expires_at = ? WHERE cluster = ? AND instance_id = ?"#,
            self.tables.cluster
        ))
        .bind(expiry_millis(ttl))
        .bind(cluster)
        .bind(&holder.instance_id)
        .execute(&self.pool)
        .await
        .context("lease renewal failed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, cluster: &str, holder: &LeaseHolder) -> Result<()> {
        sqlx::query(&format!(
            r#"DELETE FROM "{}" WHERE cluster = ? AND instance_id = ?"#,
            self.tables.cluster
        ))
        .bind(cluster)
        .bind(&holder.instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease(&self, cluster: &str) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(&format!(
            r#"SELECT holder_name, instance_id, pid, host, expires_at FROM "{}" WHERE cluster = ?"#,
            self.tables.cluster
        ))
        .bind(cluster)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let millis: i64 = row.get("expires_at");
        let expires_at = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| anyhow!("invalid lease expiry {}", millis))?;
        Ok(Some(LeaseRecord {
            cluster: cluster.to_string(),
            holder: LeaseHolder {
                name: row.get("holder_name"),
                instance_id: row.get("instance_id"),
                pid: row.get::<i64, _>("pid") as u32,
                host: row.get("host"),
            },
            expires_at,
        }))
    }

    async fn save_meta(&self, meta: &StoredMeta) -> Result<()> {
        sqlx::query(&format!(
            r#"INSERT OR REPLACE INTO "{}" (namespace, doc_id, db, idx, routing, parent, pipeline)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            self.tables.meta
        ))
        .bind(&meta.namespace)
        .bind(&meta.id)
        .bind(split_namespace(&meta.namespace).0)
        .bind(&meta.index)
        .bind(&meta.routing)
        .bind(&meta.parent)
        .bind(&meta.pipeline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_meta(&self, namespace: &str, id: &str) -> Result<Option<StoredMeta>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            r#"SELECT idx, routing, parent, pipeline FROM "{}" WHERE namespace = ? AND doc_id = ?"#,
            self.tables.meta
        ))
        .bind(namespace)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        sqlx::query(&format!(
            r#"DELETE FROM "{}" WHERE namespace = ? AND doc_id = ?"#,
            self.tables.meta
        ))
        .bind(namespace)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(StoredMeta {
            namespace: namespace.to_string(),
            id: id.to_string(),
            index: row.get("idx"),
            routing: row.get("routing"),
            parent: row.get("parent"),
            pipeline: row.get("pipeline"),
        }))
    }

    async fn purge_meta(&self, namespace: &str) -> Result<u64> {
        let column = if split_namespace(namespace).1.is_empty() {
            "db"
        } else {
            "namespace"
        };
        let result = sqlx::query(&format!(
            r#"DELETE FROM "{}" WHERE {} = ?"#,
            self.tables.meta, column
        ))
        .bind(namespace)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn completed_direct_reads(&self, name: &str) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(&format!(
            r#"SELECT namespace FROM "{}" WHERE name = ? ORDER BY namespace"#,
            self.tables.directreads
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn mark_direct_read_complete(&self, name: &str, namespace: &str) -> Result<()> {
        sqlx::query(&format!(
            r#"INSERT OR REPLACE INTO "{}" (name, namespace, completed_at) VALUES (?, ?, ?)"#,
            self.tables.directreads
        ))
        .bind(name)
        .bind(namespace)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

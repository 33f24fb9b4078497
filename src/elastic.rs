//! Elasticsearch/OpenSearch client for the [`IndexBackend`] trait.
//!
//! Talks plain REST over `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | bulk | `POST /_bulk` (NDJSON: index, update, delete) |
//! | delete indexes | `DELETE /<idx1>,<idx2>` |
//! | find by id | `POST /<pattern>/_search` with a term query on `_id` |
//! | put pipeline | `PUT /_ingest/pipeline/<name>` |
//! | version probe | `GET /` |
//!
//! Requests rotate across `elasticsearch-urls`. With `elasticsearch-retry`
//! enabled, HTTP 429, 5xx and network errors are retried with exponential
//! backoff (1s, 2s, 4s, ... capped at 32s); other failures return at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use docsync_core::store::{
    BulkAction, BulkItemResult, BulkResponse, IndexBackend, SearchHit,
};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{redact_url, Config};

const MAX_RETRIES: u32 = 5;

pub struct ElasticClient {
    client: reqwest::Client,
    urls: Vec<String>,
    next: AtomicUsize,
    user: Option<String>,
    password: Option<String>,
    retry: bool,
}

impl ElasticClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(config.elasticsearch_max_conns.max(1));
        if config.elasticsearch_client_timeout > 0 {
            builder = builder.timeout(Duration::from_secs(config.elasticsearch_client_timeout));
        }
        if let Some(pem) = &config.elasticsearch_pem_file {
            let bytes = std::fs::read(pem)
                .with_context(|| format!("Failed to read PEM file: {}", pem.display()))?;
            let cert = reqwest::Certificate::from_pem(&bytes)
                .with_context(|| format!("Invalid PEM file: {}", pem.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        if !config.elasticsearch_validate_pem_file {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let urls: Vec<String> = config
            .elasticsearch_urls
            .iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .collect();
        if urls.is_empty() {
            bail!("elasticsearch-urls must not be empty");
        }

        Ok(Self {
            client: builder.build()?,
            urls,
            next: AtomicUsize::new(0),
            user: config.elasticsearch_user.clone(),
            password: config.elasticsearch_password.clone(),
            retry: config.elasticsearch_retry,
        })
    }

    /// `version.number` from the cluster root endpoint.
    pub async fn version(&self) -> Result<String> {
        let resp = self.send(Method::GET, "/", None).await?;
        let body: Value = read_json(resp).await?;
        body.pointer("/version/number")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cluster info has no version.number"))
    }

    fn base_url(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        &self.urls[i]
    }

    /// Send one request, retrying transient failures when enabled.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<(String, &'static str)>,
    ) -> Result<reqwest::Response> {
        let attempts = if self.retry { MAX_RETRIES } else { 0 };
        let mut last_err = None;

        for attempt in 0..=attempts {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let base = self.base_url();
            let url = format!("{}{}", base, path);
            let mut req = self.client.request(method.clone(), &url);
            if let Some(user) = &self.user {
                req = req.basic_auth(user, self.password.as_deref());
            }
            if let Some((payload, content_type)) = &body {
                req = req
                    .header("Content-Type", *content_type)
                    .body(payload.clone());
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let text = resp.text().await.unwrap_or_default();
                        warn!(url = %redact_url(&url), %status, attempt, "index request failed");
                        last_err = Some(anyhow!("{} {} returned {}: {}", method, path, status, text));
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    warn!(url = %redact_url(&url), attempt, "index request error: {}", e);
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} {} failed after retries", method, path)))
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("index backend returned {}: {}", status, text);
    }
    Ok(resp.json().await?)
}

// ═══════════════════════════════════════════════════════════════════════
// Bulk encoding
// ═══════════════════════════════════════════════════════════════════════

/// Encode actions as a `_bulk` NDJSON body.
pub fn encode_bulk(actions: &[BulkAction]) -> Result<String> {
    let mut body = String::new();
    for action in actions {
        let mut header = serde_json::Map::new();
        header.insert(action.kind().to_string(), serde_json::to_value(action.meta())?);
        body.push_str(&serde_json::to_string(&header)?);
        body.push('\n');
        match action {
            BulkAction::Index { doc, .. } => {
                body.push_str(&serde_json::to_string(doc)?);
                body.push('\n');
            }
            BulkAction::Update { doc, upsert, .. } => {
                body.push_str(&serde_json::to_string(
                    &json!({ "doc": doc, "doc_as_upsert": upsert }),
                )?);
                body.push('\n');
            }
            BulkAction::Delete { .. } => {}
        }
    }
    Ok(body)
}

/// Parse the per-item results of a `_bulk` response.
pub fn parse_bulk_response(body: &Value) -> Result<BulkResponse> {
    let items = body
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("bulk response has no items array"))?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some((action, result)) = item.as_object().and_then(|o| o.iter().next()) else {
            bail!("malformed bulk item: {}", item);
        };
        out.push(BulkItemResult {
            action: action.clone(),
            index: result["_index"].as_str().unwrap_or_default().to_string(),
            id: result["_id"].as_str().unwrap_or_default().to_string(),
            status: result["status"].as_u64().unwrap_or(0) as u16,
            error: result.get("error").map(describe_error),
        });
    }
    Ok(BulkResponse { items: out })
}

fn describe_error(err: &Value) -> String {
    match (err.get("type"), err.get("reason")) {
        (Some(Value::String(t)), Some(Value::String(r))) => format!("{}: {}", t, r),
        _ => err.to_string(),
    }
}

fn parse_hits(body: &Value, with_source: bool) -> Vec<SearchHit> {
    body.pointer("/hits/hits")
        .and_then(|h| h.as_array())
        .map(|hits| {
            hits.iter()
                .map(|h| SearchHit {
                    index: h["_index"].as_str().unwrap_or_default().to_string(),
                    id: h["_id"].as_str().unwrap_or_default().to_string(),
                    routing: h["_routing"].as_str().map(str::to_string),
                    parent: h["_parent"].as_str().map(str::to_string),
                    source: if with_source {
                        h.get("_source").and_then(|s| s.as_object()).cloned()
                    } else {
                        None
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════
// IndexBackend
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
impl IndexBackend for ElasticClient {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkResponse> {
        if actions.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = encode_bulk(actions)?;
        debug!(actions = actions.len(), bytes = body.len(), "sending bulk request");
        let resp = self
            .send(Method::POST, "/_bulk", Some((body, "application/x-ndjson")))
            .await?;
        let json = read_json(resp).await?;
        parse_bulk_response(&json)
    }

    async fn delete_indexes(&self, patterns: &[String]) -> Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }
        let path = format!(
            "/{}?ignore_unavailable=true&allow_no_indices=true",
            patterns.join(",")
        );
        let resp = self.send(Method::DELETE, &path, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        read_json(resp).await.map(|_| ())
    }

    async fn find_by_id(
        &self,
        pattern: &str,
        id: &str,
        with_source: bool,
    ) -> Result<Vec<SearchHit>> {
        let query = json!({
            "query": { "term": { "_id": id } },
            "size": 10,
            "_source": with_source,
        });
        let path = format!("/{}/_search?ignore_unavailable=true", pattern);
        let resp = self
            .send(Method::POST, &path, Some((query.to_string(), "application/json")))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let json = read_json(resp).await?;
        Ok(parse_hits(&json, with_source))
    }

    async fn put_pipeline(&self, name: &str, body: &Value) -> Result<()> {
        let path = format!("/_ingest/pipeline/{}", name);
        let resp = self
            .send(Method::PUT, &path, Some((body.to_string(), "application/json")))
            .await?;
        read_json(resp)
            .await
            .with_context(|| format!("Failed to put ingest pipeline '{}'", name))
            .map(|_| ())
    }
}

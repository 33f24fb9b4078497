//! Attachment pipeline and the hand-off into indexing.
//!
//! Documents of a file namespace travel through a pool of downloaders
//! before indexing. Each downloader reads the document's attachment from the
//! source in chunks, base64-encodes it into the `file` field and forwards the
//! event to the indexer, where the `attachment` ingest pipeline extracts the
//! content.
//!
//! The downloader queue applies back-pressure: a full queue blocks the
//! sender instead of dropping the event.

use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use docsync_core::models::ChangeEvent;
use docsync_core::store::SourceStore;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::indexer::{IndexerHandle, FILE_FIELD};

const CHUNK_SIZE: usize = 256 * 1024;

/// Where routed events go after relate: the attachment queue for file
/// namespaces, the indexer otherwise. Also feeds post-processors.
#[derive(Clone)]
pub struct EventSink {
    ctx: Arc<SyncContext>,
    indexer: IndexerHandle,
    files: Option<mpsc::Sender<ChangeEvent>>,
    post: Option<mpsc::Sender<ChangeEvent>>,
}

impl EventSink {
    pub fn new(
        ctx: Arc<SyncContext>,
        indexer: IndexerHandle,
        files: Option<mpsc::Sender<ChangeEvent>>,
        post: Option<mpsc::Sender<ChangeEvent>>,
    ) -> Self {
        Self {
            ctx,
            indexer,
            files,
            post,
        }
    }

    /// Queue a data or delete event for indexing.
    pub async fn index(&self, event: ChangeEvent) -> bool {
        if let Some(files) = &self.files {
            if self.ctx.has_file_content(&event) {
                return files.send(event).await.is_ok();
            }
        }
        self.indexer.send(event).await
    }

    /// Hand a copy of the event to the post-processors, if any.
    pub async fn post(&self, event: &ChangeEvent) {
        if let Some(post) = &self.post {
            let _ = post.send(event.detached()).await;
        }
    }

    pub fn indexer(&self) -> &IndexerHandle {
        &self.indexer
    }
}

/// Spawn `file-downloaders` workers sharing one queue.
pub fn spawn_downloaders(
    ctx: Arc<SyncContext>,
    source: Arc<dyn SourceStore>,
    indexer: IndexerHandle,
) -> (mpsc::Sender<ChangeEvent>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(ctx.config.channel_size);
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..ctx.config.file_downloaders.max(1))
        .map(|_| {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let source = source.clone();
            let indexer = indexer.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(mut event) = next else { break };
                    if let Err(e) = add_file_content(&ctx, source.as_ref(), &mut event).await {
                        ctx.reporter.report(SyncError::Attachment {
                            namespace: event.namespace.clone(),
                            id: event.id.to_string(),
                            message: format!("{:#}", e),
                        });
                    }
                    if !indexer.send(event).await {
                        break;
                    }
                }
            })
        })
        .collect();
    (tx, handles)
}

/// Read the event's attachment into its `file` field. Payloads over
/// `max-file-size` leave the field out.
pub async fn add_file_content(
    ctx: &SyncContext,
    source: &dyn SourceStore,
    event: &mut ChangeEvent,
) -> Result<()> {
    let Some(doc) = event.document.as_mut() else {
        return Ok(());
    };
    doc.remove(FILE_FIELD);

    let max = ctx.config.max_file_size;
    let mut data = Vec::new();
    loop {
        let chunk = source
            .read_attachment(&event.namespace, &event.id, data.len() as u64, CHUNK_SIZE)
            .await?;
        let Some(chunk) = chunk else {
            if data.is_empty() {
                anyhow::bail!("no attachment stored");
            }
            break;
        };
        let done = chunk.len() < CHUNK_SIZE;
        data.extend_from_slice(&chunk);
        if max > 0 && data.len() as u64 > max {
            warn!(
                namespace = %event.namespace,
                id = %event.id,
                max_file_size = max,
                "file size exceeds max file size, content omitted"
            );
            return Ok(());
        }
        if done {
            break;
        }
    }

    debug!(namespace = %event.namespace, id = %event.id, bytes = data.len(), "attachment loaded");
    doc.insert(FILE_FIELD.to_string(), Value::String(STANDARD.encode(&data)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorReporter;
    use crate::plugins::PluginRegistry;
    use docsync_core::models::DocId;
    use docsync_core::store::memory::InMemorySource;
    use serde_json::json;

    fn ctx(max: u64) -> Arc<SyncContext> {
        let mut config = Config::default();
        config.index_files = true;
        config.file_namespaces = vec!["db.files".into()];
        config.max_file_size = max;
        SyncContext::new(config, PluginRegistry::new(), ErrorReporter::new(false)).unwrap()
    }

    fn event() -> ChangeEvent {
        let doc = json!({"_id": 1, "name": "a.txt"}).as_object().unwrap().clone();
        ChangeEvent::insert("db.files", DocId::Int(1), doc)
    }

    #[tokio::test]
    async fn test_content_is_base64_encoded() {
        let source = InMemorySource::new();
        source.put_attachment("db.files", &DocId::Int(1), b"hello".to_vec());
        let mut e = event();
        add_file_content(&ctx(0), &source, &mut e).await.unwrap();
        assert_eq!(e.document.unwrap().get(FILE_FIELD), Some(&json!("aGVsbG8=")));
    }

    #[tokio::test]
    async fn test_oversized_content_is_omitted() {
        let source = InMemorySource::new();
        source.put_attachment("db.files", &DocId::Int(1), vec![7u8; 64]);
        let mut e = event();
        add_file_content(&ctx(10), &source, &mut e).await.unwrap();
        let doc = e.document.unwrap();
        assert!(!doc.contains_key(FILE_FIELD));
        assert_eq!(doc.get("name"), Some(&json!("a.txt")));
    }

    #[tokio::test]
    async fn test_missing_attachment_is_an_error() {
        let source = InMemorySource::new();
        let mut e = event();
        assert!(add_file_content(&ctx(0), &source, &mut e).await.is_err());
    }
}

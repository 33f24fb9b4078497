//! Error taxonomy and the single error-reporting path.
//!
//! Library plumbing returns `anyhow::Result`. When an error crosses a stage
//! boundary it is classified into a [`SyncError`] and handed to the
//! [`ErrorReporter`], which logs it, marks the process as failed (exit status
//! 1), and under `fail-fast` trips the fatal token the event loop watches.
//!
//! | Kind | Policy |
//! |------|--------|
//! | `Source` | reader reconnects from its last good position |
//! | `Transform` | the event is dropped, pipeline continues |
//! | `BatchWrite` | logged per item; fatal under `fail-fast` |
//! | `Config` | fatal at startup |
//! | `Coordinator` | process stays disabled, retried on next heartbeat |
//! | `Index`, `Attachment`, `Relate` | logged, event dropped |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source read error: {0}")]
    Source(String),

    #[error("transform error in {namespace}: {message}")]
    Transform { namespace: String, message: String },

    #[error("bulk write error: {0}")]
    BatchWrite(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("attachment error for {namespace} ({id}): {message}")]
    Attachment {
        namespace: String,
        id: String,
        message: String,
    },

    #[error("relate error: {0}")]
    Relate(String),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Source(_) => "source",
            SyncError::Transform { .. } => "transform",
            SyncError::BatchWrite(_) => "batch_write",
            SyncError::Config(_) => "config",
            SyncError::Coordinator(_) => "coordinator",
            SyncError::Index(_) => "index",
            SyncError::Attachment { .. } => "attachment",
            SyncError::Relate(_) => "relate",
        }
    }

    pub fn source(err: anyhow::Error) -> Self {
        SyncError::Source(format!("{:#}", err))
    }

    pub fn transform(namespace: &str, err: anyhow::Error) -> Self {
        SyncError::Transform {
            namespace: namespace.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn index(err: anyhow::Error) -> Self {
        SyncError::Index(format!("{:#}", err))
    }

    pub fn relate(err: anyhow::Error) -> Self {
        SyncError::Relate(format!("{:#}", err))
    }

    pub fn coordinator(err: anyhow::Error) -> Self {
        SyncError::Coordinator(format!("{:#}", err))
    }

    fn trips_fail_fast(&self) -> bool {
        matches!(self, SyncError::BatchWrite(_))
    }
}

struct ReporterInner {
    fail_fast: bool,
    failed: AtomicBool,
    count: AtomicU64,
    fatal: CancellationToken,
}

/// Cloneable handle shared by every stage.
#[derive(Clone)]
pub struct ErrorReporter {
    inner: Arc<ReporterInner>,
}

impl ErrorReporter {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                fail_fast,
                failed: AtomicBool::new(false),
                count: AtomicU64::new(0),
                fatal: CancellationToken::new(),
            }),
        }
    }

    pub fn report(&self, err: SyncError) {
        error!(kind = err.kind(), "{}", err);
        self.inner.failed.store(true, Ordering::SeqCst);
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        if self.inner.fail_fast && err.trips_fail_fast() {
            error!("fail-fast is set, stopping after {}", err.kind());
            self.inner.fatal.cancel();
        }
    }

    /// Whether any error was reported; decides the exit status.
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Cancelled when a fail-fast error is reported.
    pub fn fatal(&self) -> CancellationToken {
        self.inner.fatal.clone()
    }
}

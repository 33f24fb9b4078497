//! Checkpoints and cluster membership.
//!
//! ```text
//!              acquire ok
//!  Disabled ───────────────▶ Enabled ──┐ renew ok
//!     ▲                         │  ◀───┘
//!     │    feed paused          │ renew lost / failed
//!     └──────────── Pausing ◀───┘
//! ```
//!
//! Without a `cluster-name` the process is always `Enabled`. With one, only
//! the holder of the cluster lease is; the others keep their feed paused and
//! retry on every heartbeat. A failed lease write never counts as holding
//! the lease.
//!
//! The coordinator is the only writer of checkpoints and stream tokens. It
//! records the position of every applied live-feed event and persists it
//! only when something new was applied since the last save.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docsync_core::models::{ChangeEvent, OpTimestamp};
use docsync_core::store::{LeaseHolder, StateStore};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ResumeStrategy};
use crate::error::{ErrorReporter, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Disabled,
    Enabled,
    Pausing,
}

pub struct Coordinator {
    state: Arc<dyn StateStore>,
    reporter: ErrorReporter,
    resume: bool,
    resume_name: String,
    strategy: ResumeStrategy,
    cluster: Option<String>,
    holder: LeaseHolder,
    ttl: Duration,
    status: ProcessState,
    last_ts: OpTimestamp,
    saved_ts: OpTimestamp,
    tokens: HashMap<String, Value>,
    dirty_streams: BTreeSet<String>,
}

impl Coordinator {
    pub fn new(config: &Config, state: Arc<dyn StateStore>, reporter: ErrorReporter) -> Self {
        let cluster = config.cluster_name.clone().filter(|c| !c.is_empty());
        let status = if cluster.is_some() {
            ProcessState::Disabled
        } else {
            ProcessState::Enabled
        };
        Self {
            state,
            reporter,
            resume: config.resume,
            resume_name: config.resume_name.clone(),
            strategy: config.resume_strategy(),
            cluster,
            holder: LeaseHolder {
                name: config.resume_name.clone(),
                instance_id: Uuid::new_v4().to_string(),
                pid: std::process::id(),
                host: hostname(),
            },
            ttl: Duration::from_secs(config.lease_ttl.max(1)),
            status,
            last_ts: OpTimestamp::default(),
            saved_ts: OpTimestamp::default(),
            tokens: HashMap::new(),
            dirty_streams: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> ProcessState {
        self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ProcessState::Enabled
    }

    pub fn holder(&self) -> &LeaseHolder {
        &self.holder
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn resume_name(&self) -> &str {
        &self.resume_name
    }

    /// Timestamp of the newest applied live-feed event.
    pub fn last_timestamp(&self) -> OpTimestamp {
        self.last_ts
    }

    /// Try to take the cluster lease at startup.
    pub async fn start(&mut self) -> ProcessState {
        let Some(cluster) = self.cluster.clone() else {
            return self.status;
        };
        if self.acquire(&cluster).await {
            info!(cluster = %cluster, "Joined cluster as the active process");
        } else {
            info!(cluster = %cluster, "Pausing work for cluster; another process holds the lease");
        }
        self.status
    }

    /// Renew or contend for the lease. Returns the new state when it
    /// changed.
    pub async fn heartbeat(&mut self) -> Option<ProcessState> {
        let cluster = self.cluster.clone()?;
        let before = self.status;
        match self.status {
            ProcessState::Enabled => {
                match self.state.renew_lease(&cluster, &self.holder, self.ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(cluster = %cluster, "Lease lost, pausing work");
                        self.status = ProcessState::Pausing;
                    }
                    Err(e) => {
                        self.reporter.report(SyncError::coordinator(
                            e.context("unable to renew cluster lease"),
                        ));
                        self.status = ProcessState::Pausing;
                    }
                }
            }
            ProcessState::Disabled => {
                if self.acquire(&cluster).await {
                    info!(cluster = %cluster, "Lease acquired, resuming work");
                }
            }
            // still waiting for the caller to finish pausing
            ProcessState::Pausing => {}
        }
        (self.status != before).then_some(self.status)
    }

    /// The feed is paused and in-flight work flushed.
    pub fn paused(&mut self) {
        if self.status == ProcessState::Pausing {
            self.status = ProcessState::Disabled;
        }
    }

    async fn acquire(&mut self, cluster: &str) -> bool {
        match self
            .state
            .try_acquire_lease(cluster, &self.holder, self.ttl)
            .await
        {
            Ok(true) => {
                self.status = ProcessState::Enabled;
                true
            }
            Ok(false) => {
                self.status = ProcessState::Disabled;
                false
            }
            Err(e) => {
                self.reporter.report(SyncError::coordinator(
                    e.context("unable to acquire cluster lease"),
                ));
                self.status = ProcessState::Disabled;
                false
            }
        }
    }

    /// Give up the lease on shutdown.
    pub async fn release(&mut self) {
        let Some(cluster) = self.cluster.clone() else {
            return;
        };
        if self.status != ProcessState::Enabled {
            return;
        }
        if let Err(e) = self.state.release_lease(&cluster, &self.holder).await {
            warn!(cluster = %cluster, error = %e, "unable to release cluster lease");
        }
        self.status = ProcessState::Disabled;
    }

    /// Note the position of an applied event. Only live-feed events move
    /// the checkpoint.
    pub fn record(&mut self, event: &ChangeEvent) {
        if !event.is_live() {
            return;
        }
        if event.timestamp > self.last_ts {
            self.last_ts = event.timestamp;
        }
        if let Some(token) = &event.resume_token {
            self.tokens
                .insert(token.stream_id.clone(), token.token.clone());
            self.dirty_streams.insert(token.stream_id.clone());
        }
    }

    /// Whether anything was applied since the last save.
    pub fn has_pending(&self) -> bool {
        if !self.resume {
            return false;
        }
        match self.strategy {
            ResumeStrategy::Timestamp => self.last_ts > self.saved_ts,
            ResumeStrategy::Token => !self.dirty_streams.is_empty(),
        }
    }

    /// Persist the current position if it moved. Returns whether a write
    /// happened.
    pub async fn save(&mut self) -> Result<bool> {
        if !self.has_pending() {
            return Ok(false);
        }
        match self.strategy {
            ResumeStrategy::Timestamp => {
                self.state
                    .save_checkpoint(&self.resume_name, self.last_ts)
                    .await
                    .context("Failed to save checkpoint")?;
                self.saved_ts = self.last_ts;
                debug!(ts = %self.last_ts, "checkpoint saved");
            }
            ResumeStrategy::Token => {
                let streams = std::mem::take(&mut self.dirty_streams);
                for stream in streams {
                    if let Some(token) = self.tokens.get(&stream) {
                        self.state
                            .save_token(&self.resume_name, &stream, token)
                            .await
                            .with_context(|| format!("Failed to save token for {}", stream))?;
                    }
                }
                debug!(streams = self.tokens.len(), "stream tokens saved");
            }
        }
        Ok(true)
    }

    /// Store an explicit checkpoint, e.g. the log head once direct reads
    /// are done.
    pub async fn save_timestamp(&mut self, ts: OpTimestamp) -> Result<()> {
        self.state
            .save_checkpoint(&self.resume_name, ts)
            .await
            .context("Failed to save checkpoint")?;
        if ts > self.last_ts {
            self.last_ts = ts;
        }
        self.saved_ts = self.last_ts;
        info!(ts = %ts, "checkpoint saved after direct reads");
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::models::{DocId, ResumeToken};
    use docsync_core::store::memory::InMemoryState;

    fn config(cluster: Option<&str>) -> Config {
        Config {
            resume: true,
            cluster_name: cluster.map(String::from),
            ..Config::default()
        }
    }

    fn live(t: u32) -> ChangeEvent {
        let mut e = ChangeEvent::delete("db.col", DocId::Int(1)).with_timestamp(OpTimestamp::new(t, 0));
        e.resume_token = Some(ResumeToken {
            stream_id: "rs0".into(),
            token: Value::from(t),
        });
        e
    }

    #[tokio::test]
    async fn test_saves_only_when_moved() {
        let state = Arc::new(InMemoryState::new());
        let mut c = Coordinator::new(&config(None), state.clone(), ErrorReporter::new(false));
        assert!(c.is_enabled());

        assert!(!c.save().await.unwrap());
        c.record(&live(10));
        assert!(c.save().await.unwrap());
        assert!(!c.save().await.unwrap());
        assert_eq!(state.checkpoint_writes(), 1);
        assert_eq!(
            state.load_checkpoint("default").await.unwrap(),
            Some(OpTimestamp::new(10, 0))
        );
    }

    #[tokio::test]
    async fn test_direct_reads_do_not_move_checkpoint() {
        let state = Arc::new(InMemoryState::new());
        let mut c = Coordinator::new(&config(None), state, ErrorReporter::new(false));
        c.record(&live(10).with_source(docsync_core::models::EventSource::DirectRead));
        assert!(!c.has_pending());
    }

    #[tokio::test]
    async fn test_token_strategy_saves_tokens() {
        let state = Arc::new(InMemoryState::new());
        let mut cfg = config(None);
        cfg.resume_strategy = 1;
        let mut c = Coordinator::new(&cfg, state.clone(), ErrorReporter::new(false));
        c.record(&live(3));
        assert!(c.save().await.unwrap());
        let tokens = state.load_tokens("default").await.unwrap();
        assert_eq!(tokens.get("rs0"), Some(&Value::from(3)));
        assert_eq!(state.checkpoint_writes(), 0);
    }

    #[tokio::test]
    async fn test_failed_lease_write_stays_disabled() {
        let state = Arc::new(InMemoryState::new());
        state.fail_lease_writes(true);
        let reporter = ErrorReporter::new(false);
        let mut c = Coordinator::new(&config(Some("c1")), state, reporter.clone());
        assert_eq!(c.start().await, ProcessState::Disabled);
        assert!(reporter.failed());
    }
}

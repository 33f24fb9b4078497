//! # docsync
//!
//! A change-data-capture engine that keeps a search index in sync with a
//! document store.
//!
//! docsync tails the store's replication log (and optionally scans whole
//! namespaces once), runs every change through filters, transformers and
//! relation expansion, and writes the result to Elasticsearch/OpenSearch as
//! batched bulk requests. Progress is checkpointed so a restart resumes where
//! the last run stopped, and a cluster lease lets several instances share one
//! job with a single active writer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │  Live feed  │──▶│             │──▶│  Attachment │──▶│   Indexer   │
//! │ (oplog)     │   │ Event loop  │   │  downloader │   │ workers +   │
//! └─────────────┘   │ filter,     │   └─────────────┘   │ bulk batch  │
//! ┌─────────────┐   │ relate,     │                     └──────┬──────┘
//! │ Direct read │──▶│ checkpoint  │──▶ relate workers ──┐      │
//! │ (scan)      │   └──────┬──────┘          ▲          │      ▼
//! └─────────────┘          │                 └──────────┘ ┌──────────┐
//!                          ▼                              │  Search  │
//!                   ┌─────────────┐                       │  index   │
//!                   │ State store │                       └──────────┘
//!                   │ checkpoint, │
//!                   │ lease       │
//!                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docsync init                  # create source and admin tables
//! docsync check-config          # print the effective configuration
//! docsync run                   # sync until SIGINT/SIGTERM
//! docsync status                # show the saved resume state
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`context`] | Immutable per-process context |
//! | [`engine`] | Event loop, routing and shutdown |
//! | [`live`] | Replication log tailing |
//! | [`direct`] | One-time namespace scans |
//! | [`relate`] | Relation expansion |
//! | [`indexer`] | Worker partitioning and action building |
//! | [`bulk`] | Bulk request batching |
//! | [`attachment`] | Attachment download pipeline |
//! | [`postprocess`] | Post-processor pool |
//! | [`coordinator`] | Checkpoints and the cluster lease |
//! | [`plugins`] | Transformer, filter and pipeline traits |
//! | [`script`] | Lua plugin implementations |
//! | [`elastic`] | Search index client |
//! | [`sqlite_source`] | SQLite source, log and state store |
//! | [`server`] | Operational HTTP endpoints |

pub mod attachment;
pub mod bulk;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod direct;
pub mod elastic;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod live;
pub mod logging;
pub mod lua_runtime;
pub mod migrate;
pub mod plugins;
pub mod postprocess;
pub mod relate;
pub mod run;
pub mod script;
pub mod server;
pub mod sqlite_source;
pub mod stats;
pub mod status;
pub mod transform;

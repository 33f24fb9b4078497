//! # docsync core
//!
//! Runtime-free building blocks for the docsync change-data-capture engine:
//! the change event model, indexing metadata, relation helpers, the filter
//! chain, and the storage traits with in-memory implementations.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The engine in
//! the `docsync` crate wires these pieces into worker pools and talks to the
//! concrete SQLite source and Elasticsearch backends.

pub mod filter;
pub mod meta;
pub mod models;
pub mod relation;
pub mod store;

use anyhow::{bail, Result};
use sqlx::SqlitePool;

/// Names of the bookkeeping tables for one admin namespace.
#[derive(Debug, Clone)]
pub struct AdminTables {
    pub checkpoints: String,
    pub tokens: String,
    pub cluster: String,
    pub meta: String,
    pub directreads: String,
}

impl AdminTables {
    pub fn new(admin: &str) -> Result<Self> {
        if admin.is_empty() || !admin.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!(
                "admin-namespace '{}' must contain only letters, digits and '_'",
                admin
            );
        }
        Ok(Self {
            checkpoints: format!("{}_checkpoints", admin),
            tokens: format!("{}_tokens", admin),
            cluster: format!("{}_cluster", admin),
            meta: format!("{}_meta", admin),
            directreads: format!("{}_directreads", admin),
        })
    }
}

/// Create the source and admin schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool, tables: &AdminTables) -> Result<()> {
    // Source documents; `seq` is the scan key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            id_json TEXT NOT NULL,
            body TEXT NOT NULL,
            UNIQUE(namespace, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Replication log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oplog (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_t INTEGER NOT NULL,
            ts_i INTEGER NOT NULL,
            stream TEXT NOT NULL DEFAULT 'rs0',
            namespace TEXT NOT NULL,
            op TEXT NOT NULL,
            doc_id TEXT,
            document TEXT,
            update_description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            namespace TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (namespace, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{}" (
            name TEXT PRIMARY KEY,
            ts_t INTEGER NOT NULL,
            ts_i INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        tables.checkpoints
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{}" (
            name TEXT NOT NULL,
            stream TEXT NOT NULL,
            token TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (name, stream)
        )
        "#,
        tables.tokens
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{}" (
            cluster TEXT PRIMARY KEY,
            holder_name TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            pid INTEGER NOT NULL,
            host TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
        tables.cluster
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{}" (
            namespace TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            db TEXT NOT NULL,
            idx TEXT NOT NULL,
            routing TEXT,
            parent TEXT,
            pipeline TEXT,
            PRIMARY KEY (namespace, doc_id)
        )
        "#,
        tables.meta
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{}" (
            name TEXT NOT NULL,
            namespace TEXT NOT NULL,
            completed_at INTEGER NOT NULL,
            PRIMARY KEY (name, namespace)
        )
        "#,
        tables.directreads
    ))
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_oplog_stream ON oplog(stream, seq)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_oplog_ts ON oplog(ts_t, ts_i)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_namespace ON documents(namespace, seq)")
        .execute(pool)
        .await?;

    Ok(())
}

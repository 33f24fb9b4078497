//! Resume state overview.
//!
//! Prints what a restart would pick up: the checkpoint and stream tokens for
//! the resume name, the cluster lease holder, completed direct reads, and
//! the size of the replication log. Used by `docsync status`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use docsync_core::store::{LeaseRecord, StateStore};

use crate::config::{redact_url, Config};
use crate::sqlite_source::SqliteSource;

/// Everything `docsync status` reports.
#[derive(Debug)]
pub struct ResumeStatus {
    pub resume_name: String,
    pub checkpoint: Option<String>,
    pub tokens: Vec<(String, String)>,
    pub lease: Option<LeaseRecord>,
    pub direct_reads: Vec<String>,
    pub log_entries: i64,
    pub documents: i64,
}

/// Collect the status from any state store plus the SQLite counts.
pub async fn collect(config: &Config, source: &SqliteSource) -> Result<ResumeStatus> {
    let name = &config.resume_name;
    let checkpoint = source.load_checkpoint(name).await?.map(|ts| {
        if ts.is_zero() {
            ts.to_string()
        } else {
            format!("{} ({})", ts, ts.datetime().format("%Y-%m-%d %H:%M:%S UTC"))
        }
    });
    let mut tokens: Vec<(String, String)> = source
        .load_tokens(name)
        .await?
        .into_iter()
        .map(|(stream, token)| (stream, token.to_string()))
        .collect();
    tokens.sort();

    let lease = match &config.cluster_name {
        Some(cluster) => source.lease(cluster).await?,
        None => None,
    };

    let log_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oplog")
        .fetch_one(source.pool())
        .await?;
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(source.pool())
        .await?;

    Ok(ResumeStatus {
        resume_name: name.clone(),
        checkpoint,
        tokens,
        lease,
        direct_reads: source.completed_direct_reads(name).await?,
        log_entries,
        documents,
    })
}

/// Run the status command: open the source store and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let source = SqliteSource::open(&config.source_url, &config.admin_namespace).await?;
    source.init().await?;
    let status = collect(config, &source).await?;
    source.close().await;

    println!("docsync — Resume Status");
    println!("=======================");
    println!();
    println!("  Source:      {}", redact_url(&config.source_url));
    println!("  Resume name: {}", status.resume_name);
    println!("  Documents:   {}", status.documents);
    println!("  Log entries: {}", status.log_entries);
    println!();
    println!(
        "  Checkpoint:  {}",
        status.checkpoint.as_deref().unwrap_or("none")
    );

    if !status.tokens.is_empty() {
        println!();
        println!("  Stream tokens:");
        println!("  {:<24} {}", "STREAM", "TOKEN");
        println!("  {}", "-".repeat(48));
        for (stream, token) in &status.tokens {
            println!("  {:<24} {}", stream, token);
        }
    }

    if let Some(cluster) = &config.cluster_name {
        println!();
        match &status.lease {
            Some(lease) => {
                println!("  Cluster:     {}", cluster);
                println!(
                    "  Held by:     {} (pid {} on {})",
                    lease.holder.name, lease.holder.pid, lease.holder.host
                );
                println!("  Expires:     {}", format_expiry(lease.expires_at));
            }
            None => println!("  Cluster:     {} (no lease held)", cluster),
        }
    }

    if !status.direct_reads.is_empty() {
        println!();
        println!("  Completed direct reads:");
        for ns in &status.direct_reads {
            println!("    {}", ns);
        }
    }
    println!();
    Ok(())
}

/// Format a lease expiry relative to now (e.g. "in 12s", "expired 3m ago").
fn format_expiry(at: DateTime<Utc>) -> String {
    let delta = (at - Utc::now()).num_seconds();
    if delta >= 0 {
        format!("in {}", format_secs(delta))
    } else {
        format!("expired {} ago", format_secs(-delta))
    }
}

fn format_secs(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(5), "5s");
        assert_eq!(format_secs(125), "2m");
        assert_eq!(format_secs(7300), "2h");
    }

    #[test]
    fn test_format_expiry_past() {
        let s = format_expiry(Utc::now() - chrono::Duration::seconds(120));
        assert!(s.starts_with("expired"));
    }
}

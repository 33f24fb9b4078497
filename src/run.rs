//! `docsync run`: assemble the engine from configuration and run it until a
//! signal arrives.
//!
//! Embedders that register native plugins call [`run_with_plugins`] with
//! their own [`PluginRegistry`]; config-declared scripts are added to it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{redact_url, Config};
use crate::context::SyncContext;
use crate::elastic::ElasticClient;
use crate::engine::{Engine, Outcome, Stores};
use crate::error::ErrorReporter;
use crate::logging;
use crate::plugins::PluginRegistry;
use crate::script::register_scripts;
use crate::sqlite_source::SqliteSource;

/// Run with config-declared plugins only. Returns whether the run was
/// clean (no error reported).
pub async fn run(config: Config) -> Result<bool> {
    run_with_plugins(config, PluginRegistry::new()).await
}

pub async fn run_with_plugins(config: Config, mut plugins: PluginRegistry) -> Result<bool> {
    logging::init(config.verbose, config.json_logs());
    register_scripts(&mut plugins, &config)?;

    let source = Arc::new(SqliteSource::open(&config.source_url, &config.admin_namespace).await?);
    source.init().await?;
    info!(source = %redact_url(&config.source_url), "source store ready");

    let index = Arc::new(ElasticClient::from_config(&config)?);
    let version = index
        .version()
        .await
        .context("Unable to reach the search index")?;
    info!(version = %version, "connected to search index");

    let reporter = ErrorReporter::new(config.fail_fast);
    let ctx = SyncContext::new(config, plugins, reporter.clone())?;
    let engine = Engine::new(
        ctx,
        Stores {
            source: source.clone(),
            log: source.clone(),
            state: source.clone(),
            index,
        },
    );
    spawn_signal_handler(engine.shutdown_token());

    let outcome = engine.run().await?;
    source.close().await;
    Ok(outcome == Outcome::Stopped && !reporter.failed())
}

/// First signal requests a graceful shutdown, a second one exits at once.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if wait_for_signal().await.is_err() {
            return;
        }
        info!("shutdown requested, draining");
        shutdown.cancel();
        if wait_for_signal().await.is_ok() {
            warn!("second signal, exiting immediately");
            std::process::exit(1);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "unable to listen for shutdown signals");
        return Err(e.into());
    }
    Ok(())
}

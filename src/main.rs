//! # docsync CLI
//!
//! The `docsync` binary runs the sync engine and a few maintenance commands
//! around its source and state stores.
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync run` | Sync changes into the search index until stopped |
//! | `docsync init` | Create the source and admin tables |
//! | `docsync check-config` | Validate the config and print it with secrets masked |
//! | `docsync status` | Show checkpoints, stream tokens and the cluster lease |
//!
//! Exit status is 1 when the command fails or the run reported errors.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use docsync::config::{self, Config};
use docsync::sqlite_source::SqliteSource;

/// docsync CLI: keep a search index in sync with a document store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docsync",
    about = "docsync: keep a search index in sync with a document store",
    version,
    long_about = "docsync tails the source store's replication log, optionally scans whole \
    namespaces once, transforms and relates changed documents, and writes them to \
    Elasticsearch/OpenSearch with batched bulk requests."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docsync.toml`. Environment variables
    /// (`DOCSYNC_SOURCE_URL`, `DOCSYNC_ELASTICSEARCH_URLS`, ...) override it.
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine.
    ///
    /// Reads changes until SIGINT/SIGTERM (or until direct reads finish
    /// with `exit-after-direct-reads`), then drains and saves a final
    /// checkpoint. A second signal exits immediately.
    Run,

    /// Create the source store schema and the admin tables.
    ///
    /// Idempotent; running it repeatedly is safe.
    Init,

    /// Validate the configuration and print it.
    ///
    /// Passwords and URL credentials are masked.
    CheckConfig,

    /// Show the saved resume state.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run => return docsync::run::run(cfg).await,
        Commands::Init => {
            let source = SqliteSource::open(&cfg.source_url, &cfg.admin_namespace).await?;
            source.init().await?;
            source.close().await;
            println!("Source store initialized successfully.");
        }
        Commands::CheckConfig => print_config(&cfg)?,
        Commands::Status => docsync::status::run_status(&cfg).await?,
    }
    Ok(true)
}

fn print_config(cfg: &Config) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(&cfg.redacted())?;
    println!("# configuration is valid");
    print!("{}", rendered);
    Ok(())
}

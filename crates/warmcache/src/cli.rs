//! Exposes the command line application.
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use warmcache_service::config::Config;
use warmcache_service::engine::MemoryEngine;
use warmcache_service::metrics;
use warmcache_service::snapshot::{
    RefreshCoordinator, SnapshotStore, ensure_fresh_and_load, is_stale,
};
use warmcache_service::trigger::RemoteTrigger;

use crate::cleanup;
use crate::healthcheck;
use crate::logging;
use crate::server;

/// Warmcache commands.
#[derive(Subcommand)]
enum Command {
    /// Run the refresher's web server.
    Run,

    /// Load the snapshot, asking the refresher for a new one first if it is stale.
    Load,

    /// Regenerate a stale snapshot in this process.
    Refresh,

    /// Show the state of the snapshot.
    Status,

    /// Remove staging files left behind by crashed writers.
    Cleanup {
        /// Only log what would be removed.
        #[arg(long)]
        dry_run: bool,

        /// Also remove a leftover lock marker.
        ///
        /// Only use this when no writer is running.
        #[arg(long)]
        release_lock: bool,
    },

    /// Check the health of a running refresher.
    Healthcheck {
        /// Address of the refresher, defaults to the configured `bind` address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "warmcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Load => load(&config)?,
        Command::Refresh => refresh(&config)?,
        Command::Status => status(&config)?,
        Command::Cleanup {
            dry_run,
            release_lock,
        } => {
            let report = cleanup::cleanup(&config, dry_run, release_lock)
                .context("failed to clean up snapshot leftovers")?;
            println!("staging files: {}", report.staging_files);
            if report.released_lock {
                println!("released lock");
            }
        }
        Command::Healthcheck { addr, timeout } => {
            healthcheck::healthcheck(&config, addr, timeout)?
        }
    }

    Ok(())
}

fn load(config: &Config) -> Result<()> {
    let trigger = RemoteTrigger::from_config(config).context("invalid refresher configuration")?;
    let store = SnapshotStore::new(&config.usercache_dump);
    let engine = MemoryEngine::new();

    let entries = block_on(ensure_fresh_and_load(
        &store,
        &config.thresholds(),
        &trigger,
        &engine,
    ))?
    .context("failed to load the snapshot")?;

    println!("loaded {entries} entries");
    Ok(())
}

fn refresh(config: &Config) -> Result<()> {
    let coordinator = RefreshCoordinator::from_config(config);
    // this process has nothing cached but whatever the current snapshot holds
    let engine = Arc::new(MemoryEngine::new());
    match coordinator.store().load(engine.as_ref()) {
        Ok(_) | Err(warmcache_service::snapshot::SnapshotError::NotFound) => {}
        Err(err) => return Err(err).context("failed to read the current snapshot"),
    }

    let outcome = block_on(coordinator.refresh(engine))??;
    println!("{outcome}");
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = SnapshotStore::new(&config.usercache_dump);
    let metadata = store.metadata().context("failed to stat the snapshot")?;

    let mut rows = BTreeMap::new();
    rows.insert("path", store.path().display().to_string());
    rows.insert("exists", metadata.exists.to_string());
    if metadata.exists {
        let age = Duration::from_secs(metadata.age.as_secs());
        rows.insert("age", humantime::format_duration(age).to_string());
        rows.insert("size", metadata.size.to_string());
    }
    rows.insert("stale", is_stale(&metadata, &config.thresholds()).to_string());
    rows.insert("locked", store.is_locked()?.to_string());

    for (key, value) in rows {
        println!("{key}: {value}");
    }
    Ok(())
}

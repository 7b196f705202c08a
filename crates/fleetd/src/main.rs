//! fleetd — the fleetset daemon.
//!
//! Single binary that assembles the fleetset pieces:
//! - State store (redb)
//! - Machine-set controller (watch, work queue, reconcile workers)
//! - Manifest loading for MachineSet definitions
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetset/fleetd.toml --manifests /etc/fleetset/sets
//! fleetd apply workers.toml --data-dir /var/lib/fleetset
//! fleetd get --namespace default
//! fleetd config --config /etc/fleetset/fleetd.toml
//! ```
//!
//! The store file is locked by whichever process opens it, so `apply` and
//! `get` are meant for a stopped daemon; a running daemon picks up sets
//! from `--manifests` at startup.

mod config;
mod manifests;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetset_controller::Controller;
use fleetset_state::StateStore;

use crate::config::{DEFAULT_DATA_DIR, DEFAULT_LOG_FILTER, DaemonConfig, STORE_FILE};

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetset machine-set daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Path to fleetd.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides `[store] path`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of reconcile workers (overrides `[controller] workers`).
        #[arg(long)]
        workers: Option<usize>,

        /// Directory of MachineSet manifests to apply before starting.
        #[arg(long)]
        manifests: Option<PathBuf>,
    },

    /// Create or update a MachineSet from a manifest file.
    Apply {
        /// Manifest file (.toml or .json).
        file: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },

    /// Print MachineSets and their status as JSON.
    Get {
        /// Only list sets in this namespace.
        #[arg(long)]
        namespace: Option<String>,

        /// Data directory for persistent state.
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Path to fleetd.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            workers,
            manifests,
        } => {
            let mut config = DaemonConfig::load(config.as_deref())?;
            if let Some(data_dir) = data_dir {
                config = config.with_data_dir(&data_dir);
            }
            if let Some(workers) = workers {
                config.controller.workers = workers;
            }
            init_tracing(config.log_filter(), config.logging.json);
            run(config, manifests).await
        }
        Command::Apply { file, data_dir } => {
            init_tracing(DEFAULT_LOG_FILTER, false);
            let store = open_store(&data_dir)?;
            let set = manifests::apply(&store, manifests::load(&file)?)?;
            info!(set = %set.metadata.key(), generation = set.metadata.generation, "machine set applied");
            Ok(())
        }
        Command::Get {
            namespace,
            data_dir,
        } => {
            init_tracing(DEFAULT_LOG_FILTER, false);
            let store = open_store(&data_dir)?;
            let sets = store.list_machine_sets(namespace.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&sets)?);
            Ok(())
        }
        Command::Config { config } => {
            let config = DaemonConfig::load(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(directives: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(data_dir: &std::path::Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(STORE_FILE);
    let store = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

async fn run(config: DaemonConfig, manifest_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!("fleetd starting");

    // ── State store ────────────────────────────────────────────
    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");

    // Subscribe before applying manifests so their events reach the controller.
    let events = store.subscribe();

    if let Some(dir) = manifest_dir {
        for set in manifests::load_dir(&dir)? {
            let stored = manifests::apply(&store, set)?;
            info!(set = %stored.metadata.key(), "manifest applied");
        }
    }

    // ── Controller ─────────────────────────────────────────────
    let controller = Controller::new(Arc::new(store), events, config.controller.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));
    info!(workers = config.controller.workers, "controller started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    controller_handle.await?;
    info!("fleetd stopped");
    Ok(())
}

pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::api::{self, ServeSettings};
use crate::engine::OperationRegistry;
use crate::ledger::RunLedger;
use crate::lifecycle::{self, LifecycleDeps, LifecycleSettings};
use crate::probe::docker::DockerRuntime;
use crate::probe::{self as presence_probe, ClusterRuntime, InMemoryRuntime};
use crate::storage::memory_store::MemoryStore;

pub use config::DynschedConfig;

const DEFAULT_LEDGER: &str = "data/runs.db";
const DEFAULT_STORE: &str = "data/schedules.json";
const DEFAULT_RUNTIME: &str = "http://127.0.0.1:2375";

#[derive(Parser)]
#[command(
    name = "dynsched",
    version,
    about = "Durable operation scheduler for dynamic services"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a YAML config file (default: auto-detect dynsched.yaml in cwd)
    #[arg(long, global = true, env = "DYNSCHED_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the ledger, store and cluster runtime live.
#[derive(Args, Debug, Clone, Default)]
pub struct BackendArgs {
    /// Run ledger: SQLite url (sqlite::memory:) or database file path
    #[arg(long, env = "DYNSCHED_LEDGER")]
    ledger: Option<String>,

    /// Schedule store: memory, redis://..., or a JSON file path
    #[arg(long, env = "DYNSCHED_STORE")]
    store: Option<String>,

    /// Cluster runtime: memory, or the Docker Engine API url
    #[arg(long, env = "DYNSCHED_RUNTIME")]
    runtime: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,

        /// Concurrent step handlers (default: DYNSCHED_WORKER_SLOTS or CPU count)
        #[arg(long)]
        worker_slots: Option<usize>,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// List runs in the ledger
    Runs {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Remove a run from the ledger
    RemoveRun {
        /// Run ID
        run_id: String,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// List registered operations
    Operations,

    /// Show the presence of a node's services
    Presence {
        /// Node ID
        node_id: String,

        #[command(flatten)]
        backend: BackendArgs,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = DynschedConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_body,
            worker_slots,
            backend,
        } => {
            let settings = ServeSettings {
                host: host
                    .or(config.host.clone())
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                port: port.or(config.port).unwrap_or(3000),
                max_body: max_body.or(config.max_body).unwrap_or(1_048_576),
                store: resolve_store(&backend, &config),
                ledger: resolve_ledger(&backend, &config),
                runtime: resolve_runtime(&backend, &config),
                worker_slots: worker_slots.or(config.worker_slots),
                lifecycle: lifecycle_settings(&config),
            };
            api::serve(settings).await
        }
        Commands::Runs { format, backend } => {
            cmd_runs(&resolve_ledger(&backend, &config), &format).await
        }
        Commands::RemoveRun { run_id, backend } => {
            cmd_remove_run(&resolve_ledger(&backend, &config), &run_id).await
        }
        Commands::Operations => cmd_operations().await,
        Commands::Presence { node_id, backend } => {
            cmd_presence(&resolve_runtime(&backend, &config), &node_id).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn resolve_ledger(backend: &BackendArgs, config: &DynschedConfig) -> String {
    backend
        .ledger
        .clone()
        .or(config.ledger.clone())
        .unwrap_or_else(|| DEFAULT_LEDGER.to_string())
}

fn resolve_store(backend: &BackendArgs, config: &DynschedConfig) -> String {
    backend
        .store
        .clone()
        .or(config.store.clone())
        .unwrap_or_else(|| DEFAULT_STORE.to_string())
}

fn resolve_runtime(backend: &BackendArgs, config: &DynschedConfig) -> String {
    backend
        .runtime
        .clone()
        .or(config.runtime.clone())
        .unwrap_or_else(|| DEFAULT_RUNTIME.to_string())
}

/// Lifecycle settings from the config file, defaults for anything missing.
pub fn lifecycle_settings(config: &DynschedConfig) -> LifecycleSettings {
    let defaults = LifecycleSettings::default();
    let cfg = &config.lifecycle;
    LifecycleSettings {
        proxy_image: cfg.proxy_image.clone().unwrap_or(defaults.proxy_image),
        presence_retries: cfg.presence_retries.unwrap_or(defaults.presence_retries),
        presence_wait: cfg
            .presence_wait_s
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.presence_wait),
        monitor_interval: cfg
            .monitor_interval_s
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.monitor_interval),
        group_timeout: cfg
            .group_timeout_s
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.group_timeout),
    }
}

async fn open_ledger(location: &str) -> Result<RunLedger> {
    let ledger = if location.starts_with("sqlite:") {
        RunLedger::connect(location).await
    } else {
        RunLedger::from_path(location).await
    };
    ledger.with_context(|| format!("Failed to open run ledger: {}", location))
}

async fn cmd_runs(ledger: &str, format: &str) -> Result<()> {
    let ledger = open_ledger(ledger).await?;
    let runs = ledger.get_all_runs().await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    // Table format
    println!(
        "{:<38} {:<38} {:<6} {:<10} {:<7} {:<20}",
        "RUN ID", "NODE ID", "FLOW", "REVERTING", "MANUAL", "CREATED"
    );
    println!("{}", "-".repeat(124));

    for run in &runs {
        println!(
            "{:<38} {:<38} {:<6} {:<10} {:<7} {:<20}",
            run.run_id,
            run.node_id,
            run.workflow_name,
            run.is_reverting,
            run.waiting_manual_intervention,
            run.created.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_remove_run(ledger: &str, run_id: &str) -> Result<()> {
    let ledger = open_ledger(ledger).await?;
    if ledger.get_run(run_id).await?.is_none() {
        anyhow::bail!("Run '{}' not found", run_id);
    }
    ledger.remove_run(run_id).await?;
    println!("Removed run {}", run_id);
    Ok(())
}

async fn cmd_operations() -> Result<()> {
    let deps = LifecycleDeps {
        ledger: Arc::new(RunLedger::in_memory().await?),
        runtime: Arc::new(InMemoryRuntime::new()),
        kv: Arc::new(MemoryStore::new()),
        settings: LifecycleSettings::default(),
    };
    let mut registry = OperationRegistry::new();
    lifecycle::register_operations(&mut registry, &deps)?;

    println!("{:<36} GROUPS", "OPERATION");
    println!("{}", "-".repeat(72));

    let operations = registry.list();
    for (name, op) in &operations {
        let groups: Vec<String> = op
            .step_groups()
            .iter()
            .enumerate()
            .map(|(i, g)| {
                let steps: Vec<&str> = g.steps().iter().map(|s| s.name()).collect();
                format!("{}[{}]", g.name(i), steps.join(","))
            })
            .collect();
        println!("{:<36} {}", name, groups.join(" -> "));
    }

    println!("\nTotal: {} operation(s)", operations.len());
    Ok(())
}

async fn cmd_presence(runtime: &str, node_id: &str) -> Result<()> {
    let runtime: Arc<dyn ClusterRuntime> = if runtime == "memory" {
        Arc::new(InMemoryRuntime::new())
    } else {
        Arc::new(DockerRuntime::new(runtime, Duration::from_secs(30))?)
    };
    let presence = presence_probe::get_services_presence(runtime.as_ref(), node_id).await?;
    println!("{}", serde_json::to_string_pretty(&presence)?);
    Ok(())
}

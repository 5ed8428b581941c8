use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tickgate::background_jobs::{jobs::HttpTaskBody, JobRegistry, JobScheduler};
use tickgate::config::{AppConfig, CliConfig, FileConfig};
use tickgate::scheduler_store::SqliteSchedulerStore;
use tickgate::server::{metrics, run_server, ServerState};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the scheduler database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Its values override the CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3020)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9120)]
    pub metrics_port: u16,
}

fn build_registry(config: &AppConfig) -> Result<JobRegistry> {
    let mut registry = JobRegistry::new();
    for job in &config.jobs {
        let name = job.descriptor.name();
        let Some(endpoint) = job.endpoint.clone() else {
            warn!("Job {} has no endpoint configured, not registering it", name);
            continue;
        };
        if !job.descriptor.is_enabled() {
            info!("Job {} is disabled", name);
            continue;
        }
        let body = HttpTaskBody::new(endpoint, job.timeout)
            .with_context(|| format!("Failed to create task body for job {}", name))?;
        registry.register(job.descriptor.clone(), Arc::new(body))?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        port: cli_args.port,
        metrics_port: cli_args.metrics_port,
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let store = Arc::new(SqliteSchedulerStore::new(
        app_config.scheduler_db_path(),
        app_config.scheduler.lock_ttl,
        app_config.scheduler.store_busy_timeout,
    )?);

    let registry = build_registry(&app_config)?;
    info!(
        "Registered {} job(s), dispatch mode {:?}",
        registry.len(),
        app_config.scheduler.dispatch
    );

    let scheduler = JobScheduler::new(
        registry,
        store.clone(),
        store.clone(),
        app_config.scheduler.dispatch,
    )
    .with_history(store, app_config.scheduler.history_retention);

    let state = ServerState::new(Arc::new(scheduler));

    info!("Ready to serve at port {}!", app_config.port);
    info!("Metrics available at port {}!", app_config.metrics_port);
    run_server(state, app_config.port, app_config.metrics_port).await
}

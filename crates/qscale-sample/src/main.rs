//! qscale-sample — a small axum app wired up with the qscale agent.
//!
//! Records request queue time from `X-Request-Start`, exposes an in-memory
//! job backend whose queues can be edited over HTTP, and reports both to the
//! autoscaling API configured through `QSCALE_URL` or a config file.
//!
//! # Usage
//!
//! ```text
//! QSCALE_URL=http://localhost:3000/api/<token> qscale-sample serve --port 8080
//! qscale-sample config --config qscale.toml
//! ```

mod app;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use qscale_core::{AdapterRegistry, Config};
use qscale_metrics::{BackendKind, InMemoryBackend, JobMetricsCollector, MetricsStore, WebMetricsCollector};
use qscale_reporter::Reporter;

use crate::app::AppState;

/// Framework version reported by the web and job adapters.
const FRAMEWORK_VERSION: &str = "axum-0.8";

#[derive(Parser)]
#[command(name = "qscale-sample", about = "Sample app reporting queue metrics to qscale")]
struct Cli {
    /// TOML config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the sample app with metrics reporting.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Job backend the in-memory queues pretend to be.
        #[arg(long, default_value = "sidekiq", value_parser = parse_backend)]
        backend: BackendKind,

        /// Queues created at startup.
        #[arg(long, value_delimiter = ',', default_value = "default,mailers")]
        queues: Vec<String>,
    },
    /// Print the effective configuration as reported to the API.
    Config,
}

fn parse_backend(name: &str) -> Result<BackendKind, String> {
    BackendKind::ALL
        .into_iter()
        .find(|kind| kind.config_key() == name)
        .ok_or_else(|| {
            let known: Vec<_> = BackendKind::ALL.iter().map(|k| k.config_key()).collect();
            format!("unknown backend {name:?}, expected one of {}", known.join(", "))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(load_config(cli.config.as_deref())?);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_directives())),
        )
        .init();

    match cli.command {
        Command::Serve {
            port,
            backend,
            queues,
        } => serve(config, port, backend, queues).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&*config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).map_err(|e| match path {
        Some(path) => anyhow::anyhow!("failed to load config from {}: {e}", path.display()),
        None => anyhow::anyhow!("invalid configuration: {e}"),
    })
}

async fn serve(
    config: Arc<Config>,
    port: u16,
    kind: BackendKind,
    queues: Vec<String>,
) -> anyhow::Result<()> {
    info!("qscale sample app starting");

    // ── Agent ──────────────────────────────────────────────────

    let store = Arc::new(MetricsStore::for_interval(config.report_interval()));
    let registry = Arc::new(AdapterRegistry::new());

    registry.register(WebMetricsCollector::adapter(FRAMEWORK_VERSION));
    let web = Arc::new(WebMetricsCollector::new(config.clone(), store.clone()));

    let backend = Arc::new(InMemoryBackend::new());
    for queue in &queues {
        backend.set_queue(queue, 0, Duration::ZERO);
    }
    let jobs = JobMetricsCollector::new(kind, backend.clone(), config.clone(), store.clone());
    if !registry.register_if_enabled(jobs.into_adapter(FRAMEWORK_VERSION)) {
        info!(backend = kind.display_name(), "job adapter disabled");
    }

    let reporter = match Reporter::from_config(config.clone(), store, registry.clone()) {
        Ok(reporter) => {
            let reporter = Arc::new(reporter);
            reporter.start()?;
            Some(reporter)
        }
        Err(e) => {
            warn!(error = %e, "serving without metrics reporting");
            None
        }
    };

    // ── HTTP server ────────────────────────────────────────────

    let router = app::build_router(AppState { web, backend });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, adapters = registry.len(), "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await?;

    if let Some(reporter) = reporter {
        reporter.stop().await;
    }

    info!("qscale sample app stopped");
    Ok(())
}

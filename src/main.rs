//! deployd: declarative container deployments with a self-healing reconcile loop
//!
//! Serves the deployment API and runs the reconcile loop against the
//! configured container runtime until interrupted.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use deployd::api::create_router;
use deployd::config::{Config, RuntimeKind};
use deployd::deployment::DeploymentStore;
use deployd::reconcile::{Reconciler, TriggerMerger};
use deployd::runtime;

#[derive(Parser)]
#[command(name = "deployd")]
#[command(about = "Declarative container deployments with a self-healing reconcile loop")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "deployd.toml")]
    config: String,

    /// HTTP API port (overrides config file)
    #[arg(long, env = "DEPLOYD_HTTP_PORT")]
    http_port: Option<u16>,

    /// Container runtime (overrides config file)
    #[arg(long, env = "DEPLOYD_RUNTIME", value_enum)]
    runtime: Option<RuntimeKind>,

    /// Log level for deployd itself
    #[arg(long, env = "DEPLOYD_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("deployd={}", cli.log_level).parse()?),
        )
        .init();

    info!("Starting deployd");
    info!("Config file: {}", cli.config);

    if !Path::new(&cli.config).exists() {
        info!("Config file not found, using defaults");
    }
    let mut config = Config::load_or_default(Path::new(&cli.config))?;

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(kind) = cli.runtime {
        config.runtime.kind = kind;
    }

    info!(runtime = ?config.runtime.kind, "Container runtime");
    if config.runtime.kind == RuntimeKind::Memory {
        warn!("Using the in-memory runtime, no containers will actually run");
    }

    let runtime = runtime::from_config(&config.runtime, &config.reconcile.owner_label);
    let store = Arc::new(DeploymentStore::new());

    // Wire every wakeup source into one merger
    let mut merger = TriggerMerger::new();
    store.subscribe(merger.trigger());
    merger.watch_runtime(
        runtime.clone(),
        Duration::from_secs(config.runtime.events_resubscribe_secs),
    );
    if config.reconcile.resync_interval_secs > 0 {
        merger.watch_interval(Duration::from_secs(config.reconcile.resync_interval_secs));
        info!(secs = config.reconcile.resync_interval_secs, "Periodic resync enabled");
    }
    if config.reconcile.reconcile_on_startup {
        merger.trigger().fire();
    }

    let reconciler = Reconciler::new(store.clone(), runtime, &config.reconcile);
    let reconcile_task = tokio::spawn(reconciler.run(merger));

    let app = create_router(store);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconcile_task.abort();
    info!("deployd stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use challenge_relay::{
    client,
    config::ServeConfig,
    gateway::{self, AppState},
    lifecycle::LifecycleManager,
    pty::DockerExecSpawner,
    registry::SessionRegistry,
    runtime::DockerCli,
};

#[derive(Debug, Parser)]
#[command(name = "challenge-relay")]
#[command(about = "Terminal relay and lifecycle manager for challenge instances")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay gateway and the environment lifecycle manager.
    Serve(ServeConfig),
    /// Attach the local terminal to a running instance.
    Attach {
        /// Instance id to attach to.
        instance_id: String,

        /// Relay host:port to connect to.
        #[arg(long, default_value = "127.0.0.1:8080")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(config) => serve(config).await,
        Commands::Attach {
            instance_id,
            server,
        } => client::run_attach(&server, &instance_id).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    let catalog = config.catalog();
    if catalog.is_empty() {
        tracing::warn!(
            target = "challenge_relay::main",
            "no challenges configured; every start request will be rejected"
        );
    }

    let runtime = Arc::new(DockerCli::new(&config.network));
    let lifecycle = Arc::new(LifecycleManager::new(
        runtime,
        catalog,
        Duration::from_secs(config.ttl_secs),
        config.max_instances,
    ));

    let sweep = tokio::spawn(
        lifecycle
            .clone()
            .run_sweep(Duration::from_secs(config.sweep_interval_secs)),
    );

    let state = AppState {
        lifecycle,
        registry: Arc::new(SessionRegistry::new()),
        spawner: Arc::new(DockerExecSpawner::new(&config.shell)),
    };
    let app = gateway::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        target = "challenge_relay::main",
        %addr,
        ttl_secs = config.ttl_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        "relay gateway listening"
    );

    axum::serve(listener, app)
        .await
        .context("gateway server failed")?;

    sweep.abort();
    Ok(())
}

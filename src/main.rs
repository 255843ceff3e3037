//! cortexd: the CortexOS orchestration kernel daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use cortex_kernel::adapters::http::{A2aGateway, CadpServer};
use cortex_kernel::adapters::worker::ProcessWorker;
use cortex_kernel::adapters::PoolTaskHandler;
use cortex_kernel::domain::models::{EnvironmentRegistry, ExecutionEnvironment};
use cortex_kernel::infrastructure::{init_logging, ConfigLoader, KernelConfig};
use cortex_kernel::services::{AgentDirectory, ContainerPool, FederationService};

#[derive(Parser)]
#[command(name = "cortexd", version, about = "CortexOS orchestration kernel daemon")]
struct Cli {
    /// Path to a configuration file (defaults to cortexos.yaml discovery).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the kernel: A2A gateway, CADP endpoint, and worker pool.
    Serve,
    /// Print the effective merged configuration and exit.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: KernelConfig) -> Result<()> {
    let _log_guard = init_logging(&config.logging)?;
    info!("starting cortexd");

    // Environment registry; the pool's default environment always resolves.
    let mut registry = EnvironmentRegistry::new();
    for environment in &config.environments {
        registry.register(environment.clone());
    }
    if registry.get(&config.pool.default_environment).is_none() {
        warn!(
            environment = %config.pool.default_environment,
            "default environment not configured, registering echo worker"
        );
        registry.register(
            ExecutionEnvironment::new(config.pool.default_environment.clone(), "/bin/sh")
                .with_args(vec![
                    "-c".to_string(),
                    "printf '%s\\n' \"$CORTEXOS_PROMPT\"".to_string(),
                ])
                .with_timeout_ms(config.pool.container_timeout_ms),
        );
    }

    // Kernel wiring: explicit constructor dependencies, no globals.
    let pool = ContainerPool::new(
        config.pool.clone(),
        Arc::new(registry),
        Arc::new(ProcessWorker::new()),
    );
    let directory = AgentDirectory::new();
    let federation = Arc::new(FederationService::new(
        config.federation.clone(),
        directory.clone(),
    ));
    let gateway = A2aGateway::new(
        config.gateway.clone(),
        Arc::new(PoolTaskHandler::new(pool.clone())),
    );
    let cadp = CadpServer::new(
        config.gateway.hostname.clone(),
        config.federation.listen_port,
        Arc::clone(&federation),
    );

    federation.start_sync().await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let gateway_task = {
        let gateway = gateway.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            gateway
                .serve_with_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
        })
    };
    let cadp_task = {
        let cadp = cadp.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            cadp.serve_with_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(());
    federation.stop_sync().await;
    pool.shutdown().await;

    for task in [gateway_task, cadp_task] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "server ended with error"),
            Err(e) => warn!(error = %e, "server task ended abnormally"),
        }
    }

    info!("cortexd stopped");
    Ok(())
}

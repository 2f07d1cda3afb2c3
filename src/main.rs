//! knotroute router - entry point

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use knotroute::{Config, Server, VERSION};

/// Routes connections based on the knot chain in their SNI or Host field.
#[derive(Parser)]
#[command(name = "knotroute")]
#[command(version = VERSION)]
#[command(about = "Source-routed proxy chaining through DNS hostnames")]
struct Cli {
    /// Path to the configuration file; the environment alone is used
    /// when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = knotroute::util::init_tracing(&config.logging) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(2);
    }

    if !config.has_listener() {
        error!("listen address is missing");
        std::process::exit(1);
    }

    info!(version = VERSION, "starting knotroute");

    let config = Arc::new(config);
    let mut servers: Vec<Arc<Server>> = Vec::new();
    if !config.router.listen_plain.is_empty() {
        servers.push(Arc::new(Server::new(
            config.router.listen_plain.clone(),
            false,
            config.clone(),
        )));
    }
    if !config.router.listen_tls.is_empty() {
        servers.push(Arc::new(Server::new(
            config.router.listen_tls.clone(),
            true,
            config.clone(),
        )));
    }

    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(servers.len());
    for server in &servers {
        let server = server.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    tokio::select! {
        Some(e) = err_rx.recv() => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    // graceful exit
    for server in &servers {
        server.shutdown();
    }
    info!("stopped");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # homelink
//!
//! Cloud relay for home controllers behind NAT.
//!
//! Controllers dial out to `/Connector` and hold a WebSocket open; HTTP
//! requests for a channel are tunneled through that socket and answered by
//! the controller's local network.
//!
//! ## Subcommands
//!
//! - `homelink serve` (default): run the cloud connector
//! - `homelink connect`: run the controller-side client from `[client]`
//!
//! ## API surface
//!
//! | Method | Path                                               | Auth          |
//! |--------|----------------------------------------------------|---------------|
//! | GET    | `/Connector`                                       | channel token |
//! | GET    | `/api/health`                                      | No            |
//! | GET    | `/api/v1/cloud/statistics`                         | admin key     |
//! | GET    | `/api/v1/cloud/statistics/{identity}/{channel}`    | admin key     |
//! | POST   | `/api/v1/cloud/statistics/{identity}/{channel}/reset` | admin key  |
//! | DELETE | `/api/v1/cloud/statistics/{identity}/{channel}`    | admin key     |
//! | GET    | `/api/v1/cloud/sessions`                           | admin key     |
//! | POST   | `/api/v1/cloud/ping`                               | channel token |
//! | POST   | `/api/v1/cloud/invoke`                             | channel token |
//! | any    | everything else (tunneled to the controller)       | channel token |

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use homelink::config::Config;
use homelink::repository::{FileIdentityRepository, IdentityRepository, StaticIdentityRepository};
use homelink::{client, routes, AppState};

/// Cloud device connector and controller tunnel client.
#[derive(Parser)]
#[command(name = "homelink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cloud connector (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the controller-side tunnel client.
    Connect {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, connect) = match cli.command {
        Some(Commands::Connect { config }) => (config, true),
        Some(Commands::Serve { config }) => (config, false),
        None => (None, false),
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("homelink: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = if connect {
        run_client(config).await
    } else {
        run_server(config).await
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("homelink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let repository: Arc<dyn IdentityRepository> = match &config.repository.identities_dir {
        Some(dir) => {
            info!("Identities directory: {dir}");
            Arc::new(FileIdentityRepository::new(dir))
        }
        None => {
            if config.repository.channels.is_empty() {
                warn!("No identities configured, every controller will be rejected");
            }
            Arc::new(StaticIdentityRepository::new(&config.repository.channels))
        }
    };
    if config.auth.admin_key.is_none() {
        warn!("No admin key configured, statistics API disabled");
    }

    let state = AppState::new(config, repository);
    let app = routes::router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    // Upgraded sockets outlive the HTTP connection, so sessions are closed
    // before serve stops waiting on them.
    let draining = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down...");
            draining.shutdown.cancel();
            draining.connector.close_all().await;
        })
        .await?;
    info!("Goodbye");
    Ok(())
}

async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let Some(client_config) = config.client.clone() else {
        return Err("`homelink connect` requires a [client] section".into());
    };
    info!("homelink v{} client starting", env!("CARGO_PKG_VERSION"));
    info!("Forwarding tunneled requests to {}", client_config.forward_to);

    // The cloud drives keep-alive; its pings are answered by the client.
    let mut options = config.connector.to_session_options();
    options.keep_alive_interval = None;

    let shutdown = CancellationToken::new();
    let task = client::spawn(client_config, options, shutdown.clone());
    shutdown_signal().await;
    shutdown.cancel();
    task.await?;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

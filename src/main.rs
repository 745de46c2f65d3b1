use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use pincer::cli::{self, Cli, Command};
use pincer::config::ProxyConfig;
use pincer::logging;
use pincer::server::startup::{run_server_with_config, ServerConfig};
use pincer::server::ws::WsServerState;
use pincer::subscription::SupabaseGateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    match args.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config) => {
            cli::handle_config();
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;
    let config = ProxyConfig::from_env();

    let mut state = WsServerState::new(config.clone())?;
    match SupabaseGateway::from_config(&config)? {
        Some(gateway) => state = state.with_gateway(Arc::new(gateway)),
        None => warn!("Subscription store not configured; managed mode disabled"),
    }
    let state = Arc::new(state);

    let handle = run_server_with_config(ServerConfig {
        state,
        bind_address: SocketAddr::from(([0, 0, 0, 0], config.port)),
        spawn_background_tasks: true,
    })
    .await?;

    log_startup_banner(&config, handle.port());

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    info!("Proxy shut down");
    Ok(())
}

/// Initialize logging based on the PINCER_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("PINCER_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

fn log_startup_banner(config: &ProxyConfig, port: u16) {
    info!("pincer v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on port {}", port);
    info!("Allowed origins: {}", config.allowed_origins.join(", "));
    if config.has_managed_keys() {
        info!("Managed mode: provider credentials configured");
    } else {
        info!("Managed mode: no provider credentials (BYOK only)");
    }
    if config.search_key.is_some() {
        info!("Web search: enabled");
    } else {
        info!("Web search: disabled");
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("Failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}

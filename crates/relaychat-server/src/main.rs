//! relaychat-server binary.

use clap::Parser;
use relaychat_server::auth::build_verifier;
use relaychat_server::transport::websocket;
use relaychat_server::{ChatServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// relaychat-server: authenticated chat relay
#[derive(Parser, Debug)]
#[command(name = "relaychat-server", version, about = "Authenticated WebSocket chat relay")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.relaychat/config.toml")]
    config: String,

    /// Require a token from every client, including the first
    #[arg(long)]
    no_bootstrap: bool,

    /// OAuth client id that verified tokens must be issued for
    #[arg(long, env = "RELAYCHAT_CLIENT_ID")]
    client_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relaychat-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.bind.as_deref(),
        cli.no_bootstrap,
        cli.client_id.clone(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let verifier = match build_verifier(&server_config.auth) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to build identity verifier");
            std::process::exit(1);
        }
    };

    let listener = match websocket::bind(server_config.listen_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let server = ChatServer::new(server_config, verifier);
    if let Err(e) = server.run(listener, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("relaychat-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

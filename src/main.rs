//! Fail2ban Agent CLI.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zentinel_agent_fail2ban::{server, Config, Jail, Jailer};

#[derive(Parser, Debug)]
#[command(name = "zentinel-agent-fail2ban")]
#[command(about = "Fail2ban agent for Zentinel - ban repeat offenders in a regional WAF IP set")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fail2ban.yaml")]
    config: PathBuf,

    /// Listen address, overrides server.listen
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("unable to listen on {}", config.server.listen))?;

    let jailer = Arc::new(Jailer::from_config(&config).await?);

    info!(listen = %config.server.listen, "Starting fail2ban agent");
    let served = server::serve(
        listener,
        jailer.clone(),
        config.server.expose_state,
        shutdown_signal(),
    )
    .await;

    jailer.close().await?;
    served?;

    info!("Fail2ban agent stopped");
    Ok(())
}

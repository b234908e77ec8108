//! confdump binary entry point.
//!
//! One-shot mode runs a single pass and exits non-zero on failure; daemon
//! mode keeps collecting on every interval tick until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use confdump::{Config, DriverRegistries, Scraper};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Versioned snapshots of network device configuration.
#[derive(Parser, Debug)]
#[command(name = "confdump", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "CONFDUMP_CONFIG")]
    config: PathBuf,

    /// Keep running, collecting on every interval tick
    #[arg(short, long)]
    daemon: bool,

    /// Don't wait for the first interval tick in daemon mode
    #[arg(short = 'n', long)]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,confdump=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %cli.config.display(), "loading configuration");
    let config = Config::load(&cli.config)?;

    let registries = DriverRegistries::default();
    let scraper = Scraper::from_config(&config, &registries).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    if !cli.daemon {
        tracing::info!("collecting data");
        scraper.run(&cancel).await?;
        return Ok(());
    }

    let interval = match config.interval()? {
        Some(interval) if !interval.is_zero() => interval,
        _ => return Err("interval must be set in daemon mode".into()),
    };

    if cli.no_wait {
        tracing::info!("collecting data");
        if let Err(e) = scraper.run(&cancel).await {
            tracing::error!("{e}");
        }
    }

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                tracing::info!("collecting data");
                if let Err(e) = scraper.run(&cancel).await {
                    tracing::error!("{e}");
                }
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Cancel the run token on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("received terminate signal");
        }
    }

    cancel.cancel();
}

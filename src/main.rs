// MIT License - Copyright (c) 2026 Peter Wright
// ja2mqtt command-line entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

use ja2mqtt::{Bridge, BridgeConfig};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ja2mqtt")]
#[command(about = "Bridge between a serial alarm panel protocol and MQTT")]
struct Cli {
    /// Path to the TOML or YAML configuration file
    #[arg(long, default_value = "ja2mqtt.toml")]
    config: PathBuf,

    /// Env file whose variables may be referenced as ${NAME} in the config
    #[arg(long)]
    env: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the bridge (default)
    Run,
    /// Print the effective configuration as JSON and exit
    Config,
}

fn init_logging(default_level: &str) {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=ja2mqtt=trace); --log-level
    // applies otherwise.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

fn load(cli: &Cli) -> Result<(BridgeConfig, Bridge)> {
    let config = BridgeConfig::load(&cli.config, cli.env.as_deref())
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    let bridge = Bridge::from_config(&config).context("Invalid protocol or mapping rules")?;
    Ok((config, bridge))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let (mut config, mut bridge) = load(&cli)?;

    if cli.command == Some(Command::Config) {
        let json = serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
        println!("{json}");
        return Ok(());
    }

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handle = tokio::spawn(bridge.run(shutdown_rx));

        info!("Bridge running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
            result = &mut handle => {
                // The bridge only returns early when it cannot start.
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e).context("Bridge failed"),
                    Err(e) => Err(e).context("Bridge task panicked"),
                };
            }
        };

        let _ = shutdown_tx.send(true);
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Bridge stopped with error: {e}"),
            Err(e) => error!("Bridge task failed: {e}"),
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config.display());
        bridge = match load(&cli) {
            Ok((new_config, new_bridge)) => {
                info!("Config reloaded successfully");
                config = new_config;
                new_bridge
            }
            Err(e) => {
                warn!("Failed to reload config, keeping previous: {e:#}");
                Bridge::from_config(&config).context("Failed to rebuild previous config")?
            }
        };
    }

    info!("Shutdown complete");
    Ok(())
}

mod configuration;
mod emitter;

use anyhow::Context;
use clap::Parser;
use configuration::Configuration;
use emitter::Emitter;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_ip_ping_monitor::Pinger;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,tokio_ip_ping_monitor=info,ping_monitor=info";

/// Periodic ICMP latency monitoring, one JSON line per probe.
#[derive(Parser, Debug)]
#[command(name = "ping_monitor", version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(
        short,
        long,
        default_value = "ping_monitor.json",
        env = "PING_MONITOR_CONFIG"
    )]
    config: PathBuf,

    /// Write events to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    tracing::info!(config = %cli.config.display(), "loading configuration");
    let conf = Configuration::load(&cli.config)?;
    conf.check_privileges()?;
    let targets = conf.resolve_targets().await?;
    tracing::info!(targets = targets.len(), "targets resolved");

    let (tx, rx) = mpsc::channel(conf.channel_capacity);
    let pinger = Pinger::new(conf.pinger_config(targets), tx)?;

    let emitting = match &cli.output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            tokio::spawn(Emitter::new(file).run(rx))
        }
        None => tokio::spawn(Emitter::new(tokio::io::stdout()).run(rx)),
    };

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupted, shutting down");
                interrupt.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C"),
        }
    });

    pinger.run(shutdown).await?;
    let written = emitting
        .await
        .context("emitter task failed")?
        .context("failed to write events")?;
    tracing::info!(written, "done");
    Ok(())
}

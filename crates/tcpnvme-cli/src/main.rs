//! tcpnvmed - NVMe-over-TCP target daemon

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tcpnvme::{NvmeTcpTarget, StoreKind, TargetConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tcpnvmed")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep written blocks in memory instead of discarding them
    #[arg(long)]
    memory: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(path: Option<&Path>) -> Result<TargetConfig> {
    let Some(path) = path else {
        return Ok(TargetConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.memory {
        config.store = StoreKind::Memory;
    }

    if cli.print_config {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to serialize config")?
        );
        return Ok(());
    }

    let target = NvmeTcpTarget::new(config).context("Invalid configuration")?;
    let listener = target.bind().await.context("Failed to bind listener")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received shutdown signal");
    };

    target
        .serve_with_shutdown(listener, shutdown)
        .await
        .context("Target failed")?;

    Ok(())
}

//! Rotation trading bot entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Signal-driven ETF rotation executor.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via ROTOR_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Force the simulated broker regardless of the configured kind
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    rotor_telemetry::init_logging()?;

    info!("Starting rotor v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > ROTOR_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("ROTOR_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let mut config = rotor_bot::AppConfig::load(&config_path)?;

    if args.dry_run {
        info!("Dry-run flag set, forcing the simulated broker");
        config.force_dry_run();
    }

    info!(
        live = config.is_live(),
        gateway = %config.connection.url,
        aggressive = %config.rotation.aggressive,
        "Configuration loaded"
    );

    let app = rotor_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}

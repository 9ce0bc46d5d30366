use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use systemcalc::{Config, SystemCalc};
use tracing::{error, info};

/// System aggregator service for Victron Venus OS
#[derive(Parser, Debug)]
#[command(name = "systemcalc", version, about)]
struct Args {
    /// Set logging level to debug
    #[arg(short, long)]
    debug: bool,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_with_override(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if args.debug {
        config.logging.level = "DEBUG".to_string();
    }
    systemcalc::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("systemcalc v{} starting up", env!("CARGO_PKG_VERSION"));

    let mut calc = SystemCalc::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create engine: {}", e))?;

    match calc.run().await {
        Ok(_) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Engine failed with error: {}", e);
            Err(anyhow::anyhow!("Engine error: {}", e))
        }
    }
}

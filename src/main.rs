use solarman_accessory_bridge::{config::Config, lifecycle};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Solarman accessory bridge");
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to parse config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match lifecycle::run(config).await {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

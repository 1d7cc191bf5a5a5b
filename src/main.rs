use std::path::PathBuf;

use anyhow::{Context, Result};
use gpio_link_bridge_lib::{setup_logging, state::AppState};
use log::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(log::Level::Info);

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config"));

    let app_state = AppState::new(&config_dir)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_dir))?;

    let _status = app_state.on_status(|event| match serde_json::to_string(&event) {
        Ok(json) => info!("status {}", json),
        Err(e) => warn!("Failed to serialize status event: {}", e),
    });
    let _connection = app_state.on_connection_change(|state| info!("link {:?}", state));

    info!(
        "Starting AppState with {:?} transport",
        app_state.config.engine.transport
    );
    app_state
        .connect()
        .await
        .context("Failed to connect to the device")?;
    app_state.session.request_state().await?;
    app_state.push_configured_rules().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");

    if let Err(e) = app_state.shutdown().await {
        error!("Failed to close the link cleanly: {}", e);
    }
    Ok(())
}

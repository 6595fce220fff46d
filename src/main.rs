//! Wiren Board <-> Home Assistant MQTT discovery bridge.
//!
//! Translates Wiren Board's native MQTT convention into Home Assistant MQTT
//! Discovery, and forwards Home Assistant commands back to Wiren Board.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info};

#[cfg(feature = "api")]
use wb_bridge::api;
use wb_bridge::config::Config;
use wb_bridge::supervisor::Supervisor;

/// Config file path, overridable the way the original's `-c/--config`
/// option does, defaulting to the same `/data/options.json` location
/// (the Home Assistant add-on options mount point the original targets).
fn config_path() -> String {
    std::env::var("WB_BRIDGE_CONFIG").unwrap_or_else(|_| "/data/options.json".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(config_path())?;
    init_logging(&config);

    info!("starting wb-bridge");
    let supervisor = Supervisor::build(&config)?;

    #[cfg(feature = "api")]
    let api_handle = {
        let captured = supervisor.ha_captured_messages();
        tokio::spawn(async move {
            if let Err(err) = api::serve("0.0.0.0:8099", captured).await {
                error!("HTTP API server stopped: {err}");
            }
        })
    };

    let run_handle = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping");

    supervisor.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), run_handle).await;

    #[cfg(feature = "api")]
    api_handle.abort();

    info!("wb-bridge stopped");
    Ok(())
}

/// Initializes `env_logger` with the general/MQTT loglevel split the
/// original implementation configures separately for its root logger and
/// its `gmqtt` transport logger.
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.general.loglevel.to_filter())
        .filter_module("rumqttc", config.mqtt.loglevel.to_filter())
        .format_timestamp_secs()
        .init();
}

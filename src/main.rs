pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod mqtt;
pub mod protocol;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bluetooth::{BluetoothAdapter, BtleplugAdapter};
use crate::bridge::Bridge;
use crate::config::Config;
use crate::mqtt::MqttHandler;

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    if config.devices.is_empty() {
        return Err(eyre!("No [[sem]] devices configured"));
    }
    info!("Bridging {} device(s)", config.devices.len());

    let mqtt = Arc::new(MqttHandler::establish(&config.mqtt).await?);

    let adapter = Arc::new(BtleplugAdapter::first_available().await?);
    adapter.discover(config.bluetooth.scan_duration()).await?;

    let bridge = Bridge::start(
        &config.mqtt.root_topic,
        &config.devices,
        config.bluetooth.reconnect_delay(),
        adapter,
        mqtt.clone(),
    )
    .await?;

    wait_for_shutdown_signal().await?;
    info!("Shutdown requested");

    bridge.shutdown().await;
    mqtt.shutdown().await;
    info!("Bye");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

mod bluetooth;
mod capacity;
mod config;
mod control;
mod crypto;
mod delivery;
mod gateway;
mod models;
mod pairing;
mod registry;
mod telemetry;
mod utils;

use log::{error, info};
use std::sync::Arc;

use bluetooth::start_peripheral;
use config::{GatewayConfig, GatewaySettings};
use delivery::{Backlog, DeliveryQueue, HttpBackend};
use gateway::Gateway;
use registry::Registry;
use telemetry::Decoder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match GatewayConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Load persisted state
    let registry = match Registry::load(config.sensors_path()) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to load sensor registry: {}", e);
            return Err(e.into());
        }
    };
    info!("{} sensor(s) paired", registry.sensors().len());
    let settings = match GatewaySettings::load_or_create(
        &config.gateway_path(),
        &config.seed_gateway_id,
        &config.seed_gateway_password,
    )
    .await
    {
        Ok(settings) => settings.into_shared(),
        Err(e) => {
            error!("Failed to load gateway settings: {}", e);
            return Err(e.into());
        }
    };

    let backend = HttpBackend::new(config.backend_url.clone(), config.backend_timeout)?;
    let queue = Arc::new(DeliveryQueue::new(
        Arc::new(backend),
        Backlog::new(&config.backlog_dir),
        settings.clone(),
    ));
    let gateway = Gateway::new(
        registry.into_shared(),
        settings,
        queue,
        Decoder::default(),
        config.pairing_timeout,
    );

    // Start the BLE peripheral
    let _peripheral = start_peripheral(Arc::clone(&gateway), &config.advertised_name).await?;

    let control = tokio::spawn(control::serve(
        Arc::clone(&gateway),
        config.control_socket.clone(),
    ));

    // Run until Ctrl+C or a control socket failure
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Program terminated by user. Exiting gracefully."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
        result = control => {
            match result {
                Ok(Ok(())) => info!("Control socket closed"),
                Ok(Err(e)) => error!("Control socket failed: {}", e),
                Err(e) => error!("Control socket task failed: {}", e),
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&config.control_socket) {
        error!(
            "Failed to remove control socket {}: {}",
            config.control_socket.display(),
            e
        );
    }
    Ok(())
}

//! TechTemp sensor node - scheduled and on-demand readings over MQTT

use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use techtemp::config::TechTempConfig;
use techtemp::error::TechTempResult;
use techtemp::observability::init_default_logging;
use techtemp::sensor::{sensor_transport_options, SensorNode, SensorSettings, SimulatedSource};
use techtemp::transport::mqtt::MqttTransport;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// TechTemp sensor node
#[derive(Parser)]
#[command(name = "techtemp-sensor")]
#[command(about = "Publishes temperature and humidity readings to the TechTemp broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Simulated baseline temperature in degrees Celsius
    #[arg(long, default_value_t = 21.0, env = "TECHTEMP_SIM_TEMPERATURE")]
    sim_temperature: f64,

    /// Simulated baseline relative humidity in percent
    #[arg(long, default_value_t = 50.0, env = "TECHTEMP_SIM_HUMIDITY")]
    sim_humidity: f64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match TechTempConfig::discover(cli.config.as_deref()) {
        Ok((config, path)) => {
            info!("Loaded configuration from: {}", path.display());
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_sensor(config, &cli).await {
        if e.is_fatal() {
            error!("Sensor node failed to start: {}", e);
            process::exit(1);
        }
        error!("Sensor node stopped with error: {}", e);
    }
}

async fn run_sensor(config: TechTempConfig, cli: &Cli) -> TechTempResult<()> {
    let settings = SensorSettings::from_section(config.sensor()?);
    let transport = Arc::new(MqttTransport::new(sensor_transport_options(&config)?)?);

    let node = Arc::new(SensorNode::new(
        settings,
        transport.clone(),
        Arc::new(SimulatedSource::new(cli.sim_temperature, cli.sim_humidity)),
    ));

    transport.connect(Arc::new(node.command_listener())).await?;
    info!(client_id = %transport.client_id(), "Connected to MQTT broker");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Foreground pumping ends when the node cleans up the transport, after
    // the retained offline status has gone out
    let pump = if config.mqtt.run_background_pump {
        None
    } else {
        let transport = transport.clone();
        Some(tokio::spawn(async move { transport.drive().await }))
    };

    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Failed to install signal handlers: {}", e);
                // Keep the sender alive so the node is not stopped
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let result = node.run(shutdown_rx).await;

    if let Some(pump) = pump {
        match pump.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Transport pump stopped: {}", e),
            Err(e) => warn!("Pump task ended abnormally: {}", e),
        }
    }

    result?;
    info!("Sensor node stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<(), std::io::Error> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

//! TechTemp server - telemetry ingestion and fleet health export

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use techtemp::config::TechTempConfig;
use techtemp::error::{TechTempError, TechTempResult};
use techtemp::http::HttpServer;
use techtemp::ingest::IngestionBridge;
use techtemp::monitor::{LivenessMonitor, MonitorSettings};
use techtemp::monitor_span;
use techtemp::observability::init_default_logging;
use techtemp::protocol::{STATUS_TOPIC, WEATHER_TOPIC};
use techtemp::transport::mqtt::{MqttTransport, TransportOptions};
use techtemp::transport::QoS;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn, Instrument};

/// How often the fleet summary is logged
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// TechTemp telemetry server
#[derive(Parser)]
#[command(name = "techtemp-server")]
#[command(about = "Ingests sensor telemetry over MQTT and serves fleet health over HTTP")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting TechTemp server v{}", env!("CARGO_PKG_VERSION"));

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

    let result = match cli.command {
        Commands::Run => run_server(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        if e.is_fatal() {
            error!("Server failed to start: {}", e);
            process::exit(1);
        }
        error!("Server stopped with error: {}", e);
    }

    info!("Server shutdown complete");
}

async fn run_server(config: TechTempConfig) -> TechTempResult<()> {
    let monitor = Arc::new(LivenessMonitor::with_system_clock(
        MonitorSettings::from_config(&config),
    ));
    monitor.init().await;

    let options = TransportOptions::from_section(&config.mqtt)
        .with_subscription(WEATHER_TOPIC, QoS::AtLeastOnce)
        .with_subscription(STATUS_TOPIC, QoS::AtLeastOnce);
    let transport = Arc::new(MqttTransport::new(options)?);

    let bridge = Arc::new(IngestionBridge::with_logging_sink(monitor.clone()));
    // Broker unreachable at startup is the one fatal case
    transport.connect(bridge).await?;
    info!(client_id = %transport.client_id(), "Connected to MQTT broker");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pump = if config.mqtt.run_background_pump {
        None
    } else {
        let transport = transport.clone();
        Some(tokio::spawn(async move { transport.drive().await }))
    };

    let reporter = tokio::spawn(report_status(monitor.clone(), shutdown_rx.clone()));

    let http_port = std::env::var("HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.http.port);
    let http_server = HttpServer::new(http_port, monitor.clone(), transport.clone());
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        let signal = async move {
            while http_shutdown.changed().await.is_ok() && !*http_shutdown.borrow() {}
        };
        if let Err(e) = http_server.run(signal).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_shutdown_signal().await?;

    info!("Server shutdown initiated");
    let _ = shutdown_tx.send(true);

    if let Err(e) = http.await {
        warn!("HTTP task ended abnormally: {}", e);
    }
    reporter.abort();

    // Cleanup also ends foreground pumping
    transport.cleanup().await;
    if let Some(pump) = pump {
        match pump.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Transport pump stopped: {}", e),
            Err(e) => warn!("Pump task ended abnormally: {}", e),
        }
    }
    monitor.cleanup().await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<(), std::io::Error> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Server is running and waiting for telemetry on MQTT...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
    Ok(())
}

/// Periodic fleet summary in the log
async fn report_status(monitor: Arc<LivenessMonitor>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(STATUS_REPORT_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let span = monitor_span!(operation = "status_report");
                async {
                    match monitor.snapshot().await {
                        Ok(health) => info!(
                            status = health.global_status.as_str(),
                            devices = health.summary.total_devices,
                            online = health.summary.online,
                            warning = health.summary.warning,
                            offline = health.summary.offline,
                            "Fleet status"
                        ),
                        Err(e) => warn!("Status report skipped: {}", e),
                    }
                }
                .instrument(span)
                .await;
            }
        }
    }
}

fn handle_config_command(config: &TechTempConfig, show: bool) -> TechTempResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| TechTempError::internal_error(format!("cannot render configuration: {e}")))?;
        println!("Current configuration:");
        println!("{}", rendered);
    }

    info!("Configuration validation complete");
    Ok(())
}

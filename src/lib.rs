//! TechTemp - environmental telemetry over MQTT
//!
//! Sensor nodes publish temperature and humidity readings to an MQTT
//! broker; the server ingests them, tracks each node's liveness and serves
//! the fleet's health over HTTP.
//!
//! # Overview
//!
//! - [`transport`] - MQTT client with classified publish outcomes, delivery
//!   tracking, subscription replay and automatic reconnection
//! - [`monitor`] - bounded device registry with time-derived status
//! - [`ingest`] - decodes inbound telemetry into the monitor and storage
//! - [`http`] - JSON health export and the capture trigger
//! - [`sensor`] - control loop for a sensor node
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use techtemp::ingest::IngestionBridge;
//! use techtemp::monitor::{GlobalStatus, LivenessMonitor, MonitorSettings};
//!
//! # tokio_test::block_on(async {
//! let monitor = Arc::new(LivenessMonitor::with_system_clock(MonitorSettings::default()));
//! monitor.init().await;
//!
//! let bridge = IngestionBridge::with_logging_sink(monitor.clone());
//! bridge
//!     .handle_telemetry(br#"{"sensor_id":7,"room_id":2,"temperature":21.5,"humidity":55}"#)
//!     .await
//!     .unwrap();
//!
//! let health = monitor.snapshot().await.unwrap();
//! assert_eq!(health.global_status, GlobalStatus::Healthy);
//! assert_eq!(health.devices[0].room_name, "eetkamer");
//! # });
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod monitor;
pub mod observability;
pub mod protocol;
pub mod sensor;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, TechTempConfig};
pub use error::{TechTempError, TechTempResult};
pub use monitor::{LivenessMonitor, MonitorError, MonitorSettings};
pub use transport::{PublishOutcome, Transport, TransportHandler};

//! MQTT 3.1.1 transport for TechTemp
//!
//! This module provides a decomposed MQTT transport that separates pure
//! decisions from I/O for testability.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, backoff and option building
//! - [`session`] - Subscription set and outstanding-publish bookkeeping
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - Pure reconnection and publish admission decisions
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use techtemp::config::MqttSection;
//! use techtemp::transport::mqtt::{MqttTransport, TransportOptions};
//! use techtemp::transport::{NoopHandler, QoS};
//!
//! # tokio_test::block_on(async {
//! let options = TransportOptions::from_section(&MqttSection::local("techtemp_demo"))
//!     .with_subscription("weather", QoS::AtLeastOnce);
//!
//! let transport = MqttTransport::new(options)?;
//! transport.connect(Arc::new(NoopHandler)).await?;
//! let outcome = transport
//!     .publish("weather", b"{}".to_vec(), QoS::AtLeastOnce, false, Duration::from_secs(5))
//!     .await;
//! println!("publish: {outcome}");
//! transport.cleanup().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod session;

// Re-export public types for convenience
pub use client::MqttTransport;
pub use connection::{
    parse_broker_address, BrokerAddress, ConnectionState, LastWill, ReconnectConfig,
    Subscription, TransportError, TransportOptions,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};

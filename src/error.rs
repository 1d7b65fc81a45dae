//! Crate-level error type
//!
//! Each layer has its own error enum; [`TechTempError`] wraps them so the
//! binaries can propagate anything with `?`. Publish outcomes are not
//! errors and never appear here.

use thiserror::Error;

/// Main error type for TechTemp operations
#[derive(Debug, Error)]
pub enum TechTempError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] crate::monitor::MonitorError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] crate::ingest::IngestError),

    #[error("Storage error: {0}")]
    Sink(#[from] crate::ingest::SinkError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] crate::sensor::SensorError),

    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::HttpError),

    #[error("Signal handling error: {0}")]
    Signal(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TechTempError {
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Startup failures that should end the process with a non-zero code
    ///
    /// Everything else is reported and the process exits normally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TechTempError::Config(_)
                | TechTempError::Http(_)
                | TechTempError::Signal(_)
                | TechTempError::Transport(crate::transport::TransportError::InvalidConfig(_))
                | TechTempError::Transport(crate::transport::TransportError::ConnectFailed(_))
        )
    }
}

/// Result type for TechTemp operations
pub type TechTempResult<T> = Result<T, TechTempError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::monitor::MonitorError;
    use crate::transport::{ConnectionState, TransportError};

    #[test]
    fn test_conversions_from_layer_errors() {
        let error: TechTempError = ConfigError::MissingSection("sensor").into();
        assert_eq!(
            error.to_string(),
            "Configuration error: Missing [sensor] section"
        );

        let error: TechTempError = MonitorError::NotInitialized.into();
        assert_eq!(error.to_string(), "Monitor error: Monitor not initialized");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TechTempError::from(TransportError::ConnectFailed("refused".into())).is_fatal());
        assert!(TechTempError::from(ConfigError::InvalidConfig("bad".into())).is_fatal());
        assert!(!TechTempError::from(TransportError::NotConnected {
            state: ConnectionState::Disconnected
        })
        .is_fatal());
        assert!(!TechTempError::from(MonitorError::NotInitialized).is_fatal());
        assert!(!TechTempError::internal_error("oops").is_fatal());
    }

    #[test]
    fn test_startup_failures_are_fatal() {
        fn build_transport(broker_url: &str) -> TechTempResult<()> {
            let mut section = crate::config::MqttSection::local("techtemp_startup");
            section.broker_url = broker_url.to_string();
            crate::transport::mqtt::MqttTransport::new(
                crate::transport::mqtt::TransportOptions::from_section(&section),
            )?;
            Ok(())
        }
        let error = build_transport("http://localhost").unwrap_err();
        assert!(matches!(error, TechTempError::Transport(TransportError::InvalidConfig(_))));
        assert!(error.is_fatal());

        fn sensor_section() -> TechTempResult<()> {
            let config = crate::config::TechTempConfig::from_toml_str("")?;
            config.sensor()?;
            Ok(())
        }
        assert!(sensor_section().unwrap_err().is_fatal());

        let signals: TechTempError =
            std::io::Error::new(std::io::ErrorKind::Other, "no signal driver").into();
        assert!(signals.is_fatal());
    }

    #[test]
    fn test_sensor_stop_is_not_fatal() {
        use crate::sensor::SensorError;
        use crate::transport::PublishOutcome;

        let error: TechTempError = SensorError::NotDelivered(PublishOutcome::RetryLater).into();
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_question_mark_propagation() {
        fn load() -> TechTempResult<()> {
            Err(ConfigError::MissingSection("mqtt"))?;
            Ok(())
        }
        assert!(matches!(load(), Err(TechTempError::Config(_))));
    }
}

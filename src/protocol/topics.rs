//! Topic names and MQTT topic/client-id validation
//!
//! Topic names are part of the wire contract between sensor nodes and the
//! server. Validation here mirrors the MQTT 3.1.1 rules so malformed calls
//! are rejected locally before anything is handed to the broker.

use thiserror::Error;

/// Telemetry readings, device to server
pub const WEATHER_TOPIC: &str = "weather";

/// Retained online/offline presence, device to server (also the last-will topic)
pub const STATUS_TOPIC: &str = "weather/status";

/// Capture commands, server to device
pub const COMMAND_TOPIC: &str = "weather/command";

/// Maximum encoded length of a topic or client identifier
const MAX_UTF8_LEN: usize = 65_535;

/// Validate a topic name used for publishing (no wildcards allowed)
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;

    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInPublish(topic.to_string()));
    }

    Ok(())
}

/// Validate a topic filter used for subscribing
///
/// `+` must occupy a whole level and `#` must be the final level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Validate an MQTT client identifier
///
/// Accepts `[a-zA-Z0-9._-]+`, the portable subset every broker accepts.
pub fn validate_client_id(client_id: &str) -> Result<(), TopicError> {
    if client_id.is_empty() {
        return Err(TopicError::EmptyClientId);
    }

    if client_id.len() > MAX_UTF8_LEN {
        return Err(TopicError::TooLong(client_id.len()));
    }

    for ch in client_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(TopicError::InvalidClientIdChar(ch));
        }
    }

    Ok(())
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_UTF8_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Topic and identifier validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic or identifier too long: {0} bytes")]
    TooLong(usize),
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Wildcards are not allowed in publish topics: {0}")]
    WildcardInPublish(String),
    #[error("Wildcard must occupy a whole level ('#' only as last level): {0}")]
    MisplacedWildcard(String),
    #[error("Client ID cannot be empty")]
    EmptyClientId,
    #[error("Client ID contains invalid character: '{0}'")]
    InvalidClientIdChar(char),
}

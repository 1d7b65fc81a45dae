//! Wire payloads exchanged over the broker
//!
//! All payloads are JSON; field names are part of the contract with the
//! sensor fleet and must not change.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Telemetry reading published on `weather`
///
/// # Examples
/// ```
/// use techtemp::protocol::{CaptureTrigger, Telemetry};
///
/// let reading = Telemetry {
///     sensor_id: 7,
///     room_id: 2,
///     temperature: 21.5,
///     humidity: 55.0,
///     trigger: Some(CaptureTrigger::Scheduled),
/// };
/// let json = serde_json::to_string(&reading).unwrap();
/// assert!(json.contains("\"humidity\":55"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Telemetry {
    pub sensor_id: u32,
    /// Older nodes omit the room; they are filed under room 0
    #[serde(default)]
    pub room_id: u32,
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent, sent as a whole number
    #[serde(serialize_with = "serialize_whole_percent")]
    pub humidity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<CaptureTrigger>,
}

/// Why a reading was captured
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureTrigger {
    Scheduled,
    OnDemand,
    #[serde(other)]
    Other,
}

impl CaptureTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureTrigger::Scheduled => "scheduled",
            CaptureTrigger::OnDemand => "on-demand",
            CaptureTrigger::Other => "other",
        }
    }
}

fn serialize_whole_percent<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.round().clamp(0.0, 100.0) as u64)
}

/// Presence message published (retained) on `weather/status`
///
/// The same payload with `offline` is registered as the node's last will.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusMessage {
    pub sensor_id: u32,
    pub status: Presence,
}

impl StatusMessage {
    pub fn online(sensor_id: u32) -> Self {
        Self {
            sensor_id,
            status: Presence::Online,
        }
    }

    pub fn offline(sensor_id: u32) -> Self {
        Self {
            sensor_id,
            status: Presence::Offline,
        }
    }
}

/// Self-reported presence of a sensor node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// Command published on `weather/command`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub action: CommandAction,
    pub sensor_id: CommandTarget,
}

impl Command {
    /// Ask the targeted node(s) to capture and publish a reading now
    pub fn capture(target: CommandTarget) -> Self {
        Self {
            action: CommandAction::Capture,
            sensor_id: target,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Capture,
}

/// Command addressee: one sensor id or `"all"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    All,
    Sensor(u32),
}

impl CommandTarget {
    /// Map an externally supplied id; zero or negative means every sensor
    pub fn from_requested(sensor_id: Option<i64>) -> Self {
        match sensor_id {
            Some(id) if id > 0 => u32::try_from(id).map_or(CommandTarget::All, CommandTarget::Sensor),
            _ => CommandTarget::All,
        }
    }

    pub fn matches(&self, sensor_id: u32) -> bool {
        match self {
            CommandTarget::All => true,
            CommandTarget::Sensor(id) => *id == sensor_id,
        }
    }
}

impl Serialize for CommandTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CommandTarget::All => serializer.serialize_str("all"),
            CommandTarget::Sensor(id) => serializer.serialize_u32(*id),
        }
    }
}

impl<'de> Deserialize<'de> for CommandTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(u32),
            Word(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(CommandTarget::Sensor(id)),
            Raw::Word(word) if word == "all" => Ok(CommandTarget::All),
            Raw::Word(word) => Err(de::Error::custom(format!(
                "expected sensor id or \"all\", got \"{word}\""
            ))),
        }
    }
}

/// Encode a payload as compact JSON bytes
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_telemetry_decodes_device_payload() {
        let payload = br#"{"sensor_id":7,"room_id":2,"temperature":21.5,"humidity":55,"trigger":"scheduled"}"#;
        let reading: Telemetry = serde_json::from_slice(payload).unwrap();

        assert_eq!(reading.sensor_id, 7);
        assert_eq!(reading.room_id, 2);
        assert_eq!(reading.temperature, 21.5);
        assert_eq!(reading.humidity, 55.0);
        assert_eq!(reading.trigger, Some(CaptureTrigger::Scheduled));
    }

    #[test]
    fn test_telemetry_tolerates_missing_optional_fields() {
        let reading: Telemetry =
            serde_json::from_value(json!({"sensor_id": 3, "temperature": 19.0, "humidity": 40.5}))
                .unwrap();

        assert_eq!(reading.room_id, 0);
        assert_eq!(reading.trigger, None);
        assert_eq!(reading.humidity, 40.5);
    }

    #[test]
    fn test_telemetry_unknown_trigger_is_kept_as_other() {
        let reading: Telemetry = serde_json::from_value(
            json!({"sensor_id": 3, "room_id": 1, "temperature": 19.0, "humidity": 40, "trigger": "manual"}),
        )
        .unwrap();
        assert_eq!(reading.trigger, Some(CaptureTrigger::Other));
    }

    #[test]
    fn test_telemetry_requires_numeric_readings() {
        let result: Result<Telemetry, _> = serde_json::from_value(
            json!({"sensor_id": 3, "room_id": 1, "temperature": "warm", "humidity": 40}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_telemetry_encodes_humidity_as_integer() {
        let reading = Telemetry {
            sensor_id: 7,
            room_id: 2,
            temperature: 21.5,
            humidity: 54.6,
            trigger: Some(CaptureTrigger::OnDemand),
        };
        let value: serde_json::Value = serde_json::from_slice(&encode_payload(&reading).unwrap()).unwrap();

        assert_eq!(value["humidity"], json!(55));
        assert_eq!(value["trigger"], json!("on-demand"));
    }

    #[test]
    fn test_status_message_wire_format() {
        let encoded = serde_json::to_value(StatusMessage::offline(7)).unwrap();
        assert_eq!(encoded, json!({"sensor_id": 7, "status": "offline"}));

        let decoded: StatusMessage =
            serde_json::from_value(json!({"sensor_id": 4, "status": "online"})).unwrap();
        assert_eq!(decoded, StatusMessage::online(4));
    }

    #[test]
    fn test_command_wire_format() {
        let all = serde_json::to_value(Command::capture(CommandTarget::All)).unwrap();
        assert_eq!(all, json!({"action": "capture", "sensor_id": "all"}));

        let one = serde_json::to_value(Command::capture(CommandTarget::Sensor(7))).unwrap();
        assert_eq!(one, json!({"action": "capture", "sensor_id": 7}));
    }

    #[test]
    fn test_command_decoding_rejects_unknown_target_word() {
        let result: Result<Command, _> =
            serde_json::from_value(json!({"action": "capture", "sensor_id": "some"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_command_target_matching() {
        assert!(CommandTarget::All.matches(1));
        assert!(CommandTarget::Sensor(7).matches(7));
        assert!(!CommandTarget::Sensor(7).matches(8));
    }

    #[test]
    fn test_command_target_from_requested() {
        assert_eq!(CommandTarget::from_requested(None), CommandTarget::All);
        assert_eq!(CommandTarget::from_requested(Some(0)), CommandTarget::All);
        assert_eq!(CommandTarget::from_requested(Some(-3)), CommandTarget::All);
        assert_eq!(
            CommandTarget::from_requested(Some(7)),
            CommandTarget::Sensor(7)
        );
    }
}

//! Per-device liveness record and status classification

use crate::protocol::Presence;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Liveness of one device, derived from time since its last reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Warning,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Warning => "warning",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// Silence limits for classification
///
/// Both bounds are inclusive on the healthier side: exactly
/// `warning_after` of silence is still Online.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusThresholds {
    pub warning_after: Duration,
    pub offline_after: Duration,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            warning_after: Duration::minutes(10),
            offline_after: Duration::minutes(30),
        }
    }
}

impl StatusThresholds {
    pub fn from_secs(warning_after_secs: u64, offline_after_secs: u64) -> Self {
        Self {
            warning_after: whole_seconds(warning_after_secs),
            offline_after: whole_seconds(offline_after_secs),
        }
    }

    /// Classify elapsed silence; negative elapsed (clock skew) is Online
    pub fn classify(&self, elapsed: Duration) -> DeviceStatus {
        if elapsed > self.offline_after {
            DeviceStatus::Offline
        } else if elapsed > self.warning_after {
            DeviceStatus::Warning
        } else {
            DeviceStatus::Online
        }
    }
}

fn whole_seconds(secs: u64) -> Duration {
    Duration::seconds(i64::from(u32::try_from(secs).unwrap_or(u32::MAX)))
}

/// Registry entry; only the monitor mutates it
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Device {
    pub sensor_id: u32,
    pub room_id: u32,
    pub room_name: String,
    pub last_seen: DateTime<Utc>,
    pub last_temperature: f64,
    pub last_humidity: f64,
    /// Running count of readings; never windowed
    pub readings_count_last_hour: u64,
    pub announced: Option<Presence>,
}

impl Device {
    pub fn new(
        sensor_id: u32,
        room_id: u32,
        room_name: String,
        temperature: f64,
        humidity: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id,
            room_id,
            room_name,
            last_seen: now,
            last_temperature: temperature,
            last_humidity: humidity,
            readings_count_last_hour: 1,
            announced: None,
        }
    }

    pub fn record(&mut self, temperature: f64, humidity: f64, now: DateTime<Utc>) {
        self.last_temperature = temperature;
        self.last_humidity = humidity;
        self.last_seen = now;
        self.readings_count_last_hour += 1;
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_seen)
    }

    pub fn status(&self, now: DateTime<Utc>, thresholds: &StatusThresholds) -> DeviceStatus {
        thresholds.classify(self.elapsed(now))
    }
}

//! Read-only health views handed out by the monitor
//!
//! Everything here is an owned copy built at snapshot time. Nothing refers
//! back into the registry.

use super::device::{Device, DeviceStatus, StatusThresholds};
use crate::protocol::Presence;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregate status of the whole fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalStatus {
    Healthy,
    Warning,
    Critical,
}

impl GlobalStatus {
    /// Critical if anything is offline, else Warning if anything is late
    pub fn from_counts(warning: usize, offline: usize) -> Self {
        if offline > 0 {
            GlobalStatus::Critical
        } else if warning > 0 {
            GlobalStatus::Warning
        } else {
            GlobalStatus::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalStatus::Healthy => "healthy",
            GlobalStatus::Warning => "warning",
            GlobalStatus::Critical => "critical",
        }
    }
}

/// One device as seen at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub sensor_id: u32,
    pub room_id: u32,
    pub room_name: String,
    pub status: DeviceStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_seen: DateTime<Utc>,
    pub last_temperature: f64,
    pub last_humidity: f64,
    #[serde(rename = "readings_last_hour")]
    pub readings_count_last_hour: u64,
    pub minutes_since_last_reading: f64,
    /// Last presence the node announced itself; informational only
    pub announced: Option<Presence>,
}

impl DeviceSnapshot {
    pub(crate) fn capture(device: &Device, now: DateTime<Utc>, thresholds: &StatusThresholds) -> Self {
        let elapsed = device.elapsed(now);
        Self {
            sensor_id: device.sensor_id,
            room_id: device.room_id,
            room_name: device.room_name.clone(),
            status: thresholds.classify(elapsed),
            last_seen: device.last_seen,
            last_temperature: device.last_temperature,
            last_humidity: device.last_humidity,
            readings_count_last_hour: device.readings_count_last_hour,
            minutes_since_last_reading: elapsed.num_milliseconds() as f64 / 60_000.0,
            announced: device.announced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total_devices: usize,
    pub online: usize,
    pub warning: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Attention item for a device that is not online
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub sensor_id: u32,
    pub room_name: String,
    pub severity: AlertSeverity,
    pub message: String,
}

impl Alert {
    fn for_device(device: &DeviceSnapshot) -> Option<Self> {
        let minutes = device.minutes_since_last_reading.floor() as i64;
        let (severity, message) = match device.status {
            DeviceStatus::Online => return None,
            DeviceStatus::Warning => (
                AlertSeverity::Warning,
                format!("No reading for {minutes} minutes"),
            ),
            DeviceStatus::Offline => (
                AlertSeverity::Critical,
                format!("Offline, no reading for {minutes} minutes"),
            ),
        };
        Some(Self {
            sensor_id: device.sensor_id,
            room_name: device.room_name.clone(),
            severity,
            message,
        })
    }
}

/// Point-in-time copy of the fleet's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub global_status: GlobalStatus,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_seconds")]
    pub last_update: DateTime<Utc>,
    pub summary: HealthSummary,
    /// Discovery order
    pub devices: Vec<DeviceSnapshot>,
    pub alerts: Vec<Alert>,
}

impl SystemHealth {
    /// Recompute every derived field from raw timestamps
    pub(crate) fn evaluate(
        devices: &[Device],
        now: DateTime<Utc>,
        thresholds: &StatusThresholds,
    ) -> Self {
        let devices: Vec<DeviceSnapshot> = devices
            .iter()
            .map(|device| DeviceSnapshot::capture(device, now, thresholds))
            .collect();

        let count = |status: DeviceStatus| devices.iter().filter(|d| d.status == status).count();
        let summary = HealthSummary {
            total_devices: devices.len(),
            online: count(DeviceStatus::Online),
            warning: count(DeviceStatus::Warning),
            offline: count(DeviceStatus::Offline),
        };
        let alerts = devices.iter().filter_map(Alert::for_device).collect();

        Self {
            global_status: GlobalStatus::from_counts(summary.warning, summary.offline),
            last_update: now,
            summary,
            devices,
            alerts,
        }
    }

    pub fn device(&self, sensor_id: u32) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.sensor_id == sensor_id)
    }
}

/// Compact status for quick checks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub status: GlobalStatus,
    pub devices: usize,
    pub online: usize,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl From<&SystemHealth> for StatusSummary {
    fn from(health: &SystemHealth) -> Self {
        Self {
            status: health.global_status,
            devices: health.summary.total_devices,
            online: health.summary.online,
            timestamp: health.last_update,
        }
    }
}

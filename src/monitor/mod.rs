//! Device liveness monitor
//!
//! Tracks every sensor node that has sent telemetry, classifies each one as
//! online, warning or offline from the time since its last reading, and
//! rolls that up into a fleet-wide status.
//!
//! The monitor is an explicit context object with an init/cleanup
//! lifecycle. Until [`LivenessMonitor::init`] runs (and after
//! [`LivenessMonitor::cleanup`]) every operation reports
//! [`MonitorError::NotInitialized`].
//!
//! ```
//! use std::sync::Arc;
//! use techtemp::monitor::{LivenessMonitor, ManualClock, MonitorSettings, DeviceStatus};
//!
//! # tokio_test::block_on(async {
//! let clock = Arc::new(ManualClock::starting_now());
//! let monitor = LivenessMonitor::new(MonitorSettings::default(), clock.clone());
//! monitor.init().await;
//!
//! monitor.update(7, 2, 21.5, 55.0).await.unwrap();
//! clock.advance(chrono::Duration::minutes(31));
//!
//! let health = monitor.snapshot().await.unwrap();
//! assert_eq!(health.device(7).unwrap().status, DeviceStatus::Offline);
//! # });
//! ```

pub mod clock;
pub mod device;
pub mod rooms;
pub mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{DeviceStatus, StatusThresholds};
pub use rooms::RoomDirectory;
pub use snapshot::{
    Alert, AlertSeverity, DeviceSnapshot, GlobalStatus, HealthSummary, StatusSummary,
    SystemHealth,
};

use crate::config::TechTempConfig;
use crate::protocol::Presence;
use chrono::{DateTime, Utc};
use device::Device;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Monitor errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Monitor not initialized")]
    NotInitialized,
}

/// What an update did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First reading from this sensor; a slot was allocated
    Registered,
    Updated,
    /// Registry full; the reading was discarded
    Dropped,
}

/// Capacity, thresholds and room names
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub max_devices: usize,
    pub thresholds: StatusThresholds,
    pub rooms: RoomDirectory,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_devices: 10,
            thresholds: StatusThresholds::default(),
            rooms: RoomDirectory::builtin(),
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &TechTempConfig) -> Self {
        Self {
            max_devices: config.monitor.max_devices,
            thresholds: StatusThresholds::from_secs(
                config.monitor.warning_after_secs,
                config.monitor.offline_after_secs,
            ),
            rooms: RoomDirectory::with_overrides(config.room_overrides()),
        }
    }
}

#[derive(Debug)]
struct Registry {
    /// Discovery order; slots are never freed
    devices: Vec<Device>,
    last_update: DateTime<Utc>,
    last_global: GlobalStatus,
}

/// Bounded registry of known devices
#[derive(Debug)]
pub struct LivenessMonitor {
    settings: MonitorSettings,
    clock: Arc<dyn Clock>,
    registry: RwLock<Option<Registry>>,
}

impl LivenessMonitor {
    pub fn new(settings: MonitorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            registry: RwLock::new(None),
        }
    }

    pub fn with_system_clock(settings: MonitorSettings) -> Self {
        Self::new(settings, Arc::new(SystemClock))
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Current time according to the monitor's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Allocate the registry; a second call keeps the existing one
    pub async fn init(&self) {
        let mut registry = self.registry.write().await;
        if registry.is_some() {
            debug!("Liveness monitor already initialized");
            return;
        }
        *registry = Some(Registry {
            devices: Vec::with_capacity(self.settings.max_devices),
            last_update: self.clock.now(),
            last_global: GlobalStatus::Healthy,
        });
        info!(
            max_devices = self.settings.max_devices,
            "Liveness monitor initialized"
        );
    }

    /// Release the registry
    pub async fn cleanup(&self) {
        if self.registry.write().await.take().is_some() {
            info!("Liveness monitor cleaned up");
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.registry.read().await.is_some()
    }

    /// Record a reading; the only place device state changes
    pub async fn update(
        &self,
        sensor_id: u32,
        room_id: u32,
        temperature: f64,
        humidity: f64,
    ) -> Result<UpdateOutcome, MonitorError> {
        let mut guard = self.registry.write().await;
        let registry = guard.as_mut().ok_or(MonitorError::NotInitialized)?;
        let now = self.clock.now();

        let device_count = registry.devices.len();
        let outcome = match registry.devices.iter_mut().find(|d| d.sensor_id == sensor_id) {
            Some(device) => {
                device.record(temperature, humidity, now);
                UpdateOutcome::Updated
            }
            None if device_count >= self.settings.max_devices => {
                warn!(
                    sensor_id,
                    max_devices = self.settings.max_devices,
                    "Device registry full, reading dropped"
                );
                return Ok(UpdateOutcome::Dropped);
            }
            None => {
                let room_name = self.settings.rooms.resolve(room_id);
                info!(sensor_id, room_id, room_name = %room_name, "New device registered");
                registry.devices.push(Device::new(
                    sensor_id,
                    room_id,
                    room_name,
                    temperature,
                    humidity,
                    now,
                ));
                UpdateOutcome::Registered
            }
        };

        debug!(sensor_id, temperature, humidity, "Device reading recorded");
        registry.last_update = now;
        self.refresh_global(registry, now);
        Ok(outcome)
    }

    /// Note a node's self-announced presence; does not touch liveness
    ///
    /// Returns false when the sensor is not registered.
    pub async fn record_presence(
        &self,
        sensor_id: u32,
        presence: Presence,
    ) -> Result<bool, MonitorError> {
        let mut guard = self.registry.write().await;
        let registry = guard.as_mut().ok_or(MonitorError::NotInitialized)?;

        match registry.devices.iter_mut().find(|d| d.sensor_id == sensor_id) {
            Some(device) => {
                device.announced = Some(presence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Point-in-time copy with every status recomputed for now
    pub async fn snapshot(&self) -> Result<SystemHealth, MonitorError> {
        let guard = self.registry.read().await;
        let registry = guard.as_ref().ok_or(MonitorError::NotInitialized)?;
        Ok(SystemHealth::evaluate(
            &registry.devices,
            self.clock.now(),
            &self.settings.thresholds,
        ))
    }

    pub async fn device_count(&self) -> Result<usize, MonitorError> {
        let guard = self.registry.read().await;
        let registry = guard.as_ref().ok_or(MonitorError::NotInitialized)?;
        Ok(registry.devices.len())
    }

    /// Time of the last accepted reading (or of init)
    pub async fn last_update(&self) -> Result<DateTime<Utc>, MonitorError> {
        let guard = self.registry.read().await;
        let registry = guard.as_ref().ok_or(MonitorError::NotInitialized)?;
        Ok(registry.last_update)
    }

    fn refresh_global(&self, registry: &mut Registry, now: DateTime<Utc>) {
        let health = SystemHealth::evaluate(&registry.devices, now, &self.settings.thresholds);
        if health.global_status != registry.last_global {
            info!(
                from = registry.last_global.as_str(),
                to = health.global_status.as_str(),
                online = health.summary.online,
                warning = health.summary.warning,
                offline = health.summary.offline,
                "System status changed"
            );
            registry.last_global = health.global_status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn monitor_with_clock(max_devices: usize) -> (LivenessMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let settings = MonitorSettings {
            max_devices,
            ..MonitorSettings::default()
        };
        (LivenessMonitor::new(settings, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_operations_before_init_report_not_initialized() {
        let (monitor, _clock) = monitor_with_clock(10);

        assert_eq!(
            monitor.update(1, 1, 20.0, 50.0).await,
            Err(MonitorError::NotInitialized)
        );
        assert_eq!(monitor.snapshot().await, Err(MonitorError::NotInitialized));
        assert_eq!(
            monitor.record_presence(1, Presence::Online).await,
            Err(MonitorError::NotInitialized)
        );
        assert_eq!(monitor.device_count().await, Err(MonitorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_operations_after_cleanup_report_not_initialized() {
        let (monitor, _clock) = monitor_with_clock(10);
        monitor.init().await;
        monitor.update(1, 1, 20.0, 50.0).await.unwrap();

        monitor.cleanup().await;
        monitor.cleanup().await;

        assert!(!monitor.is_initialized().await);
        assert_eq!(monitor.snapshot().await, Err(MonitorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (monitor, _clock) = monitor_with_clock(10);
        monitor.init().await;
        monitor.update(1, 1, 20.0, 50.0).await.unwrap();

        monitor.init().await;
        assert_eq!(monitor.device_count().await, Ok(1));
    }

    #[tokio::test]
    async fn test_update_registers_then_updates() {
        let (monitor, clock) = monitor_with_clock(10);
        monitor.init().await;

        assert_eq!(
            monitor.update(7, 2, 21.5, 55.0).await,
            Ok(UpdateOutcome::Registered)
        );
        clock.advance(Duration::minutes(5));
        assert_eq!(
            monitor.update(7, 2, 22.0, 53.0).await,
            Ok(UpdateOutcome::Updated)
        );

        let health = monitor.snapshot().await.unwrap();
        let device = health.device(7).unwrap();
        assert_eq!(device.room_name, "eetkamer");
        assert_eq!(device.last_temperature, 22.0);
        assert_eq!(device.last_humidity, 53.0);
        assert_eq!(device.last_seen, clock.now());
        assert_eq!(device.readings_count_last_hour, 2);
    }

    #[tokio::test]
    async fn test_room_name_resolved_once_at_registration() {
        let (monitor, _clock) = monitor_with_clock(10);
        monitor.init().await;

        monitor.update(3, 1, 20.0, 40.0).await.unwrap();
        // Later readings claiming another room do not rename the device
        monitor.update(3, 4, 20.0, 40.0).await.unwrap();

        let health = monitor.snapshot().await.unwrap();
        assert_eq!(health.device(3).unwrap().room_name, "salon");
        assert_eq!(health.device(3).unwrap().room_id, 1);
    }

    #[tokio::test]
    async fn test_full_registry_drops_new_devices() {
        let (monitor, _clock) = monitor_with_clock(2);
        monitor.init().await;

        monitor.update(1, 1, 20.0, 40.0).await.unwrap();
        monitor.update(2, 2, 21.0, 41.0).await.unwrap();
        assert_eq!(
            monitor.update(3, 3, 22.0, 42.0).await,
            Ok(UpdateOutcome::Dropped)
        );
        // Known devices still update
        assert_eq!(
            monitor.update(1, 1, 19.0, 39.0).await,
            Ok(UpdateOutcome::Updated)
        );

        let health = monitor.snapshot().await.unwrap();
        assert_eq!(health.summary.total_devices, 2);
        assert!(health.device(3).is_none());
        assert_eq!(health.device(1).unwrap().last_temperature, 19.0);
    }

    #[tokio::test]
    async fn test_status_recomputed_on_every_snapshot() {
        let (monitor, clock) = monitor_with_clock(10);
        monitor.init().await;
        monitor.update(7, 2, 21.5, 55.0).await.unwrap();

        assert_eq!(
            monitor.snapshot().await.unwrap().global_status,
            GlobalStatus::Healthy
        );

        clock.advance(Duration::minutes(11));
        let health = monitor.snapshot().await.unwrap();
        assert_eq!(health.device(7).unwrap().status, DeviceStatus::Warning);
        assert_eq!(health.global_status, GlobalStatus::Warning);

        clock.advance(Duration::minutes(20));
        let health = monitor.snapshot().await.unwrap();
        assert_eq!(health.device(7).unwrap().status, DeviceStatus::Offline);
        assert_eq!(health.global_status, GlobalStatus::Critical);

        monitor.update(7, 2, 21.0, 54.0).await.unwrap();
        assert_eq!(
            monitor.snapshot().await.unwrap().global_status,
            GlobalStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_presence_is_informational() {
        let (monitor, clock) = monitor_with_clock(10);
        monitor.init().await;

        assert_eq!(monitor.record_presence(7, Presence::Online).await, Ok(false));

        monitor.update(7, 2, 21.5, 55.0).await.unwrap();
        assert_eq!(monitor.record_presence(7, Presence::Offline).await, Ok(true));

        let health = monitor.snapshot().await.unwrap();
        let device = health.device(7).unwrap();
        assert_eq!(device.announced, Some(Presence::Offline));
        assert_eq!(device.status, DeviceStatus::Online);

        clock.advance(Duration::minutes(31));
        assert_eq!(monitor.record_presence(7, Presence::Online).await, Ok(true));
        assert_eq!(
            monitor.snapshot().await.unwrap().device(7).unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let (monitor, _clock) = monitor_with_clock(10);
        monitor.init().await;
        monitor.update(7, 2, 21.5, 55.0).await.unwrap();

        let mut health = monitor.snapshot().await.unwrap();
        health.devices[0].last_temperature = -40.0;

        assert_eq!(
            monitor.snapshot().await.unwrap().device(7).unwrap().last_temperature,
            21.5
        );
    }

    #[tokio::test]
    async fn test_settings_from_config() {
        let config = TechTempConfig::test_config();
        let settings = MonitorSettings::from_config(&config);
        assert_eq!(settings.max_devices, 3);
        assert_eq!(settings.thresholds, StatusThresholds::default());
        assert_eq!(settings.rooms.resolve(4), "bureau_achter");
    }
}

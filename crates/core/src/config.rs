//! Core configuration: device profile plus supervision policy parameters.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::{OXIMETER_SERVICE, TELEMETRY_CHARACTERISTIC};
use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GATT service that carries the telemetry characteristic.
    pub service_uuid: Uuid,
    /// Notify characteristic the telemetry stream arrives on.
    pub characteristic_uuid: Uuid,
    /// How long a user-initiated scan runs before stopping itself.
    pub scan_timeout_secs: u64,
    /// Duration of the short rescan after reconnect attempts are exhausted.
    pub rescan_timeout_secs: u64,
    /// Bound on a single link-level connect.
    pub connect_timeout_secs: u64,
    /// Settling period between link-up and service discovery.
    pub settle_delay_ms: u64,
    /// Grace period for a disconnect confirmation before forcing the close.
    pub disconnect_grace_ms: u64,
    /// How often discovered peripherals are harvested during a scan.
    pub scan_poll_ms: u64,
    /// Automatic reconnect attempts before falling back to a rescan.
    pub max_reconnect_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_uuid: OXIMETER_SERVICE,
            characteristic_uuid: TELEMETRY_CHARACTERISTIC,
            scan_timeout_secs: 20,
            rescan_timeout_secs: 5,
            connect_timeout_secs: 10,
            settle_delay_ms: 1000,
            disconnect_grace_ms: 2000,
            scan_poll_ms: 1000,
            max_reconnect_attempts: 1,
        }
    }
}

impl Config {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn rescan_timeout(&self) -> Duration {
        Duration::from_secs(self.rescan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn scan_poll(&self) -> Duration {
        Duration::from_millis(self.scan_poll_ms)
    }

    /// Point the manager at a different service/characteristic pair.
    pub fn with_device_profile(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service_uuid = service;
        self.characteristic_uuid = characteristic;
        self
    }

    pub fn with_scan_timeout(mut self, secs: u64) -> Self {
        self.scan_timeout_secs = secs;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.scan_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "scan timeout must be at least one second".into(),
            ));
        }
        if self.rescan_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "rescan timeout must be at least one second".into(),
            ));
        }
        if self.scan_poll_ms < 100 {
            return Err(CoreError::InvalidConfig(
                "scan poll interval must be at least 100 ms".into(),
            ));
        }
        if self.service_uuid == self.characteristic_uuid {
            return Err(CoreError::InvalidConfig(
                "service and characteristic UUIDs must differ".into(),
            ));
        }
        Ok(())
    }

    /// Platform-default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxilink")
            .join("config.toml")
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the default config file, falling back to defaults when absent.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from_file(&path).unwrap_or_default()
        } else {
            Self::default()
        }
    }
}

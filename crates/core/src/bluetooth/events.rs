//! Event types and connection status for the oximeter manager.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::environment::Precondition;
use crate::protocol::Reading;

/// Lifecycle of the single supervised peripheral connection.
///
/// Exactly one value holds at any instant; the manager publishes changes
/// through a watch channel so consumers read snapshots without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Subscribed,
    DisconnectedByUser,
    DisconnectedError,
    Reconnecting,
    PermissionsMissing,
    AdapterDisabled,
    LocationDisabled,
    DeviceNotFound,
    ServiceNotFound,
    CharacteristicNotFound,
    SubscribeFailed,
    Failed,
}

impl ConnectionStatus {
    /// True while a connection attempt or an established link is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Subscribed | Self::Reconnecting
        )
    }

    /// True for states that report a failure to the user.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::DisconnectedError
                | Self::PermissionsMissing
                | Self::AdapterDisabled
                | Self::LocationDisabled
                | Self::DeviceNotFound
                | Self::ServiceNotFound
                | Self::CharacteristicNotFound
                | Self::SubscribeFailed
                | Self::Failed
        )
    }
}

impl From<Precondition> for ConnectionStatus {
    fn from(missing: Precondition) -> Self {
        match missing {
            Precondition::AdapterDisabled => Self::AdapterDisabled,
            Precondition::PermissionsMissing => Self::PermissionsMissing,
            Precondition::LocationDisabled => Self::LocationDisabled,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected, preparing telemetry",
            Self::Subscribed => "subscribed, streaming",
            Self::DisconnectedByUser => "disconnected",
            Self::DisconnectedError => "connection lost",
            Self::Reconnecting => "reconnecting",
            Self::PermissionsMissing => "Bluetooth permissions missing",
            Self::AdapterDisabled => "Bluetooth adapter disabled",
            Self::LocationDisabled => "location services disabled",
            Self::DeviceNotFound => "device not found",
            Self::ServiceNotFound => "oximeter service not found",
            Self::CharacteristicNotFound => "telemetry characteristic not found",
            Self::SubscribeFailed => "could not enable telemetry notifications",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// A peripheral seen during the current scan session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    /// Hardware address, the deduplication key.
    pub address: String,
    /// Advertised name, if the device sent one.
    pub name: Option<String>,
    /// Signal strength in dBm at the last sighting.
    pub rssi: i16,
    /// When the device was last observed.
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeripheral {
    /// Advertised name or the address as a fallback.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum OximeterEvent {
    /// A new peripheral appeared during a scan.
    DeviceDiscovered {
        address: String,
        name: Option<String>,
        rssi: i16,
    },
    /// The connection status changed.
    StatusChanged { status: ConnectionStatus },
    /// A telemetry frame decoded into a fresh reading.
    ReadingUpdated { reading: Reading },
    /// A one-shot human-readable notification.
    Notice { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_maps_to_specific_status() {
        assert_eq!(
            ConnectionStatus::from(Precondition::AdapterDisabled),
            ConnectionStatus::AdapterDisabled
        );
        assert_eq!(
            ConnectionStatus::from(Precondition::PermissionsMissing),
            ConnectionStatus::PermissionsMissing
        );
        assert_eq!(
            ConnectionStatus::from(Precondition::LocationDisabled),
            ConnectionStatus::LocationDisabled
        );
    }

    #[test]
    fn status_classification() {
        assert!(ConnectionStatus::Reconnecting.is_active());
        assert!(!ConnectionStatus::Scanning.is_active());
        assert!(ConnectionStatus::SubscribeFailed.is_error());
        assert!(!ConnectionStatus::DisconnectedByUser.is_error());
    }

    #[test]
    fn display_name_falls_back_to_address() {
        let device = DiscoveredPeripheral {
            address: "AA:BB:CC:DD:EE:01".into(),
            name: None,
            rssi: -60,
            last_seen: Utc::now(),
        };
        assert_eq!(device.display_name(), "AA:BB:CC:DD:EE:01");
    }
}

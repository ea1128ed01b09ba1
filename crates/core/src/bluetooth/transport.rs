//! Link-layer abstraction over the platform BLE stack.
//!
//! The manager drives all radio work through these traits, so the hardware
//! can be replaced by a scripted in-memory implementation in tests. The
//! production implementation wraps btleplug.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default bound on a single link-level connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures raised by the link layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Bluetooth adapter is not available")]
    AdapterUnavailable,
    #[error("no peripheral with address {0} is in range")]
    DeviceNotFound(String),
    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },
    #[error("link operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("peripheral link is closed")]
    NotConnected,
    #[error("link operation failed: {0}")]
    Operation(String),
}

/// One advertisement observed while scanning.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Stream of raw telemetry frames pushed by the peripheral.
pub type NotificationStream = BoxStream<'static, Bytes>;

/// Radio primitives the connection manager consumes.
///
/// No other component may touch the radio; everything goes through the
/// manager, which holds the transport behind this trait.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Begin peripheral discovery on the adapter.
    async fn start_scan(&self) -> Result<(), LinkError>;

    /// Stop peripheral discovery.
    async fn stop_scan(&self) -> Result<(), LinkError>;

    /// Snapshot of every advertisement seen since the scan started.
    async fn advertisements(&self) -> Result<Vec<Advertisement>, LinkError>;

    /// Resolve an address and establish the radio link.
    async fn connect(&self, address: &str) -> Result<Box<dyn LinkHandle>, LinkError>;
}

/// An established link to exactly one peripheral.
///
/// The handle is owned by the manager's session task for its whole life and
/// closed exactly once; callers must not hold it past `disconnect`.
#[async_trait]
pub trait LinkHandle: Send + Sync {
    fn address(&self) -> &str;

    /// Run GATT service discovery. Must complete before lookups.
    async fn discover_services(&self) -> Result<(), LinkError>;

    /// Whether a service with this UUID was discovered.
    fn has_service(&self, service: Uuid) -> bool;

    /// Whether this characteristic exists under the given service.
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Enable notifications on the characteristic (client-configuration
    /// descriptor write included).
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError>;

    /// Stream of raw frames arriving on the subscribed characteristic.
    async fn notifications(&self, characteristic: Uuid) -> Result<NotificationStream, LinkError>;

    async fn is_connected(&self) -> bool;

    /// Close the link. The handle is unusable afterwards.
    async fn disconnect(&self) -> Result<(), LinkError>;
}

/// Production transport backed by the first platform adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    connect_timeout: Duration,
}

impl BtleplugTransport {
    /// Grab the first Bluetooth adapter on the host.
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|_| LinkError::AdapterUnavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| LinkError::AdapterUnavailable)?
            .into_iter()
            .next()
            .ok_or(LinkError::AdapterUnavailable)?;
        debug!("using Bluetooth adapter {:?}", adapter.adapter_info().await);
        Ok(Self {
            adapter,
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Resolve an address (or platform peripheral id) to a peripheral seen
    /// by the adapter.
    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, LinkError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| LinkError::Operation(e.to_string()))?;

        for peripheral in peripherals {
            // macOS hides hardware addresses, so fall back to the platform id.
            if peripheral.id().to_string().eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties
                    .address
                    .to_string()
                    .eq_ignore_ascii_case(address)
                {
                    return Ok(peripheral);
                }
            }
        }
        Err(LinkError::DeviceNotFound(address.to_owned()))
    }
}

#[async_trait]
impl LinkTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<(), LinkError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| LinkError::Operation(format!("failed to start scan: {e}")))
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| LinkError::Operation(format!("failed to stop scan: {e}")))
    }

    async fn advertisements(&self) -> Result<Vec<Advertisement>, LinkError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| LinkError::Operation(e.to_string()))?;

        let mut seen = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            if let Ok(Some(properties)) = peripheral.properties().await {
                seen.push(Advertisement {
                    address: properties.address.to_string(),
                    name: properties.local_name,
                    rssi: properties.rssi,
                });
            }
        }
        Ok(seen)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn LinkHandle>, LinkError> {
        let peripheral = self.find_peripheral(address).await?;

        timeout(self.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| LinkError::Timeout(self.connect_timeout))?
            .map_err(|e| LinkError::ConnectFailed {
                address: address.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(BtleplugHandle {
            peripheral,
            address: address.to_owned(),
        }))
    }
}

struct BtleplugHandle {
    peripheral: Peripheral,
    address: String,
}

impl BtleplugHandle {
    fn find_characteristic(&self, characteristic: Uuid) -> Option<btleplug::api::Characteristic> {
        self.peripheral
            .services()
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
            .cloned()
    }
}

#[async_trait]
impl LinkHandle for BtleplugHandle {
    fn address(&self) -> &str {
        &self.address
    }

    async fn discover_services(&self) -> Result<(), LinkError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::Operation(format!("service discovery failed: {e}")))
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.peripheral.services().iter().any(|s| s.uuid == service)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.peripheral
            .services()
            .iter()
            .filter(|s| s.uuid == service)
            .any(|s| s.characteristics.iter().any(|c| c.uuid == characteristic))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError> {
        let found = self.find_characteristic(characteristic).ok_or_else(|| {
            LinkError::Operation(format!("characteristic {characteristic} not discovered"))
        })?;

        if !found.properties.contains(CharPropFlags::NOTIFY) {
            return Err(LinkError::Operation(format!(
                "characteristic {characteristic} does not support notifications"
            )));
        }

        self.peripheral
            .subscribe(&found)
            .await
            .map_err(|e| LinkError::Operation(format!("subscribe failed: {e}")))
    }

    async fn notifications(&self, characteristic: Uuid) -> Result<NotificationStream, LinkError> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| LinkError::Operation(format!("notification stream failed: {e}")))?;

        Ok(stream
            .filter_map(move |n| async move {
                (n.uuid == characteristic).then(|| Bytes::from(n.value))
            })
            .boxed())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("peripheral disconnect reported an error: {e}");
            return Err(LinkError::Operation(e.to_string()));
        }
        Ok(())
    }
}

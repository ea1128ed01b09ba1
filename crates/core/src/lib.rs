//! Oxilink core library.
//!
//! Connectivity core for a wireless pulse-oximeter: BLE device discovery, a
//! supervised single-peripheral link with bounded automatic recovery, and
//! decoding of the device's 5-byte telemetry stream into physiological
//! readings.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod protocol;

pub use bluetooth::{
    BtleplugTransport, ConnectionStatus, DiscoveredPeripheral, EnvironmentSource, LinkHandle,
    LinkTransport, OximeterEvent, OximeterManager, Precondition, StaticEnvironment,
    SystemEnvironment,
};
pub use config::Config;
pub use error::{CoreError, Result};
pub use protocol::{decode_frame, FrameError, Reading};

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

/// Top-level handle wiring the platform transport and environment signals to
/// the connection manager.
pub struct OximeterCore {
    manager: OximeterManager,
    config: Config,
}

impl OximeterCore {
    /// Construct against the platform Bluetooth stack.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let environment = Arc::new(SystemEnvironment::probe().await);
        let transport = Arc::new(
            BtleplugTransport::new()
                .await?
                .with_connect_timeout(config.connect_timeout()),
        );
        info!("oximeter core initialized");
        Ok(Self {
            manager: OximeterManager::new(transport, environment, config.clone()),
            config,
        })
    }

    /// Construct with injected collaborators, for tests and embedding hosts
    /// that provide their own link layer or permission tracking.
    pub fn with_parts(
        transport: Arc<dyn LinkTransport>,
        environment: Arc<dyn EnvironmentSource>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            manager: OximeterManager::new(transport, environment, config.clone()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &OximeterManager {
        &self.manager
    }

    pub fn start_scan(&self) -> Result<()> {
        self.manager.start_scan()
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.manager.stop_scan()
    }

    pub fn connect(&self, address: impl Into<String>) -> Result<()> {
        self.manager.connect(address)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.manager.disconnect()
    }

    pub fn clear_discovered(&self) -> Result<()> {
        self.manager.clear_discovered()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.watch_status()
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.manager.latest_reading()
    }

    pub fn watch_readings(&self) -> watch::Receiver<Option<Reading>> {
        self.manager.watch_readings()
    }

    pub async fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.manager.discovered().await
    }

    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<OximeterEvent>> {
        self.manager.take_event_receiver().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

//! Bluetooth connectivity: environment gating, discovery aggregation, the
//! link transport seam, and the supervised connection state machine.

pub mod environment;
pub mod events;
pub mod manager;
pub mod reconnect;
pub mod scanner;
pub mod transport;

use uuid::Uuid;

/// Vendor UART-style service the oximeter streams telemetry through.
pub const OXIMETER_SERVICE: Uuid = Uuid::from_u128(0x49535343_FE7D_4AE5_8FA9_9FAFD205E455);

/// Notify characteristic carrying the 5-byte telemetry packets.
pub const TELEMETRY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x49535343_1E4D_4BD9_BA61_23C647249616);

pub use environment::{
    check_ready, EnvironmentSource, Precondition, StaticEnvironment, SystemEnvironment,
};
pub use events::{ConnectionStatus, DiscoveredPeripheral, OximeterEvent};
pub use manager::OximeterManager;
pub use reconnect::{ReconnectContext, ReconnectPolicy, RecoveryAction};
pub use scanner::ScanResults;
pub use transport::{
    Advertisement, BtleplugTransport, LinkError, LinkHandle, LinkTransport, NotificationStream,
};

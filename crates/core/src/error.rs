//! Unified error type for the oximeter connectivity core.

use thiserror::Error;

use crate::bluetooth::environment::Precondition;
use crate::bluetooth::transport::LinkError;
use crate::protocol::FrameError;

/// The error type returned by the public core API.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A radio precondition is not satisfied.
    #[error(transparent)]
    Precondition(#[from] Precondition),

    /// The link layer failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A telemetry buffer could not be decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Configuration values are invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading or writing the configuration file failed.
    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// The manager worker task has stopped and no longer accepts commands.
    #[error("connection manager is no longer running")]
    ManagerStopped,
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// True for errors that only require the user to fix a system toggle.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// True when retrying the same operation later could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Link(LinkError::DeviceNotFound(_))
                | Self::Link(LinkError::ConnectFailed { .. })
                | Self::Link(LinkError::Timeout(_))
        )
    }
}

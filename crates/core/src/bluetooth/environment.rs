//! Readiness gate for radio operations.
//!
//! Scanning and connecting are refused until the adapter is powered, runtime
//! permissions are granted, and location services are enabled. The gate is a
//! pure predicate over an injected signal source, so tests can exercise every
//! failure combination without hardware.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::debug;

/// A single missing precondition, reported to the caller by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("Bluetooth adapter is disabled or missing")]
    AdapterDisabled,
    #[error("Bluetooth permissions have not been granted")]
    PermissionsMissing,
    #[error("location services are disabled")]
    LocationDisabled,
}

/// Source of the environment signals the gate combines.
pub trait EnvironmentSource: Send + Sync {
    fn adapter_enabled(&self) -> bool;
    fn permissions_granted(&self) -> bool;
    fn location_enabled(&self) -> bool;
}

/// Combine the environment signals into a single readiness check.
///
/// Signals are checked in a fixed order (adapter, permissions, location) so
/// the reported precondition is deterministic when several are down at once.
pub fn check_ready(env: &dyn EnvironmentSource) -> Result<(), Precondition> {
    if !env.adapter_enabled() {
        return Err(Precondition::AdapterDisabled);
    }
    if !env.permissions_granted() {
        return Err(Precondition::PermissionsMissing);
    }
    if !env.location_enabled() {
        return Err(Precondition::LocationDisabled);
    }
    Ok(())
}

/// Environment signals probed from the host Bluetooth stack.
///
/// Desktop platforms expose no separate permission or location toggles, so
/// those signals stay granted; the adapter signal is captured at probe time
/// and can be refreshed on demand.
pub struct SystemEnvironment {
    adapter_enabled: AtomicBool,
}

impl SystemEnvironment {
    /// Probe the platform adapter and capture the current signal state.
    pub async fn probe() -> Self {
        let enabled = Self::adapter_present().await;
        debug!(enabled, "probed Bluetooth adapter");
        Self {
            adapter_enabled: AtomicBool::new(enabled),
        }
    }

    /// Re-check the adapter and update the cached signal.
    pub async fn refresh(&self) -> bool {
        let enabled = Self::adapter_present().await;
        self.adapter_enabled.store(enabled, Ordering::Relaxed);
        enabled
    }

    async fn adapter_present() -> bool {
        use btleplug::api::Manager as _;

        match btleplug::platform::Manager::new().await {
            Ok(manager) => manager
                .adapters()
                .await
                .map(|adapters| !adapters.is_empty())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl EnvironmentSource for SystemEnvironment {
    fn adapter_enabled(&self) -> bool {
        self.adapter_enabled.load(Ordering::Relaxed)
    }

    fn permissions_granted(&self) -> bool {
        true
    }

    fn location_enabled(&self) -> bool {
        true
    }
}

/// Fixed environment signals, for embedding hosts that track their own
/// permission state and for tests.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    pub adapter_enabled: bool,
    pub permissions_granted: bool,
    pub location_enabled: bool,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            adapter_enabled: true,
            permissions_granted: true,
            location_enabled: true,
        }
    }
}

impl EnvironmentSource for StaticEnvironment {
    fn adapter_enabled(&self) -> bool {
        self.adapter_enabled
    }

    fn permissions_granted(&self) -> bool {
        self.permissions_granted
    }

    fn location_enabled(&self) -> bool {
        self.location_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_when_all_signals_up() {
        assert_eq!(check_ready(&StaticEnvironment::default()), Ok(()));
    }

    #[test]
    fn reports_each_missing_precondition() {
        let env = StaticEnvironment {
            adapter_enabled: false,
            ..Default::default()
        };
        assert_eq!(check_ready(&env), Err(Precondition::AdapterDisabled));

        let env = StaticEnvironment {
            permissions_granted: false,
            ..Default::default()
        };
        assert_eq!(check_ready(&env), Err(Precondition::PermissionsMissing));

        let env = StaticEnvironment {
            location_enabled: false,
            ..Default::default()
        };
        assert_eq!(check_ready(&env), Err(Precondition::LocationDisabled));
    }

    #[test]
    fn adapter_outranks_other_failures() {
        let env = StaticEnvironment {
            adapter_enabled: false,
            permissions_granted: false,
            location_enabled: false,
        };
        assert_eq!(check_ready(&env), Err(Precondition::AdapterDisabled));
    }
}

//! Aggregation of discovery events into a deduplicated device list.

use chrono::{DateTime, Utc};

use super::events::DiscoveredPeripheral;

/// Discovered peripherals for the current scan session, keyed by address.
///
/// The first sighting of an address appends a record, so display order is
/// stable; later sightings refresh the volatile fields in place instead of
/// duplicating the entry. The whole set is cleared when a new scan starts.
#[derive(Debug, Default)]
pub struct ScanResults {
    devices: Vec<DiscoveredPeripheral>,
}

impl ScanResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one discovery event. Returns `true` when the address is new.
    pub fn record(
        &mut self,
        address: &str,
        name: Option<&str>,
        rssi: i16,
        seen_at: DateTime<Utc>,
    ) -> bool {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.address == address) {
            existing.rssi = rssi;
            existing.last_seen = seen_at;
            false
        } else {
            self.devices.push(DiscoveredPeripheral {
                address: address.to_owned(),
                name: name.map(str::to_owned),
                rssi,
                last_seen: seen_at,
            });
            true
        }
    }

    /// Forget everything from the previous scan session.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.iter().any(|d| d.address == address)
    }

    /// Snapshot of the current list in first-seen order.
    pub fn snapshot(&self) -> Vec<DiscoveredPeripheral> {
        self.devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn first_sighting_inserts() {
        let mut results = ScanResults::new();
        assert!(results.record("AA:BB:CC:DD:EE:01", Some("Oximeter"), -60, seen()));
        assert_eq!(results.len(), 1);
        assert!(results.contains("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn re_sighting_updates_in_place() {
        let mut results = ScanResults::new();
        results.record("AA:BB:CC:DD:EE:01", Some("Oximeter"), -60, seen());
        assert!(!results.record("AA:BB:CC:DD:EE:01", Some("Oximeter"), -48, seen()));

        let snapshot = results.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].rssi, -48);
        assert_eq!(snapshot[0].name.as_deref(), Some("Oximeter"));
    }

    #[test]
    fn preserves_first_seen_order() {
        let mut results = ScanResults::new();
        results.record("AA:BB:CC:DD:EE:01", None, -60, seen());
        results.record("AA:BB:CC:DD:EE:02", None, -70, seen());
        results.record("AA:BB:CC:DD:EE:03", None, -80, seen());
        // Re-observing the first device must not move it.
        results.record("AA:BB:CC:DD:EE:01", None, -50, seen());

        let addresses: Vec<_> = results
            .snapshot()
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(
            addresses,
            ["AA:BB:CC:DD:EE:01", "AA:BB:CC:DD:EE:02", "AA:BB:CC:DD:EE:03"]
        );
    }

    #[test]
    fn clear_empties_the_session() {
        let mut results = ScanResults::new();
        results.record("AA:BB:CC:DD:EE:01", None, -60, seen());
        results.clear();
        assert!(results.is_empty());
        // A cleared address counts as new again.
        assert!(results.record("AA:BB:CC:DD:EE:01", None, -60, seen()));
    }
}

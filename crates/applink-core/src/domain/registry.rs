//! The device registry: the host's authoritative, ordered collection of
//! currently attached devices.
//!
//! Discovery dispatchers add and remove devices; the session server reads
//! them to validate handshakes and subscribes to removals so it can evict
//! the clients of a device that disappears.
//!
//! Reads are snapshot-consistent: `list_devices` clones the collection under
//! a read lock, so a concurrent discovery mutation never invalidates an
//! iteration in progress. Observer callbacks run after the write lock is
//! released; a callback may freely call back into the registry.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::device::Device;

type DeviceHandler = Arc<dyn Fn(&Device) + Send + Sync>;

/// Ordered collection of known devices, keyed by serial.
///
/// Serial uniqueness is an invariant: `add_device` with an already-present
/// serial replaces the existing record in place rather than appending a
/// duplicate, and does not fire a second `added` callback.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Device>>,
    added_handlers: RwLock<Vec<DeviceHandler>>,
    removed_handlers: RwLock<Vec<DeviceHandler>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device, replacing any existing record with the same serial.
    ///
    /// Fires the `added` callbacks only for a genuinely new serial.
    pub fn add_device(&self, device: Device) {
        let is_new = {
            let mut devices = self.devices.write();
            match devices.iter_mut().find(|d| d.serial == device.serial) {
                Some(existing) => {
                    *existing = device.clone();
                    false
                }
                None => {
                    devices.push(device.clone());
                    true
                }
            }
        };

        if is_new {
            info!(serial = %device.serial, platform = ?device.platform, "device attached");
            for handler in self.handlers_snapshot(&self.added_handlers) {
                handler(&device);
            }
        } else {
            debug!(serial = %device.serial, "device record refreshed");
        }
    }

    /// Removes the device with the given serial, returning its record.
    ///
    /// Fires the `removed` callbacks when a record was actually removed;
    /// removing an unknown serial is a no-op.
    pub fn remove_device(&self, serial: &str) -> Option<Device> {
        let removed = {
            let mut devices = self.devices.write();
            let idx = devices.iter().position(|d| d.serial == serial)?;
            Some(devices.remove(idx))
        };

        if let Some(device) = &removed {
            info!(serial = %device.serial, "device detached");
            for handler in self.handlers_snapshot(&self.removed_handlers) {
                handler(device);
            }
        }
        removed
    }

    /// Returns a snapshot of all known devices, in discovery order.
    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.read().clone()
    }

    /// Looks up a device by its serial.
    pub fn find_by_serial(&self, serial: &str) -> Option<Device> {
        self.devices.read().iter().find(|d| d.serial == serial).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Subscribes to device arrivals. Handlers run synchronously, in
    /// subscription order, after the registry mutation is visible.
    pub fn on_device_added(&self, handler: impl Fn(&Device) + Send + Sync + 'static) {
        self.added_handlers.write().push(Arc::new(handler));
    }

    /// Subscribes to device departures.
    pub fn on_device_removed(&self, handler: impl Fn(&Device) + Send + Sync + 'static) {
        self.removed_handlers.write().push(Arc::new(handler));
    }

    fn handlers_snapshot(&self, list: &RwLock<Vec<DeviceHandler>>) -> Vec<DeviceHandler> {
        list.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{ConnectionKind, Platform};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_device(serial: &str) -> Device {
        Device::new(serial, Platform::Android, "test-device", ConnectionKind::Emulated)
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list_devices().is_empty());
    }

    #[test]
    fn test_add_device_makes_it_findable() {
        let registry = DeviceRegistry::new();
        registry.add_device(make_device("SERIAL-1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_serial("SERIAL-1").unwrap().serial, "SERIAL-1");
    }

    #[test]
    fn test_add_duplicate_serial_replaces_record() {
        let registry = DeviceRegistry::new();
        registry.add_device(make_device("SERIAL-1"));
        let mut updated = make_device("SERIAL-1");
        updated.name = "renamed".to_string();
        registry.add_device(updated);

        assert_eq!(registry.len(), 1, "serial must stay unique");
        assert_eq!(registry.find_by_serial("SERIAL-1").unwrap().name, "renamed");
    }

    #[test]
    fn test_list_devices_preserves_discovery_order() {
        let registry = DeviceRegistry::new();
        registry.add_device(make_device("A"));
        registry.add_device(make_device("B"));
        registry.add_device(make_device("C"));
        let serials: Vec<String> = registry.list_devices().into_iter().map(|d| d.serial).collect();
        assert_eq!(serials, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_remove_device_returns_record_and_fires_handler() {
        let registry = DeviceRegistry::new();
        let removals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removals);
        registry.on_device_removed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.add_device(make_device("SERIAL-1"));
        let removed = registry.remove_device("SERIAL-1");

        assert_eq!(removed.unwrap().serial, "SERIAL-1");
        assert!(registry.is_empty());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_unknown_serial_is_noop() {
        let registry = DeviceRegistry::new();
        let removals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removals);
        registry.on_device_removed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.remove_device("nope").is_none());
        assert_eq!(removals.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_added_handler_fires_only_for_new_serials() {
        let registry = DeviceRegistry::new();
        let additions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&additions);
        registry.on_device_added(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.add_device(make_device("SERIAL-1"));
        registry.add_device(make_device("SERIAL-1")); // upsert, not a new arrival
        registry.add_device(make_device("SERIAL-2"));

        assert_eq!(additions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_reenter_registry() {
        // A removal handler that reads the registry must not deadlock.
        let registry = Arc::new(DeviceRegistry::new());
        let seen_len = Arc::new(AtomicUsize::new(usize::MAX));
        let registry_clone = Arc::clone(&registry);
        let seen = Arc::clone(&seen_len);
        registry.on_device_removed(move |_| {
            seen.store(registry_clone.len(), Ordering::SeqCst);
        });

        registry.add_device(make_device("SERIAL-1"));
        registry.remove_device("SERIAL-1");

        // The handler observes the post-removal state.
        assert_eq!(seen_len.load(Ordering::SeqCst), 0);
    }
}

//! Static device seeding: registers a configured device list and performs no
//! ongoing polling.
//!
//! Backs the `[[devices]]` configuration section, and doubles as the fixture
//! dispatcher in tests. One instance per platform family, mirroring how the
//! live platform pollers are attached.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use applink_core::domain::device::{Device, Platform};
use applink_core::domain::registry::DeviceRegistry;

use super::{DeviceDiscoverer, DiscoveryError, DiscoveryHandle};

/// Registers a fixed set of devices for one platform family.
pub struct SeedDiscoverer {
    platform: Platform,
    devices: Vec<Device>,
}

impl SeedDiscoverer {
    /// Keeps only the entries matching `platform`; mixed-platform lists can
    /// be handed to one seeder per family.
    pub fn new(platform: Platform, devices: Vec<Device>) -> Self {
        let devices = devices.into_iter().filter(|d| d.platform == platform).collect();
        Self { platform, devices }
    }
}

#[async_trait]
impl DeviceDiscoverer for SeedDiscoverer {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn start(
        &self,
        registry: Arc<DeviceRegistry>,
    ) -> Result<DiscoveryHandle, DiscoveryError> {
        for device in &self.devices {
            registry.add_device(device.clone());
        }
        info!(platform = ?self.platform, count = self.devices.len(), "seeded devices");
        Ok(DiscoveryHandle::completed())
    }
}

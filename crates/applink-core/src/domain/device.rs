//! Device entity: one physical or emulated unit capable of running
//! instrumented applications.
//!
//! Devices are produced by the per-platform discovery dispatchers and
//! consumed read-only by the connection broker, which validates the serial
//! an app declares at handshake against the registry.

use serde::{Deserialize, Serialize};

/// Platform family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

/// How the device is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// A real device connected over USB or the network.
    Physical,
    /// An emulator or simulator running on the host.
    Emulated,
}

/// A discovered device.
///
/// The `serial` is the stable identifier apps declare at handshake; it is
/// unique within the registry at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub platform: Platform,
    /// Human-readable name shown in client UIs (e.g. `"Pixel 8"`).
    pub name: String,
    pub connection: ConnectionKind,
}

impl Device {
    pub fn new(
        serial: impl Into<String>,
        platform: Platform,
        name: impl Into<String>,
        connection: ConnectionKind,
    ) -> Self {
        Self {
            serial: serial.into(),
            platform,
            name: name.into(),
            connection,
        }
    }
}

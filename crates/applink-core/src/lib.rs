//! # applink-core
//!
//! Shared library for AppLink containing the wire protocol codec and the
//! device-side domain entities.
//!
//! This crate is used by the session server and by any tool that speaks the
//! AppLink handshake (test harnesses, on-device SDK shims). It has zero
//! dependencies on sockets, runtimes, or OS APIs.
//!
//! - **`protocol`** – How bytes travel over the wire. Each message is a
//!   length-prefixed JSON frame; the first frame on every connection is the
//!   `hello` handshake declaring the device the app runs on.
//!
//! - **`domain`** – Devices and the device registry: the host-side view of
//!   which physical and emulated devices are currently attached, populated
//!   by the per-platform discovery dispatchers.

pub mod domain;
pub mod protocol;

pub use domain::device::{ConnectionKind, Device, Platform};
pub use domain::registry::DeviceRegistry;
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError, MAX_FRAME_LEN};
pub use protocol::messages::{ClientMessage, RejectCode, ServerMessage};

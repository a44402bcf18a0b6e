//! TCP session handling: the connection broker and the session lifecycle
//! controller.

pub mod broker;
pub mod server;

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use applink_core::protocol::ProtocolError;

use crate::application::client_registry::ConnectionId;

/// Error type for session-server operations.
///
/// `Bind` and `AlreadyStarted` concern server-wide setup and propagate to
/// the caller of `init`; every other variant affects a single connection,
/// which is closed while the server continues serving others.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    /// The handshake declared a serial absent from the device registry.
    #[error("unknown device: {serial}")]
    UnknownDevice { serial: String },

    #[error("client {0} is already registered")]
    DuplicateClient(ConnectionId),

    /// Single-client-per-device policy refused a second client.
    #[error("device {serial} already has a live client")]
    DeviceBusy { serial: String },

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The server began shutting down while the connection was in flight.
    #[error("server is closing; connection rejected")]
    ServerClosing,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),
}

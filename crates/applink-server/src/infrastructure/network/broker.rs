//! Connection broker: turns a raw inbound TCP connection into a registered
//! client, or rejects it.
//!
//! Each accepted connection runs [`handle_connection`] in its own Tokio task:
//!
//! 1. Read the `hello` handshake frame, bounded by the configured timeout
//!    and racing the server shutdown signal.
//! 2. Validate the declared device serial against the device registry.
//! 3. Admit the client into the client registry (which emits `new-client`).
//! 4. Ack, then sit in the session loop until EOF, a `goodbye`, or shutdown.
//! 5. Remove the client (idempotent, so a device-removal eviction that beat
//!    us to it is harmless).
//!
//! Handshake parsing never holds a registry lock; all I/O completes before
//! the broker calls into a registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use applink_core::domain::registry::DeviceRegistry;
use applink_core::protocol::codec::{encode_frame, frame_payload_len, HEADER_SIZE};
use applink_core::protocol::messages::{ClientMessage, GoodbyeReason, RejectCode, ServerMessage};
use applink_core::protocol::ProtocolError;

use crate::application::client_registry::{
    AdmitError, Client, ClientRegistry, RemovalReason,
};
use crate::infrastructure::network::SessionError;

/// Everything a connection task needs, cloned per connection by the accept
/// loop.
pub(crate) struct BrokerContext {
    pub devices: Arc<DeviceRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub handshake_timeout: Duration,
    /// Becomes `true` the moment the server enters `Closing`.
    pub shutdown: watch::Receiver<bool>,
}

/// Top-level handler for a single connection.
///
/// Wraps [`serve_connection`] and logs the outcome, so the inner function
/// can use `?` for clean error propagation.
pub(crate) async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: BrokerContext) {
    match serve_connection(stream, peer, ctx).await {
        Ok(()) => debug!(%peer, "session ended"),
        Err(SessionError::ServerClosing) => debug!(%peer, "connection rejected during shutdown"),
        Err(e) => debug!(%peer, error = %e, "connection rejected"),
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut ctx: BrokerContext,
) -> Result<(), SessionError> {
    // The accept loop stops at shutdown, but a connection may have been
    // accepted just before the signal landed.
    if *ctx.shutdown.borrow() {
        reject(&mut stream, RejectCode::ServerClosing, "server is shutting down").await;
        return Err(SessionError::ServerClosing);
    }

    let (device_id, app_name, sdk_version, query) =
        match read_handshake(&mut stream, &mut ctx).await? {
            ClientMessage::Hello { device_id, app_name, sdk_version, query } => {
                (device_id, app_name, sdk_version, query)
            }
            other => {
                reject(&mut stream, RejectCode::BadHandshake, "expected a hello frame").await;
                return Err(SessionError::Protocol(ProtocolError::Malformed(format!(
                    "first frame must be hello, got {other:?}"
                ))));
            }
        };

    let Some(device) = ctx.devices.find_by_serial(&device_id) else {
        reject(
            &mut stream,
            RejectCode::UnknownDevice,
            &format!("no device with serial {device_id}"),
        )
        .await;
        return Err(SessionError::UnknownDevice { serial: device_id });
    };

    // Shutdown may have begun while the handshake was in flight; no client
    // is admitted (and no new-client emitted) once closing has started.
    if *ctx.shutdown.borrow() {
        reject(&mut stream, RejectCode::ServerClosing, "server is shutting down").await;
        return Err(SessionError::ServerClosing);
    }

    let client = Client {
        id: Uuid::new_v4(),
        device_serial: device.serial.clone(),
        app_name,
        query: with_sdk_version(query, sdk_version),
        admitted_seq: 0, // assigned by the registry
        connected_at: Instant::now(),
    };
    let id = client.id;

    let admitted = match ctx.clients.admit(client) {
        Ok(admitted) => admitted,
        Err(AdmitError::DuplicateClient(id)) => {
            reject(&mut stream, RejectCode::DuplicateClient, "connection already registered").await;
            return Err(SessionError::DuplicateClient(id));
        }
        Err(AdmitError::DeviceBusy { serial }) => {
            reject(
                &mut stream,
                RejectCode::DeviceBusy,
                &format!("device {serial} already has a live client"),
            )
            .await;
            return Err(SessionError::DeviceBusy { serial });
        }
    };

    if let Err(e) = write_frame(&mut stream, &ServerMessage::HelloAck { connection_id: id }).await {
        // The app vanished between handshake and ack; undo the registration.
        ctx.clients.remove(id, RemovalReason::ConnectionClosed);
        return Err(e);
    }

    info!(%peer, client = %id, device = %admitted.device_serial, "session established");

    let reason = session_loop(&mut stream, &mut ctx.shutdown, id).await;
    ctx.clients.remove(id, reason);
    Ok(())
}

/// What ended a wait on the socket: a frame arrived (or failed to), or the
/// server began closing. The handlers below run after the competing reads
/// have been dropped, so they are free to write to the stream.
enum Wakeup {
    Frame(Result<ClientMessage, SessionError>),
    Closing,
}

/// Reads the first frame, bounded by the handshake timeout and racing the
/// shutdown signal.
async fn read_handshake(
    stream: &mut TcpStream,
    ctx: &mut BrokerContext,
) -> Result<ClientMessage, SessionError> {
    let handshake_timeout = ctx.handshake_timeout;
    let wakeup = tokio::select! {
        res = timeout(handshake_timeout, read_frame::<ClientMessage>(stream)) => match res {
            Ok(inner) => Wakeup::Frame(inner),
            Err(_elapsed) => Wakeup::Frame(Err(SessionError::HandshakeTimeout(handshake_timeout))),
        },
        _ = ctx.shutdown.changed() => Wakeup::Closing,
    };

    match wakeup {
        Wakeup::Frame(res) => res,
        Wakeup::Closing => {
            reject(stream, RejectCode::ServerClosing, "server is shutting down").await;
            Err(SessionError::ServerClosing)
        }
    }
}

/// Reads frames until the session ends, returning why it ended.
async fn session_loop(
    stream: &mut TcpStream,
    shutdown: &mut watch::Receiver<bool>,
    id: Uuid,
) -> RemovalReason {
    loop {
        let wakeup = tokio::select! {
            res = read_frame::<ClientMessage>(stream) => Wakeup::Frame(res),
            _ = shutdown.changed() => Wakeup::Closing,
        };

        match wakeup {
            Wakeup::Frame(Ok(ClientMessage::Goodbye { reason })) => {
                debug!(client = %id, ?reason, "client said goodbye");
                return RemovalReason::ConnectionClosed;
            }
            Wakeup::Frame(Ok(other)) => {
                debug!(client = %id, frame = ?other, "unexpected frame ignored");
            }
            Wakeup::Frame(Err(SessionError::Io(e)))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!(client = %id, "connection closed by remote");
                return RemovalReason::ConnectionClosed;
            }
            Wakeup::Frame(Err(e)) => {
                warn!(client = %id, error = %e, "session read failed; dropping connection");
                return RemovalReason::ConnectionClosed;
            }
            Wakeup::Closing => {
                let goodbye = ServerMessage::Goodbye { reason: GoodbyeReason::ShuttingDown };
                if let Err(e) = write_frame(stream, &goodbye).await {
                    debug!(client = %id, error = %e, "goodbye frame not delivered");
                }
                return RemovalReason::ServerShutdown;
            }
        }
    }
}

/// Reads exactly one length-prefixed frame from the stream.
async fn read_frame<T: serde::de::DeserializeOwned>(
    stream: &mut TcpStream,
) -> Result<T, SessionError> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let payload_len = frame_payload_len(&header)?;

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    let msg = serde_json::from_slice(&payload)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(msg)
}

/// Writes one frame to the stream.
async fn write_frame<T: serde::Serialize>(
    stream: &mut TcpStream,
    msg: &T,
) -> Result<(), SessionError> {
    let bytes = encode_frame(msg)?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Sends a `rejected` frame best-effort; the connection is being dropped
/// either way.
async fn reject(stream: &mut TcpStream, code: RejectCode, message: &str) {
    let frame = ServerMessage::Rejected { code, message: message.to_string() };
    if let Err(e) = write_frame(stream, &frame).await {
        debug!(error = %e, "reject frame not delivered");
    }
}

fn with_sdk_version(
    mut query: HashMap<String, String>,
    sdk_version: Option<String>,
) -> HashMap<String, String> {
    if let Some(version) = sdk_version {
        query.entry("sdk_version".to_string()).or_insert(version);
    }
    query
}

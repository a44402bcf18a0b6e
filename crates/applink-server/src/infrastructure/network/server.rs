//! Session lifecycle controller: binds the listening endpoint, accepts
//! connections, and performs graceful shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──► Starting ──► Listening ──► Closing ──► Closed
//!            │ bind error
//!            ▼
//!          Idle (retryable)
//! ```
//!
//! `init` binds and spawns the accept loop; `close` stops accepting, nudges
//! every live session through the shutdown watch channel, waits up to the
//! grace period, aborts stragglers, sweeps the client registry so every
//! still-registered client produces its orderly `removed-client` event, and
//! finally tears down the attached discovery dispatchers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use applink_core::domain::device::Device;
use applink_core::domain::registry::DeviceRegistry;

use crate::application::client_registry::{Client, ClientRegistry, ConnectionId, RemovalReason};
use crate::application::events::SessionNotifier;
use crate::infrastructure::discovery::{DeviceDiscoverer, DiscoveryError, DiscoveryHandle};
use crate::infrastructure::network::broker::{handle_connection, BrokerContext};
use crate::infrastructure::network::SessionError;

/// Runtime settings for the session server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bind_address: std::net::IpAddr,
    /// Port to listen on; `0` lets the OS pick (used by tests).
    pub port: u16,
    /// How long a connection may take to deliver its `hello` frame.
    pub handshake_timeout: Duration,
    /// How long `close` waits for sessions to end cooperatively before
    /// aborting them.
    pub shutdown_grace: Duration,
    /// Whether several clients may share one device serial.
    pub allow_shared_device: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_address: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 9670,
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(3),
            allow_shared_device: true,
        }
    }
}

/// Lifecycle states of the session server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Listening,
    Closing,
    Closed,
}

/// The session server.
///
/// Owns the client registry and the event notifier; consumes the device
/// registry populated by discovery. Device removals are routed through
/// [`ClientRegistry::evict_by_device`], never by touching client records
/// directly.
pub struct SessionServer {
    config: SessionConfig,
    devices: Arc<DeviceRegistry>,
    clients: Arc<ClientRegistry>,
    notifier: Arc<SessionNotifier>,
    state: Arc<Mutex<LifecycleState>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    session_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    discovery_handles: Mutex<Vec<DiscoveryHandle>>,
}

impl SessionServer {
    /// Creates a server over a shared device registry and subscribes to its
    /// removal callback so a disappearing device evicts its clients.
    pub fn new(config: SessionConfig, devices: Arc<DeviceRegistry>) -> Arc<Self> {
        let notifier = Arc::new(SessionNotifier::new());
        let clients = Arc::new(ClientRegistry::new(
            Arc::clone(&notifier),
            config.allow_shared_device,
        ));

        let eviction_registry = Arc::clone(&clients);
        devices.on_device_removed(move |device: &Device| {
            let evicted = eviction_registry.evict_by_device(&device.serial);
            if evicted > 0 {
                info!(serial = %device.serial, count = evicted, "evicted clients of detached device");
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            devices,
            clients,
            notifier,
            state: Arc::new(Mutex::new(LifecycleState::Idle)),
            shutdown_tx,
            shutdown_rx,
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            session_tasks: Arc::new(Mutex::new(Vec::new())),
            discovery_handles: Mutex::new(Vec::new()),
        })
    }

    /// Binds the listening endpoint and starts accepting connections.
    ///
    /// Returns the bound address (useful when the configured port is `0`).
    ///
    /// # Errors
    ///
    /// [`SessionError::Bind`] if the endpoint is unavailable; the server
    /// returns to `Idle` and `init` may be retried. [`SessionError::AlreadyStarted`]
    /// if the server is not `Idle`.
    pub async fn init(&self) -> Result<SocketAddr, SessionError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Idle {
                return Err(SessionError::AlreadyStarted);
            }
            *state = LifecycleState::Starting;
        }

        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                *self.state.lock() = LifecycleState::Idle;
                return Err(SessionError::Bind { addr, source });
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);

        *self.state.lock() = LifecycleState::Listening;
        info!(addr = %local, "session server listening");

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.devices),
            Arc::clone(&self.clients),
            self.config.handshake_timeout,
            self.shutdown_rx.clone(),
            Arc::clone(&self.session_tasks),
        ));
        *self.accept_task.lock() = Some(task);

        Ok(local)
    }

    /// Gracefully shuts the server down.
    ///
    /// No-op unless the server is `Listening`. On return the accept loop has
    /// stopped, every previously live client has produced exactly one
    /// `removed-client` event, and every attached discovery dispatcher has
    /// completed its teardown.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Listening {
                debug!(state = ?*state, "close ignored");
                return;
            }
            *state = LifecycleState::Closing;
        }
        info!("session server closing");

        // Stops the accept loop and nudges every session task.
        let _ = self.shutdown_tx.send(true);

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let tasks: Vec<JoinHandle<()>> = self.session_tasks.lock().drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                grace = ?self.config.shutdown_grace,
                "grace period expired; aborting remaining session tasks"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        // Cooperative sessions removed themselves on the way out; this sweep
        // guarantees the removed-client event for anything still registered.
        let forced = self.clients.evict_all(RemovalReason::Forced);
        if forced > 0 {
            warn!(count = forced, "clients force-evicted at shutdown");
        }

        let handles: Vec<DiscoveryHandle> = self.discovery_handles.lock().drain(..).collect();
        for handle in handles {
            handle.shutdown().await;
        }

        *self.state.lock() = LifecycleState::Closed;
        info!("session server closed");
    }

    /// Starts a discovery dispatcher against the shared device registry and
    /// retains its teardown handle for `close`.
    pub async fn attach_discovery(
        &self,
        discoverer: Arc<dyn DeviceDiscoverer>,
    ) -> Result<(), DiscoveryError> {
        info!(platform = ?discoverer.platform(), "starting discovery dispatcher");
        let handle = discoverer.start(Arc::clone(&self.devices)).await?;
        self.discovery_handles.lock().push(handle);
        Ok(())
    }

    /// Registers a handler for `new-client` events.
    pub fn on_new_client(
        &self,
        handler: impl Fn(&Client) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.notifier.on_new_client(handler);
    }

    /// Registers a handler for `removed-client` events.
    pub fn on_removed_client(
        &self,
        handler: impl Fn(ConnectionId) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.notifier.on_removed_client(handler);
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// The bound address, once `init` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }
}

/// Accepts connections until the shutdown signal, spawning one broker task
/// per connection so one slow handshake never blocks another.
async fn accept_loop(
    listener: TcpListener,
    devices: Arc<DeviceRegistry>,
    clients: Arc<ClientRegistry>,
    handshake_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    session_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut shutdown_signal = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown_signal.changed() => {
                info!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "inbound connection");
                    let ctx = BrokerContext {
                        devices: Arc::clone(&devices),
                        clients: Arc::clone(&clients),
                        handshake_timeout,
                        shutdown: shutdown.clone(),
                    };
                    let task = tokio::spawn(handle_connection(stream, peer, ctx));
                    let mut tasks = session_tasks.lock();
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(task);
                }
                Err(e) => {
                    // Transient accept failure (e.g. fd exhaustion); keep serving.
                    error!("accept error: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            port: 0,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 9670);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert!(config.allow_shared_device);
    }

    #[tokio::test]
    async fn test_init_transitions_to_listening() {
        let server = SessionServer::new(test_config(), Arc::new(DeviceRegistry::new()));
        assert_eq!(server.state(), LifecycleState::Idle);

        let addr = server.init().await.expect("init");

        assert_eq!(server.state(), LifecycleState::Listening);
        assert_eq!(server.local_addr(), Some(addr));
        server.close().await;
    }

    #[tokio::test]
    async fn test_init_twice_fails_with_already_started() {
        let server = SessionServer::new(test_config(), Arc::new(DeviceRegistry::new()));
        server.init().await.expect("first init");

        let err = server.init().await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted));
        server.close().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_leaves_server_retryable() {
        let registry = Arc::new(DeviceRegistry::new());
        let first = SessionServer::new(test_config(), Arc::clone(&registry));
        let addr = first.init().await.expect("first bind");

        let mut conflicting = test_config();
        conflicting.port = addr.port();
        let second = SessionServer::new(conflicting, registry);

        let err = second.init().await.unwrap_err();
        assert!(matches!(err, SessionError::Bind { .. }));
        assert_eq!(second.state(), LifecycleState::Idle, "bind failure must be retryable");

        // Retry succeeds once the port frees up.
        first.close().await;
        let retried = second.init().await.expect("retry after conflict");
        assert_eq!(retried.port(), addr.port());
        second.close().await;
    }

    #[tokio::test]
    async fn test_close_when_idle_is_noop() {
        let server = SessionServer::new(test_config(), Arc::new(DeviceRegistry::new()));
        server.close().await;
        assert_eq!(server.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let server = SessionServer::new(test_config(), Arc::new(DeviceRegistry::new()));
        server.init().await.expect("init");
        server.close().await;
        assert_eq!(server.state(), LifecycleState::Closed);

        // Second close must return immediately without changing state.
        server.close().await;
        assert_eq!(server.state(), LifecycleState::Closed);
    }
}

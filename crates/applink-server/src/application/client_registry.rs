//! The client registry: the authoritative mapping of connection identity to
//! registered client, and the single place lifecycle events originate.
//!
//! # Locking
//!
//! Two locks with distinct jobs:
//!
//! - `mutation` serializes every mutation *together with* its event emission.
//!   This is what guarantees a client's `new-client` always precedes its
//!   `removed-client`, and that no listener observes an inconsistent
//!   intermediate state.
//! - `clients` (an `RwLock` around the map) is released before handlers run,
//!   so a subscriber reacting to an event may query the registry and will see
//!   the mutation already applied.
//!
//! Neither lock is ever held across an await point; all connection I/O
//! happens before the broker calls into the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::events::SessionNotifier;

/// Identity of one live transport connection.
pub type ConnectionId = Uuid;

/// A registered, live debugging session originating from an app on a device.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ConnectionId,
    /// Serial of the device the app declared at handshake. Matched exactly
    /// one registry device at admission time.
    pub device_serial: String,
    pub app_name: String,
    /// Free-form handshake metadata.
    pub query: HashMap<String, String>,
    /// Monotonic admission counter; evictions proceed in this order.
    pub admitted_seq: u64,
    pub connected_at: Instant,
}

/// Why an admission was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("client {0} is already registered")]
    DuplicateClient(ConnectionId),
    #[error("device {serial} already has a live client")]
    DeviceBusy { serial: String },
}

/// Why a client was removed. Logged, not part of the event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The transport connection ended (EOF or goodbye).
    ConnectionClosed,
    /// The device the client was bound to disappeared.
    DeviceRemoved,
    /// Orderly server shutdown.
    ServerShutdown,
    /// The session task missed the shutdown grace period.
    Forced,
}

/// Registry of currently registered clients.
pub struct ClientRegistry {
    clients: RwLock<HashMap<ConnectionId, Arc<Client>>>,
    /// Serializes admit/remove/evict end-to-end, including event emission.
    mutation: Mutex<()>,
    admissions: AtomicU64,
    notifier: Arc<SessionNotifier>,
    allow_shared_device: bool,
}

impl ClientRegistry {
    pub fn new(notifier: Arc<SessionNotifier>, allow_shared_device: bool) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            mutation: Mutex::new(()),
            admissions: AtomicU64::new(0),
            notifier,
            allow_shared_device,
        }
    }

    /// Admits a client, assigning its admission sequence number.
    ///
    /// Emits exactly one `new-client` event synchronously before returning,
    /// after the insertion is visible to readers.
    ///
    /// # Errors
    ///
    /// [`AdmitError::DuplicateClient`] if the connection identity is already
    /// registered; [`AdmitError::DeviceBusy`] if the declared serial is bound
    /// and the registry is configured for one client per device.
    pub fn admit(&self, mut client: Client) -> Result<Arc<Client>, AdmitError> {
        let _guard = self.mutation.lock();

        let admitted = {
            let mut clients = self.clients.write();
            if clients.contains_key(&client.id) {
                return Err(AdmitError::DuplicateClient(client.id));
            }
            if !self.allow_shared_device
                && clients.values().any(|c| c.device_serial == client.device_serial)
            {
                return Err(AdmitError::DeviceBusy {
                    serial: client.device_serial.clone(),
                });
            }

            client.admitted_seq = self.admissions.fetch_add(1, Ordering::Relaxed);
            let admitted = Arc::new(client);
            clients.insert(admitted.id, Arc::clone(&admitted));
            admitted
        };

        info!(
            client = %admitted.id,
            device = %admitted.device_serial,
            app = %admitted.app_name,
            count = self.len(),
            "client registered"
        );
        self.notifier.emit_new_client(&admitted);
        Ok(admitted)
    }

    /// Removes a client if present, emitting exactly one `removed-client`
    /// event for an entry that was actually removed.
    ///
    /// Idempotent: removing an absent identity is a no-op returning `false`,
    /// which makes races between transport close and device-removal eviction
    /// harmless.
    pub fn remove(&self, id: ConnectionId, reason: RemovalReason) -> bool {
        let _guard = self.mutation.lock();
        self.remove_locked(id, reason)
    }

    /// Removes every client bound to `serial`, in admission order, emitting
    /// one `removed-client` event per removal. Returns the eviction count.
    pub fn evict_by_device(&self, serial: &str) -> usize {
        let _guard = self.mutation.lock();
        let victims = self.collect_in_admission_order(|c| c.device_serial == serial);
        for id in &victims {
            self.remove_locked(*id, RemovalReason::DeviceRemoved);
        }
        victims.len()
    }

    /// Removes every registered client, in admission order. Shutdown sweep.
    pub fn evict_all(&self, reason: RemovalReason) -> usize {
        let _guard = self.mutation.lock();
        let victims = self.collect_in_admission_order(|_| true);
        for id in &victims {
            self.remove_locked(*id, reason);
        }
        victims.len()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Client>> {
        self.clients.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Snapshot of all registered clients, in admission order.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        let mut all: Vec<Arc<Client>> = self.clients.read().values().cloned().collect();
        all.sort_by_key(|c| c.admitted_seq);
        all
    }

    // Caller holds `mutation`.
    fn remove_locked(&self, id: ConnectionId, reason: RemovalReason) -> bool {
        let removed = self.clients.write().remove(&id);
        match removed {
            Some(client) => {
                info!(
                    client = %id,
                    device = %client.device_serial,
                    reason = ?reason,
                    count = self.len(),
                    "client removed"
                );
                self.notifier.emit_removed_client(id);
                true
            }
            None => {
                debug!(client = %id, reason = ?reason, "remove of unregistered client ignored");
                false
            }
        }
    }

    fn collect_in_admission_order(&self, predicate: impl Fn(&Client) -> bool) -> Vec<ConnectionId> {
        let clients = self.clients.read();
        let mut matches: Vec<(u64, ConnectionId)> = clients
            .values()
            .filter(|c| predicate(c))
            .map(|c| (c.admitted_seq, c.id))
            .collect();
        matches.sort_by_key(|(seq, _)| *seq);
        matches.into_iter().map(|(_, id)| id).collect()
    }
}

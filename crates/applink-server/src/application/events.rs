//! Lifecycle event notifier: delivers `new-client` / `removed-client`
//! transitions to subscribers.
//!
//! Subscribers are plain callbacks registered per event kind and invoked
//! synchronously, in subscription order, by whichever registry mutation
//! triggered the event. A handler that returns an error is logged and
//! skipped; it never prevents the remaining handlers from running and never
//! aborts the mutation that emitted the event.
//!
//! The handler lists are cloned out of their locks before dispatch, so a
//! handler may subscribe further handlers or query the registries without
//! deadlocking.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::application::client_registry::{Client, ConnectionId};

type NewClientHandler = Arc<dyn Fn(&Client) -> anyhow::Result<()> + Send + Sync>;
type RemovedClientHandler = Arc<dyn Fn(ConnectionId) -> anyhow::Result<()> + Send + Sync>;

/// Publish/subscribe channel for client lifecycle transitions.
#[derive(Default)]
pub struct SessionNotifier {
    new_client: RwLock<Vec<NewClientHandler>>,
    removed_client: RwLock<Vec<RemovedClientHandler>>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `new-client` events. The handler receives the
    /// admitted [`Client`].
    pub fn on_new_client(
        &self,
        handler: impl Fn(&Client) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.new_client.write().push(Arc::new(handler));
    }

    /// Registers a handler for `removed-client` events. The handler receives
    /// the departed client's connection identity.
    pub fn on_removed_client(
        &self,
        handler: impl Fn(ConnectionId) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.removed_client.write().push(Arc::new(handler));
    }

    /// Invoked by the client registry after an admission becomes visible.
    pub(crate) fn emit_new_client(&self, client: &Client) {
        let handlers: Vec<NewClientHandler> = self.new_client.read().clone();
        for handler in handlers {
            if let Err(e) = handler(client) {
                warn!(client = %client.id, error = %e, "new-client handler failed");
            }
        }
    }

    /// Invoked by the client registry after a removal becomes visible.
    pub(crate) fn emit_removed_client(&self, id: ConnectionId) {
        let handlers: Vec<RemovedClientHandler> = self.removed_client.read().clone();
        for handler in handlers {
            if let Err(e) = handler(id) {
                warn!(client = %id, error = %e, "removed-client handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn make_client() -> Client {
        Client {
            id: Uuid::new_v4(),
            device_serial: "SERIAL-1".to_string(),
            app_name: "shop".to_string(),
            query: HashMap::new(),
            admitted_seq: 0,
            connected_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let notifier = SessionNotifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            notifier.on_new_client(move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        notifier.emit_new_client(&make_client());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_later_handlers() {
        let notifier = SessionNotifier::new();
        let reached = Arc::new(Mutex::new(false));

        notifier.on_removed_client(|_| anyhow::bail!("subscriber exploded"));
        let reached_clone = Arc::clone(&reached);
        notifier.on_removed_client(move |_| {
            *reached_clone.lock().unwrap() = true;
            Ok(())
        });

        notifier.emit_removed_client(Uuid::new_v4());
        assert!(*reached.lock().unwrap(), "second handler must still run");
    }

    #[test]
    fn test_emit_with_no_subscribers_is_noop() {
        let notifier = SessionNotifier::new();
        notifier.emit_new_client(&make_client());
        notifier.emit_removed_client(Uuid::new_v4());
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let notifier = Arc::new(SessionNotifier::new());
        let notifier_clone = Arc::clone(&notifier);
        notifier.on_new_client(move |_| {
            notifier_clone.on_new_client(|_| Ok(()));
            Ok(())
        });

        // Must not deadlock on the handler list lock.
        notifier.emit_new_client(&make_client());
        assert_eq!(notifier.new_client.read().len(), 2);
    }

    #[test]
    fn test_removed_handler_receives_the_identity() {
        let notifier = SessionNotifier::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        notifier.on_removed_client(move |id| {
            *seen_clone.lock().unwrap() = Some(id);
            Ok(())
        });

        let id = Uuid::new_v4();
        notifier.emit_removed_client(id);
        assert_eq!(*seen.lock().unwrap(), Some(id));
    }
}

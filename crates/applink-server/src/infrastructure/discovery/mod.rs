//! Device discovery dispatchers.
//!
//! One dispatcher per platform family populates the shared
//! [`DeviceRegistry`]; the session server treats them uniformly through the
//! [`DeviceDiscoverer`] trait and keeps each returned [`DiscoveryHandle`]
//! so shutdown can tear the dispatcher down and only complete once its
//! polling/watching has actually stopped.
//!
//! The platform pollers themselves (adb track-devices, usbmuxd listeners)
//! live outside this crate; [`seed::SeedDiscoverer`] ships in-tree for
//! statically configured device lists and test setups.

pub mod seed;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use applink_core::domain::device::Platform;
use applink_core::domain::registry::DeviceRegistry;

pub use seed::SeedDiscoverer;

/// Error type for discovery dispatcher operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The dispatcher could not start its platform watcher.
    #[error("discovery for {platform:?} failed to start: {message}")]
    StartFailed { platform: Platform, message: String },
}

/// A per-platform device enumeration capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceDiscoverer: Send + Sync {
    /// Platform family this dispatcher enumerates.
    fn platform(&self) -> Platform;

    /// Starts enumeration against the shared registry.
    ///
    /// The returned handle's [`DiscoveryHandle::shutdown`] resolves only
    /// after any background polling has stopped.
    async fn start(&self, registry: Arc<DeviceRegistry>)
        -> Result<DiscoveryHandle, DiscoveryError>;
}

/// Teardown handle for a running dispatcher.
pub struct DiscoveryHandle {
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// Handle for a dispatcher with a background task stopped via `stop`.
    pub fn for_task(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { stop: Some(stop), task: Some(task) }
    }

    /// Handle for a dispatcher that finished its work up front and has
    /// nothing to tear down.
    pub fn completed() -> Self {
        Self { stop: None, task: None }
    }

    /// Signals the dispatcher to stop and waits for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "discovery task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_completed_handle_shutdown_resolves_immediately() {
        DiscoveryHandle::completed().shutdown().await;
    }

    #[tokio::test]
    async fn test_task_handle_shutdown_waits_for_task_exit() {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_flag = Arc::clone(&stopped);

        let task = tokio::spawn(async move {
            // Stand-in for a platform polling loop.
            let _ = stop_rx.changed().await;
            stopped_flag.store(true, Ordering::SeqCst);
        });

        DiscoveryHandle::for_task(stop_tx, task).shutdown().await;
        assert!(stopped.load(Ordering::SeqCst), "shutdown must wait for the poller to stop");
    }

    #[tokio::test]
    async fn test_mocked_discoverer_start_is_invoked_with_registry() {
        let mut mock = MockDeviceDiscoverer::new();
        mock.expect_platform().return_const(Platform::Android);
        mock.expect_start()
            .times(1)
            .returning(|_| Ok(DiscoveryHandle::completed()));

        let registry = Arc::new(DeviceRegistry::new());
        assert_eq!(mock.platform(), Platform::Android);
        let handle = mock.start(registry).await.expect("start");
        handle.shutdown().await;
    }
}

//! AppLink session server entry point.
//!
//! Wires the device registry, discovery dispatchers, and the session server
//! together and runs until Ctrl-C, then performs a graceful shutdown so every
//! live client receives its orderly `removed-client` event before exit.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use applink_core::domain::device::Platform;
use applink_core::domain::registry::DeviceRegistry;
use applink_server::infrastructure::discovery::SeedDiscoverer;
use applink_server::infrastructure::network::server::SessionServer;
use applink_server::infrastructure::storage::config::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Level is overridden by `RUST_LOG`; the config value is the fallback.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
        )
        .init();

    info!("AppLink session server starting");

    let devices = Arc::new(DeviceRegistry::new());
    let server = SessionServer::new(config.session_config()?, Arc::clone(&devices));

    // One seed dispatcher per platform family over the configured entries.
    let seed_devices = config.seed_devices();
    for platform in [Platform::Android, Platform::Ios] {
        let seeder = Arc::new(SeedDiscoverer::new(platform, seed_devices.clone()));
        server.attach_discovery(seeder).await?;
    }

    server.on_new_client(|client| {
        info!(client = %client.id, device = %client.device_serial, app = %client.app_name, "client attached");
        Ok(())
    });
    server.on_removed_client(|id| {
        info!(client = %id, "client detached");
        Ok(())
    });

    let addr = server.init().await?;
    info!(%addr, "ready for instrumented apps; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    server.close().await;
    info!("AppLink session server stopped");
    Ok(())
}

//! Application layer: the client registry and the lifecycle event notifier.

pub mod client_registry;
pub mod events;

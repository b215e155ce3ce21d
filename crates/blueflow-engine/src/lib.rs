/*!
 * BlueFlow Engine
 *
 * This crate provides the reactive state machines of the BlueFlow
 * peripheral inspector: the connection lifecycle, the generic discovery
 * protocol, their connect-then-discover composition and the registry that
 * aggregates running child machines.
 */

#![warn(missing_docs)]

// Re-export core types
pub use blueflow_core::prelude;

pub mod connectable;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod registry;

// Re-export main types for convenience
pub use connectable::{ConnectableDiscoveryState, ConnectableDiscoveryStateMachine};
pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, ConnectionStateMachine, Connector,
};
pub use discovery::{DiscoveryState, DiscoveryStateMachine, DiscoveryStrategy, FnStrategy};
pub use error::ConnectionFailure;
pub use registry::{Entity, EntityRegistry, RegistryEntry};

/// BlueFlow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> blueflow_core::error::Result<()> {
    tracing::info!("BlueFlow Engine {} initialized", VERSION);
    Ok(())
}

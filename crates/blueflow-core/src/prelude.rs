/*!
 * Prelude module for BlueFlow Core.
 *
 * This module re-exports commonly used types and functions from the BlueFlow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export state publication types
pub use crate::state::{StatePublisher, StateStream};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, EngineConfig, SharedConfig};

// Re-export utility functions
pub use crate::utils::{spawn_actor, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;

/*!
 * BlueFlow Core
 *
 * This crate provides the shared plumbing for the BlueFlow state machines:
 * state publication, configuration, logging and small async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod state;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use futures;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// BlueFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("BlueFlow Core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

/*!
 * Logging functionality for BlueFlow.
 *
 * This module provides tracing setup and the spans every state machine
 * task runs inside, so log lines can be attributed to an entity.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "blueflow_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from the logging section of the configuration
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::logging(format!("Invalid log filter {}: {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.compact {
        registry
            .with(fmt::layer().compact().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    result.map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a state machine task
///
/// # Arguments
///
/// * `name` - The kind of machine (e.g. "connection", "discovery")
/// * `id` - The entity identifier, if the machine is bound to one
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::debug_span!("machine", name = %name, id = %id),
        None => tracing::debug_span!("machine", name = %name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A global subscriber may already be installed by another test
        let _ = init();
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        std::env::remove_var("RUST_LOG");
        let result = init_with_filter("blueflow=notalevel");
        assert!(result.is_err());
    }

    #[test]
    fn test_component_span() {
        for span in [
            component_span("connection", Some("1234")),
            component_span("registry", None),
        ] {
            // Disabled spans carry no metadata
            if let Some(metadata) = span.metadata() {
                assert_eq!(metadata.name(), "machine");
            }
        }
    }
}

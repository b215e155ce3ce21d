/*!
 * Failure types for the BlueFlow engine crate.
 *
 * Failures are captured in machine state and never returned from the
 * machine operations themselves.
 */
use thiserror::Error;

/// A transport-reported connect or disconnect error
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
#[error("Connection failure: {description}")]
pub struct ConnectionFailure {
    description: String,
}

impl ConnectionFailure {
    /// Create a connection failure from a transport description
    pub fn new<S: Into<String>>(description: S) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// The transport's description of the failure
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<&str> for ConnectionFailure {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ConnectionFailure {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

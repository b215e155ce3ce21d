/*!
 * Error types for the BlueFlow core crate.
 *
 * State machines never surface these across their state boundary; failures
 * of the machines themselves are folded into state. This type covers the
 * ambient plumbing: configuration, logging setup and caller-side deadlines.
 */
use thiserror::Error;

/// Error type for BlueFlow core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging setup error
    #[error("Logging error: {0}")]
    Logging(String),

    /// A caller-side deadline expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A state stream or command channel was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for BlueFlow core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new logging error
    pub fn logging<S: AsRef<str>>(msg: S) -> Self {
        Error::Logging(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new channel closed error
    pub fn channel_closed<S: AsRef<str>>(msg: S) -> Self {
        Error::ChannelClosed(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

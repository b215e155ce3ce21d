/*!
 * Failure types for GATT entities.
 *
 * Like connection failures, these are folded into machine state and never
 * returned across the state boundary.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Level of the attribute hierarchy an enumeration ran at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeLevel {
    /// Services of a device
    Service,
    /// Characteristics of a service
    Characteristic,
    /// Descriptors of a characteristic
    Descriptor,
}

impl fmt::Display for AttributeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeLevel::Service => write!(f, "service"),
            AttributeLevel::Characteristic => write!(f, "characteristic"),
            AttributeLevel::Descriptor => write!(f, "descriptor"),
        }
    }
}

/// A transport-reported enumeration error
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[error("Failed to discover {level}s: {description}")]
pub struct DiscoveryFailure {
    level: AttributeLevel,
    description: String,
}

impl DiscoveryFailure {
    /// Create a discovery failure for `level`
    pub fn new<S: Into<String>>(level: AttributeLevel, description: S) -> Self {
        Self {
            level,
            description: description.into(),
        }
    }

    /// Enumeration level that failed
    pub fn level(&self) -> AttributeLevel {
        self.level
    }

    /// The transport's description of the failure
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Operation on an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueOperation {
    /// Read the value
    Read,
    /// Write the value
    Write,
    /// Enable or disable notifications
    Notify,
}

impl fmt::Display for ValueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOperation::Read => write!(f, "read"),
            ValueOperation::Write => write!(f, "write"),
            ValueOperation::Notify => write!(f, "notify"),
        }
    }
}

/// Read, write and notify failures of a value machine
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueFailure {
    /// The transport reported an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Refused locally: the attribute does not support the operation
    #[error("Operation not permitted: {0}")]
    NotPermitted(ValueOperation),
}

impl ValueFailure {
    /// Whether the failure was produced locally, without a transport call
    pub fn is_local(&self) -> bool {
        matches!(self, ValueFailure::NotPermitted(_))
    }
}

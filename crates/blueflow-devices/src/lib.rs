/*!
 * BlueFlow Devices
 *
 * This crate provides the GATT side of BlueFlow: the transport contract,
 * the device/service/characteristic/descriptor models built on the engine
 * machines, leaf value machines, device search and a simulated transport.
 */

#![warn(missing_docs)]

// Re-export core types
pub use blueflow_core::prelude;

pub mod advertisement;
pub mod central;
pub mod characteristic;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod properties;
pub mod search;
pub mod service;
pub mod simulated;
pub mod transport;
pub mod value;

mod model;

// Re-export the entity models and their collaborators
pub use advertisement::{Advertisement, CompanyCatalog, IBeacon, ManufacturerData};
pub use central::{Central, CentralState};
pub use characteristic::{CharacteristicModel, CharacteristicState};
pub use descriptor::{DescriptorModel, DescriptorState};
pub use device::{DeviceModel, DeviceState};
pub use error::{AttributeLevel, DiscoveryFailure, ValueFailure, ValueOperation};
pub use properties::{AttributePermissions, CharacteristicProperties};
pub use search::SearchFilter;
pub use service::{ServiceModel, ServiceState};
pub use simulated::SimulatedTransport;
pub use transport::{
    AttributePath, ScanFilter, Transport, TransportConnector, TransportEvent, WriteMode,
};
pub use value::{CharacteristicValueStateMachine, DescriptorValueStateMachine, ValueState};

/// BlueFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), blueflow_core::error::Error> {
    tracing::info!("BlueFlow Devices {} initialized", VERSION);
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

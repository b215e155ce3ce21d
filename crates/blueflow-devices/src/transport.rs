/*!
 * Transport contract.
 *
 * The transport is the injected collaborator that talks to real hardware.
 * Fire-and-forget calls complete through [`TransportEvent`]s, which carry
 * the identifiers the machines use for correlation. Enumeration calls are
 * plain async functions.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blueflow_core::config::ScanConfig;
use blueflow_engine::connection::{ConnectionEvent, ConnectionEventKind, Connector};
use blueflow_engine::error::ConnectionFailure;

use crate::advertisement::Advertisement;
use crate::error::DiscoveryFailure;
use crate::properties::{AttributePermissions, CharacteristicProperties};

/// Location of a characteristic or descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePath {
    /// Owning device
    pub device: Uuid,
    /// Owning service
    pub service: Uuid,
    /// Characteristic
    pub characteristic: Uuid,
    /// Descriptor, when the path names one
    pub descriptor: Option<Uuid>,
}

impl AttributePath {
    /// Path of a characteristic
    pub fn characteristic(device: Uuid, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            device,
            service,
            characteristic,
            descriptor: None,
        }
    }

    /// Path of a descriptor below this characteristic
    pub fn with_descriptor(self, descriptor: Uuid) -> Self {
        Self {
            descriptor: Some(descriptor),
            ..self
        }
    }

    /// Whether the path names a descriptor
    pub fn is_descriptor(&self) -> bool {
        self.descriptor.is_some()
    }

    /// UUID of the attribute the path ends at
    pub fn attribute(&self) -> Uuid {
        self.descriptor.unwrap_or(self.characteristic)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.service, self.characteristic)?;
        if let Some(descriptor) = self.descriptor {
            write!(f, "/{}", descriptor)?;
        }
        Ok(())
    }
}

/// A service reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Primary or secondary service
    pub is_primary: bool,
}

/// A characteristic reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Advertised properties
    pub properties: CharacteristicProperties,
}

/// A descriptor reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorInfo {
    /// Descriptor UUID
    pub uuid: Uuid,
    /// Access permissions
    pub permissions: AttributePermissions,
}

/// How a characteristic write is acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    /// The peripheral confirms the write
    #[default]
    WithResponse,
    /// The write is not confirmed
    WithoutResponse,
}

/// Scan filter passed to the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services (empty means all)
    pub services: Vec<Uuid>,
    /// Ignore advertisements from non-connectable peripherals
    pub connectable_only: bool,
}

impl ScanFilter {
    /// Whether an advertisement passes the filter
    pub fn accepts(&self, advertisement: &Advertisement) -> bool {
        if self.connectable_only && !advertisement.is_connectable {
            return false;
        }
        self.services.is_empty()
            || advertisement
                .services
                .iter()
                .any(|service| self.services.contains(service))
    }
}

impl From<&ScanConfig> for ScanFilter {
    fn from(config: &ScanConfig) -> Self {
        Self {
            services: config.services.clone(),
            connectable_only: config.connectable_only,
        }
    }
}

/// Callback emitted by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An advertisement was received
    DeviceDiscovered(Advertisement),
    /// A connection attempt succeeded
    Connected(Uuid),
    /// A connection attempt failed
    FailedToConnect(Uuid, String),
    /// The link went down, with an error if it was not requested
    Disconnected(Uuid, Option<String>),
    /// A characteristic read completed or a notification arrived
    ValueUpdated {
        /// Characteristic path
        path: AttributePath,
        /// New value or transport error
        result: Result<Bytes, String>,
    },
    /// A characteristic write completed
    WriteCompleted {
        /// Characteristic path
        path: AttributePath,
        /// Transport outcome
        result: Result<(), String>,
    },
    /// Notifications were enabled or disabled
    NotificationStateUpdated {
        /// Characteristic path
        path: AttributePath,
        /// Whether notifications are now on, or the transport error
        result: Result<bool, String>,
    },
    /// A descriptor read completed
    DescriptorValueUpdated {
        /// Descriptor path
        path: AttributePath,
        /// New value or transport error
        result: Result<Bytes, String>,
    },
    /// A descriptor write completed
    DescriptorWriteCompleted {
        /// Descriptor path
        path: AttributePath,
        /// Transport outcome
        result: Result<(), String>,
    },
}

impl TransportEvent {
    /// Device the event belongs to
    pub fn device(&self) -> Uuid {
        match self {
            TransportEvent::DeviceDiscovered(advertisement) => advertisement.peripheral,
            TransportEvent::Connected(id)
            | TransportEvent::FailedToConnect(id, _)
            | TransportEvent::Disconnected(id, _) => *id,
            TransportEvent::ValueUpdated { path, .. }
            | TransportEvent::WriteCompleted { path, .. }
            | TransportEvent::NotificationStateUpdated { path, .. }
            | TransportEvent::DescriptorValueUpdated { path, .. }
            | TransportEvent::DescriptorWriteCompleted { path, .. } => path.device,
        }
    }

    /// Translate link events for the connection machine
    pub fn connection_event(&self) -> Option<ConnectionEvent> {
        let (peripheral, kind) = match self {
            TransportEvent::Connected(id) => (*id, ConnectionEventKind::Connected),
            TransportEvent::FailedToConnect(id, error) => (
                *id,
                ConnectionEventKind::FailedToConnect(ConnectionFailure::new(error.clone())),
            ),
            TransportEvent::Disconnected(id, error) => (
                *id,
                ConnectionEventKind::Disconnected(error.clone().map(ConnectionFailure::new)),
            ),
            _ => return None,
        };
        Some(ConnectionEvent::new(peripheral, kind))
    }
}

/// The asynchronous transport every machine talks to
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Start scanning for advertisements
    fn scan(&self, filter: Option<ScanFilter>);

    /// Stop scanning
    fn stop_scan(&self);

    /// Start connecting to a device
    fn connect(&self, device: Uuid);

    /// Disconnect from a device, or cancel a pending connection
    fn disconnect(&self, device: Uuid);

    /// Enumerate the services of a connected device
    async fn enumerate_services(&self, device: Uuid) -> Result<Vec<ServiceInfo>, DiscoveryFailure>;

    /// Enumerate the characteristics of a service
    async fn enumerate_characteristics(
        &self,
        device: Uuid,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, DiscoveryFailure>;

    /// Enumerate the descriptors of a characteristic
    async fn enumerate_descriptors(
        &self,
        characteristic: AttributePath,
    ) -> Result<Vec<DescriptorInfo>, DiscoveryFailure>;

    /// Read a characteristic or descriptor value
    fn read_value(&self, path: AttributePath);

    /// Write a characteristic or descriptor value
    fn write_value(&self, path: AttributePath, data: Bytes, mode: WriteMode);

    /// Enable or disable notifications of a characteristic
    fn set_notify(&self, path: AttributePath, enabled: bool);

    /// Subscribe to transport callbacks
    fn events(&self) -> BoxStream<'static, TransportEvent>;
}

/// Connection side of a [`Transport`], as used by connection machines
#[derive(Debug, Clone)]
pub struct TransportConnector {
    transport: Arc<dyn Transport>,
}

impl TransportConnector {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Connector for TransportConnector {
    fn connect(&self, peripheral: Uuid) {
        self.transport.connect(peripheral);
    }

    fn cancel_connection(&self, peripheral: Uuid) {
        self.transport.disconnect(peripheral);
    }

    fn connection_events(&self) -> BoxStream<'static, ConnectionEvent> {
        self.transport
            .events()
            .filter_map(|event| futures::future::ready(event.connection_event()))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_path() {
        let (device, service, characteristic, descriptor) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let path = AttributePath::characteristic(device, service, characteristic);
        assert!(!path.is_descriptor());
        assert_eq!(path.attribute(), characteristic);

        let descriptor_path = path.with_descriptor(descriptor);
        assert!(descriptor_path.is_descriptor());
        assert_eq!(descriptor_path.attribute(), descriptor);
        assert_ne!(path, descriptor_path);
        assert!(descriptor_path.to_string().ends_with(&descriptor.to_string()));
    }

    #[test]
    fn test_connection_event_translation() {
        let id = Uuid::new_v4();
        assert_eq!(
            TransportEvent::FailedToConnect(id, "TEST".into()).connection_event(),
            Some(ConnectionEvent::new(
                id,
                ConnectionEventKind::FailedToConnect(ConnectionFailure::new("TEST"))
            ))
        );
        assert_eq!(
            TransportEvent::Disconnected(id, None).connection_event(),
            Some(ConnectionEvent::new(id, ConnectionEventKind::Disconnected(None)))
        );
        let path = AttributePath::characteristic(id, Uuid::new_v4(), Uuid::new_v4());
        let value = TransportEvent::ValueUpdated {
            path,
            result: Ok(Bytes::from_static(b"\x01")),
        };
        assert_eq!(value.connection_event(), None);
        assert_eq!(value.device(), id);
    }

    #[test]
    fn test_scan_filter() {
        let heart_rate = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
        let advertisement = Advertisement::new(Uuid::new_v4(), -70).with_service(heart_rate);

        assert!(ScanFilter::default().accepts(&advertisement));
        let filter = ScanFilter {
            services: vec![heart_rate],
            connectable_only: true,
        };
        assert!(filter.accepts(&advertisement));
        assert!(!filter.accepts(&advertisement.clone().connectable(false)));
        assert!(!filter.accepts(&Advertisement::new(Uuid::new_v4(), -70)));
    }
}

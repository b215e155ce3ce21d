/*!
 * Advertisement data and iBeacon framing.
 */
use std::collections::HashMap;
use std::fmt::Debug;

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Company identifier assigned to Apple
pub const APPLE_COMPANY_ID: u16 = 0x004c;

const IBEACON_TYPE: u8 = 0x02;
const IBEACON_LENGTH: u8 = 0x15;

/// Manufacturer-specific advertisement payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier
    pub company_id: u16,
    /// Payload following the company identifier
    pub data: Bytes,
}

impl ManufacturerData {
    /// Create manufacturer data
    pub fn new(company_id: u16, data: impl Into<Bytes>) -> Self {
        Self {
            company_id,
            data: data.into(),
        }
    }
}

/// One advertisement received while scanning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Session identifier of the peripheral
    pub peripheral: Uuid,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Manufacturer-specific data
    pub manufacturer_data: Option<ManufacturerData>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Bytes>,
    /// Advertised transmit power in dBm
    pub tx_power_level: Option<i16>,
    /// Whether the peripheral accepts connections
    pub is_connectable: bool,
}

impl Advertisement {
    /// A connectable advertisement with no payload
    pub fn new(peripheral: Uuid, rssi: i16) -> Self {
        Self {
            peripheral,
            local_name: None,
            rssi,
            manufacturer_data: None,
            services: Vec::new(),
            service_data: HashMap::new(),
            tx_power_level: None,
            is_connectable: true,
        }
    }

    /// Set the local name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the manufacturer data
    pub fn with_manufacturer_data(mut self, data: ManufacturerData) -> Self {
        self.manufacturer_data = Some(data);
        self
    }

    /// Add an advertised service
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Set whether the peripheral accepts connections
    pub fn connectable(mut self, is_connectable: bool) -> Self {
        self.is_connectable = is_connectable;
        self
    }

    /// Decode an iBeacon frame from the manufacturer data, if present
    pub fn ibeacon(&self) -> Option<IBeacon> {
        self.manufacturer_data.as_ref().and_then(IBeacon::decode)
    }
}

/// Decoded Apple iBeacon frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IBeacon {
    /// Proximity UUID
    pub uuid: Uuid,
    /// Major group number
    pub major: u16,
    /// Minor group number
    pub minor: u16,
    /// Calibrated RSSI at one metre
    pub measured_power: i8,
}

impl IBeacon {
    /// Decode an iBeacon frame
    ///
    /// The payload is `0x02 0x15`, a 16-byte proximity UUID, big-endian
    /// major and minor, and a signed measured power byte. Returns `None`
    /// for any other company or framing.
    pub fn decode(manufacturer: &ManufacturerData) -> Option<Self> {
        if manufacturer.company_id != APPLE_COMPANY_ID {
            return None;
        }

        let mut buf: &[u8] = &manufacturer.data;
        if buf.remaining() < 2 + usize::from(IBEACON_LENGTH) {
            return None;
        }
        if buf.get_u8() != IBEACON_TYPE || buf.get_u8() != IBEACON_LENGTH {
            return None;
        }

        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        Some(Self {
            uuid: Uuid::from_bytes(uuid),
            major: buf.get_u16(),
            minor: buf.get_u16(),
            measured_power: buf.get_i8(),
        })
    }
}

/// Resolves manufacturer company identifiers to names
pub trait CompanyCatalog: Send + Sync + Debug {
    /// Name of the company, if known
    fn company_name(&self, company_id: u16) -> Option<String>;
}

impl CompanyCatalog for HashMap<u16, String> {
    fn company_name(&self, company_id: u16) -> Option<String> {
        self.get(&company_id).cloned()
    }
}

/// Manufacturer name of an advertisement according to `catalog`
pub fn manufacturer_name(
    advertisement: &Advertisement,
    catalog: Option<&dyn CompanyCatalog>,
) -> Option<String> {
    let company_id = advertisement.manufacturer_data.as_ref()?.company_id;
    catalog?.company_name(company_id)
}

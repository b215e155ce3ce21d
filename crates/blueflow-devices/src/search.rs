/*!
 * Device search.
 *
 * A [`SearchFilter`] is a pure predicate over [`DeviceState`]. Applied to
 * a live registry stream it yields the filtered device list.
 */
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use blueflow_core::state::StateStream;
use blueflow_engine::registry::RegistryEntry;

use crate::device::{DeviceModel, DeviceState};

/// Predicate narrowing the device list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Case-insensitive text matched against identifier, name and manufacturer
    pub query: String,
    /// Only keep connectable devices
    pub connectable_only: bool,
    /// Only keep devices at least this strong, in dBm
    pub min_rssi: Option<i16>,
}

impl SearchFilter {
    /// Filter on a text query only
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Whether the device passes the filter
    pub fn matches(&self, device: &DeviceState) -> bool {
        if self.connectable_only && !device.connectable {
            return false;
        }
        if matches!(self.min_rssi, Some(min) if device.rssi < min) {
            return false;
        }

        let query = self.query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }

        let contains = |text: &str| text.to_lowercase().contains(&query);
        contains(&device.id.to_string())
            || device.name.as_deref().map_or(false, contains)
            || device.manufacturer_name.as_deref().map_or(false, contains)
    }

    /// Entries passing the filter, in their original order
    pub fn apply(&self, entries: &[RegistryEntry<DeviceModel>]) -> Vec<RegistryEntry<DeviceModel>> {
        entries
            .iter()
            .filter(|entry| self.matches(&entry.state))
            .cloned()
            .collect()
    }

    /// Filtered view of a live device list
    pub fn filtered_view(
        self,
        devices: StateStream<Vec<RegistryEntry<DeviceModel>>>,
    ) -> BoxStream<'static, Vec<RegistryEntry<DeviceModel>>> {
        devices
            .into_stream()
            .map(move |entries| self.apply(&entries))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use blueflow_engine::connectable::ConnectableDiscoveryState;
    use blueflow_engine::connection::ConnectionState;
    use blueflow_engine::discovery::DiscoveryState;

    use super::*;
    use crate::advertisement::Advertisement;

    fn device(id: &str, name: Option<&str>, manufacturer: Option<&str>, rssi: i16) -> DeviceState {
        let id = Uuid::parse_str(id).unwrap();
        DeviceState {
            id,
            name: name.map(str::to_string),
            rssi,
            advertisement: Advertisement::new(id, rssi),
            manufacturer_name: manufacturer.map(str::to_string),
            last_seen: Utc::now(),
            connectable: true,
            services: ConnectableDiscoveryState {
                discovery: DiscoveryState::NotDiscoveredYet,
                connection: ConnectionState::Disconnected,
                discovery_requested: false,
            },
        }
    }

    fn sample() -> Vec<DeviceState> {
        vec![
            device("12345678-0000-4000-8000-00000000abcd", Some("Heart Monitor"), None, -60),
            device("9abcdef0-1111-4111-8111-111111111111", None, Some("Nordic Semiconductor"), -80),
            device("fedcba98-2222-4222-8222-222222222222", Some("Lamp"), Some("Apple, Inc."), -40),
        ]
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let filter = SearchFilter::default();
        assert!(sample().iter().all(|d| filter.matches(d)));
        assert!(sample().iter().all(|d| SearchFilter::query("   ").matches(d)));
    }

    #[test]
    fn test_query_matches_identifier_substring() {
        let filter = SearchFilter::query("0000");
        let matched: Vec<bool> = sample().iter().map(|d| filter.matches(d)).collect();
        assert_eq!(matched, vec![true, false, false]);
    }

    #[test]
    fn test_query_is_case_insensitive_on_name_and_manufacturer() {
        let devices = sample();
        assert!(SearchFilter::query("heart").matches(&devices[0]));
        assert!(SearchFilter::query("NORDIC").matches(&devices[1]));
        assert!(SearchFilter::query("apple").matches(&devices[2]));
        assert!(SearchFilter::query("LAMP").matches(&devices[2]));
        assert!(!SearchFilter::query("thermostat").matches(&devices[0]));
    }

    #[test]
    fn test_rssi_and_connectable_filters() {
        let mut devices = sample();
        let strong = SearchFilter {
            min_rssi: Some(-65),
            ..SearchFilter::default()
        };
        let matched: Vec<bool> = devices.iter().map(|d| strong.matches(d)).collect();
        assert_eq!(matched, vec![true, false, true]);

        devices[2].connectable = false;
        let connectable = SearchFilter {
            connectable_only: true,
            ..SearchFilter::default()
        };
        assert!(!connectable.matches(&devices[2]));
        assert!(connectable.matches(&devices[0]));
    }
}

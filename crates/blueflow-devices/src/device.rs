/*!
 * Device model.
 *
 * A device owns the connection machine shared by all of its services,
 * characteristics and descriptors, plus a connect-then-discover machine
 * over its services. Re-advertisements update the advertised data in
 * place; the connection machine lives as long as the model.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_engine::connectable::{ConnectableDiscoveryState, ConnectableDiscoveryStateMachine};
use blueflow_engine::connection::{ConnectionState, ConnectionStateMachine};
use blueflow_engine::registry::{Entity, EntityRegistry};

use crate::advertisement::{Advertisement, IBeacon};
use crate::error::DiscoveryFailure;
use crate::model::{combine_latest, mirror_children};
use crate::service::{ServiceDiscovery, ServiceModel};
use crate::transport::{Transport, TransportConnector};

/// Service discovery state of a device
pub type ServiceDiscoveryState = ConnectableDiscoveryState<ServiceModel, DiscoveryFailure>;

/// Observable state of a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    /// Session identifier of the peripheral
    pub id: Uuid,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength of the latest advertisement
    pub rssi: i16,
    /// Latest advertisement
    pub advertisement: Advertisement,
    /// Manufacturer name resolved from the advertisement
    pub manufacturer_name: Option<String>,
    /// When the latest advertisement was received
    pub last_seen: DateTime<Utc>,
    /// Whether the latest advertisement was connectable and the
    /// connection machine accepts connections
    pub connectable: bool,
    /// Service discovery, including the shared connection state
    pub services: ServiceDiscoveryState,
}

impl DeviceState {
    /// Connection state of the device
    pub fn connection(&self) -> &ConnectionState {
        &self.services.connection
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Sighting {
    advertisement: Advertisement,
    manufacturer_name: Option<String>,
    last_seen: DateTime<Utc>,
}

impl Sighting {
    fn new(advertisement: Advertisement, manufacturer_name: Option<String>) -> Self {
        Self {
            advertisement,
            manufacturer_name,
            last_seen: Utc::now(),
        }
    }
}

fn describe(id: Uuid, sighting: &Sighting, services: &ServiceDiscoveryState) -> DeviceState {
    let advertisement = &sighting.advertisement;
    DeviceState {
        id,
        name: advertisement.local_name.clone(),
        rssi: advertisement.rssi,
        advertisement: advertisement.clone(),
        manufacturer_name: sighting.manufacturer_name.clone(),
        last_seen: sighting.last_seen,
        connectable: advertisement.is_connectable
            && services.connection != ConnectionState::NotConnectable,
        services: services.clone(),
    }
}

struct DeviceInner {
    id: Uuid,
    connection: ConnectionStateMachine,
    services: ConnectableDiscoveryStateMachine<ServiceModel, DiscoveryFailure>,
    registry: EntityRegistry<ServiceModel>,
    sighting: StatePublisher<Sighting>,
    state: StatePublisher<DeviceState>,
}

/// A peripheral seen while scanning
#[derive(Clone)]
pub struct DeviceModel {
    inner: Arc<DeviceInner>,
}

impl DeviceModel {
    /// Create the model of the advertising peripheral
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        advertisement: Advertisement,
        manufacturer_name: Option<String>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        let id = advertisement.peripheral;
        let label = id.to_string();

        let connection = ConnectionStateMachine::new(
            id,
            advertisement.is_connectable,
            Arc::new(TransportConnector::new(transport.clone())),
            config,
        );
        let services = ConnectableDiscoveryStateMachine::new(
            format!("services:{}", label),
            connection.clone(),
            Arc::new(ServiceDiscovery {
                device: id,
                transport,
                connection: connection.clone(),
                config,
            }),
            config,
        );
        let registry = EntityRegistry::new(config);
        mirror_children("services", &label, services.subscribe(), registry.clone());

        let sighting = StatePublisher::with_capacity(
            Sighting::new(advertisement, manufacturer_name),
            config.state_channel_capacity,
        );
        let state = StatePublisher::with_capacity(
            describe(id, &sighting.current(), &services.state()),
            config.state_channel_capacity,
        );
        combine_latest(
            "device",
            &label,
            sighting.subscribe(),
            services.subscribe(),
            state.clone(),
            move |sighting, services| describe(id, sighting, services),
        );

        Self {
            inner: Arc::new(DeviceInner {
                id,
                connection,
                services,
                registry,
                sighting,
                state,
            }),
        }
    }

    /// Session identifier of the peripheral
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Connect to the device
    pub fn connect(&self) {
        self.inner.services.connect();
    }

    /// Disconnect from the device
    pub fn disconnect(&self) {
        self.inner.services.disconnect();
    }

    /// Discover services, connecting first if needed
    pub fn discover_services(&self) {
        self.inner.services.discover();
    }

    /// The connection machine shared by everything below this device
    pub fn connection(&self) -> &ConnectionStateMachine {
        &self.inner.connection
    }

    /// The service discovery machine
    pub fn service_discovery(
        &self,
    ) -> &ConnectableDiscoveryStateMachine<ServiceModel, DiscoveryFailure> {
        &self.inner.services
    }

    /// Registry of the discovered services
    pub fn services(&self) -> &EntityRegistry<ServiceModel> {
        &self.inner.registry
    }

    /// Record a new advertisement from the same peripheral
    ///
    /// A connectable advertisement lets a device first seen as not
    /// connectable accept connections from now on.
    pub fn update_advertisement(
        &self,
        advertisement: Advertisement,
        manufacturer_name: Option<String>,
    ) {
        debug!(
            "Updating advertisement of {} (rssi {})",
            self.inner.id, advertisement.rssi
        );
        if advertisement.is_connectable {
            self.inner.connection.mark_connectable();
        }
        self.inner
            .sighting
            .publish(Sighting::new(advertisement, manufacturer_name));
    }

    /// The latest advertisement
    pub fn advertisement(&self) -> Advertisement {
        self.inner.sighting.current().advertisement
    }

    /// iBeacon frame of the latest advertisement, if any
    pub fn ibeacon(&self) -> Option<IBeacon> {
        self.advertisement().ibeacon()
    }
}

impl PartialEq for DeviceModel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceModel")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl Entity for DeviceModel {
    type Id = Uuid;
    type State = DeviceState;

    fn entity_id(&self) -> Uuid {
        self.id()
    }

    fn state(&self) -> DeviceState {
        self.inner.state.current()
    }

    fn subscribe(&self) -> StateStream<DeviceState> {
        self.inner.state.subscribe()
    }
}

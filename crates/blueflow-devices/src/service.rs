/*!
 * Service model.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_engine::connectable::{ConnectableDiscoveryState, ConnectableDiscoveryStateMachine};
use blueflow_engine::connection::ConnectionStateMachine;
use blueflow_engine::discovery::DiscoveryStrategy;
use blueflow_engine::registry::{Entity, EntityRegistry};

use crate::characteristic::{CharacteristicDiscovery, CharacteristicModel};
use crate::error::DiscoveryFailure;
use crate::model::{map_latest, mirror_children};
use crate::transport::{ServiceInfo, Transport};

/// Characteristic discovery state of a service
pub type CharacteristicDiscoveryState =
    ConnectableDiscoveryState<CharacteristicModel, DiscoveryFailure>;

/// Observable state of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceState {
    /// Service UUID
    pub uuid: Uuid,
    /// Owning device
    pub device: Uuid,
    /// Primary or secondary service
    pub is_primary: bool,
    /// Characteristic discovery
    pub characteristics: CharacteristicDiscoveryState,
}

struct ServiceInner {
    device: Uuid,
    info: ServiceInfo,
    characteristics: ConnectableDiscoveryStateMachine<CharacteristicModel, DiscoveryFailure>,
    registry: EntityRegistry<CharacteristicModel>,
    state: StatePublisher<ServiceState>,
}

/// A discovered service
#[derive(Clone)]
pub struct ServiceModel {
    inner: Arc<ServiceInner>,
}

impl ServiceModel {
    /// Create the model of a service of `device`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        device: Uuid,
        info: ServiceInfo,
        transport: Arc<dyn Transport>,
        connection: ConnectionStateMachine,
        config: EngineConfig,
    ) -> Self {
        let id = info.uuid.to_string();
        let strategy = CharacteristicDiscovery {
            device,
            service: info.uuid,
            transport,
            connection: connection.clone(),
            config,
        };
        let characteristics = ConnectableDiscoveryStateMachine::new(
            format!("characteristics:{}", id),
            connection,
            Arc::new(strategy),
            config,
        );
        let registry = EntityRegistry::new(config);
        mirror_children(
            "characteristics",
            &id,
            characteristics.subscribe(),
            registry.clone(),
        );

        let describe = move |characteristics: &CharacteristicDiscoveryState| ServiceState {
            uuid: info.uuid,
            device,
            is_primary: info.is_primary,
            characteristics: characteristics.clone(),
        };
        let state = StatePublisher::with_capacity(
            describe(&characteristics.state()),
            config.state_channel_capacity,
        );
        map_latest(
            "service",
            &id,
            characteristics.subscribe(),
            state.clone(),
            describe,
        );

        Self {
            inner: Arc::new(ServiceInner {
                device,
                info,
                characteristics,
                registry,
                state,
            }),
        }
    }

    /// Service UUID
    pub fn uuid(&self) -> Uuid {
        self.inner.info.uuid
    }

    /// Owning device
    pub fn device(&self) -> Uuid {
        self.inner.device
    }

    /// Primary or secondary service
    pub fn is_primary(&self) -> bool {
        self.inner.info.is_primary
    }

    /// Discover characteristics, connecting first if needed
    pub fn discover_characteristics(&self) {
        self.inner.characteristics.discover();
    }

    /// Connect the owning device
    pub fn connect(&self) {
        self.inner.characteristics.connect();
    }

    /// Disconnect the owning device
    pub fn disconnect(&self) {
        self.inner.characteristics.disconnect();
    }

    /// The characteristic discovery machine
    pub fn characteristic_discovery(
        &self,
    ) -> &ConnectableDiscoveryStateMachine<CharacteristicModel, DiscoveryFailure> {
        &self.inner.characteristics
    }

    /// Registry of the discovered characteristics
    pub fn characteristics(&self) -> &EntityRegistry<CharacteristicModel> {
        &self.inner.registry
    }
}

impl PartialEq for ServiceModel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for ServiceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceModel")
            .field("device", &self.inner.device)
            .field("uuid", &self.inner.info.uuid)
            .finish()
    }
}

impl Entity for ServiceModel {
    type Id = Uuid;
    type State = ServiceState;

    fn entity_id(&self) -> Uuid {
        self.uuid()
    }

    fn state(&self) -> ServiceState {
        self.inner.state.current()
    }

    fn subscribe(&self) -> StateStream<ServiceState> {
        self.inner.state.subscribe()
    }
}

/// Enumerates the services of one device
pub(crate) struct ServiceDiscovery {
    pub(crate) device: Uuid,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connection: ConnectionStateMachine,
    pub(crate) config: EngineConfig,
}

#[async_trait]
impl DiscoveryStrategy<ServiceModel, DiscoveryFailure> for ServiceDiscovery {
    async fn discover(&self) -> Result<Vec<ServiceModel>, DiscoveryFailure> {
        let services = self.transport.enumerate_services(self.device).await?;

        Ok(services
            .into_iter()
            .map(|info| {
                ServiceModel::new(
                    self.device,
                    info,
                    self.transport.clone(),
                    self.connection.clone(),
                    self.config,
                )
            })
            .collect())
    }
}

/*!
 * Characteristic model.
 *
 * A characteristic owns a value machine and a connect-then-discover
 * machine over its descriptors. It shares its device's connection.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_engine::connectable::{ConnectableDiscoveryState, ConnectableDiscoveryStateMachine};
use blueflow_engine::connection::ConnectionStateMachine;
use blueflow_engine::discovery::DiscoveryStrategy;
use blueflow_engine::registry::{Entity, EntityRegistry};

use crate::descriptor::{DescriptorDiscovery, DescriptorModel};
use crate::error::DiscoveryFailure;
use crate::model::{combine_latest, mirror_children};
use crate::properties::CharacteristicProperties;
use crate::transport::{AttributePath, Transport, WriteMode};
use crate::value::{CharacteristicValueStateMachine, ValueState};

/// Descriptor discovery state of a characteristic
pub type DescriptorDiscoveryState = ConnectableDiscoveryState<DescriptorModel, DiscoveryFailure>;

/// Observable state of a characteristic
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicState {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Full path of the characteristic
    pub path: AttributePath,
    /// Advertised properties
    pub properties: CharacteristicProperties,
    /// Value machine state
    pub value: ValueState,
    /// Descriptor discovery
    pub descriptors: DescriptorDiscoveryState,
}

struct CharacteristicInner {
    path: AttributePath,
    properties: CharacteristicProperties,
    value: CharacteristicValueStateMachine,
    descriptors: ConnectableDiscoveryStateMachine<DescriptorModel, DiscoveryFailure>,
    registry: EntityRegistry<DescriptorModel>,
    state: StatePublisher<CharacteristicState>,
}

/// A discovered characteristic
#[derive(Clone)]
pub struct CharacteristicModel {
    inner: Arc<CharacteristicInner>,
}

impl CharacteristicModel {
    /// Create the model of the characteristic at `path`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        path: AttributePath,
        properties: CharacteristicProperties,
        transport: Arc<dyn Transport>,
        connection: ConnectionStateMachine,
        config: EngineConfig,
    ) -> Self {
        let id = path.characteristic.to_string();
        let value =
            CharacteristicValueStateMachine::new(path, properties, transport.clone(), config);
        let descriptors = ConnectableDiscoveryStateMachine::new(
            format!("descriptors:{}", id),
            connection,
            Arc::new(DescriptorDiscovery {
                characteristic: path,
                transport,
                config,
            }),
            config,
        );
        let registry = EntityRegistry::new(config);
        mirror_children("descriptors", &id, descriptors.subscribe(), registry.clone());

        let describe = move |value: &ValueState, descriptors: &DescriptorDiscoveryState| {
            CharacteristicState {
                uuid: path.characteristic,
                path,
                properties,
                value: value.clone(),
                descriptors: descriptors.clone(),
            }
        };
        let state = StatePublisher::with_capacity(
            describe(&value.state(), &descriptors.state()),
            config.state_channel_capacity,
        );
        combine_latest(
            "characteristic",
            &id,
            value.subscribe(),
            descriptors.subscribe(),
            state.clone(),
            describe,
        );

        Self {
            inner: Arc::new(CharacteristicInner {
                path,
                properties,
                value,
                descriptors,
                registry,
                state,
            }),
        }
    }

    /// Characteristic UUID
    pub fn uuid(&self) -> Uuid {
        self.inner.path.characteristic
    }

    /// Full path of the characteristic
    pub fn path(&self) -> AttributePath {
        self.inner.path
    }

    /// Advertised properties
    pub fn properties(&self) -> CharacteristicProperties {
        self.inner.properties
    }

    /// The value machine
    pub fn value(&self) -> &CharacteristicValueStateMachine {
        &self.inner.value
    }

    /// Read the value
    pub fn read(&self) {
        self.inner.value.read();
    }

    /// Write `data` in `mode`
    pub fn write(&self, data: impl Into<Bytes>, mode: WriteMode) {
        self.inner.value.write(data, mode);
    }

    /// Enable or disable notifications
    pub fn set_notify(&self, enabled: bool) {
        self.inner.value.set_notify(enabled);
    }

    /// Discover descriptors, connecting first if needed
    pub fn discover_descriptors(&self) {
        self.inner.descriptors.discover();
    }

    /// The descriptor discovery machine
    pub fn descriptor_discovery(
        &self,
    ) -> &ConnectableDiscoveryStateMachine<DescriptorModel, DiscoveryFailure> {
        &self.inner.descriptors
    }

    /// Registry of the discovered descriptors
    pub fn descriptors(&self) -> &EntityRegistry<DescriptorModel> {
        &self.inner.registry
    }
}

impl PartialEq for CharacteristicModel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for CharacteristicModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicModel")
            .field("path", &self.inner.path)
            .field("properties", &self.inner.properties)
            .finish()
    }
}

impl Entity for CharacteristicModel {
    type Id = Uuid;
    type State = CharacteristicState;

    fn entity_id(&self) -> Uuid {
        self.uuid()
    }

    fn state(&self) -> CharacteristicState {
        self.inner.state.current()
    }

    fn subscribe(&self) -> StateStream<CharacteristicState> {
        self.inner.state.subscribe()
    }
}

/// Enumerates the characteristics of one service
pub(crate) struct CharacteristicDiscovery {
    pub(crate) device: Uuid,
    pub(crate) service: Uuid,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connection: ConnectionStateMachine,
    pub(crate) config: EngineConfig,
}

#[async_trait]
impl DiscoveryStrategy<CharacteristicModel, DiscoveryFailure> for CharacteristicDiscovery {
    async fn discover(&self) -> Result<Vec<CharacteristicModel>, DiscoveryFailure> {
        let characteristics = self
            .transport
            .enumerate_characteristics(self.device, self.service)
            .await?;

        Ok(characteristics
            .into_iter()
            .map(|info| {
                CharacteristicModel::new(
                    AttributePath::characteristic(self.device, self.service, info.uuid),
                    info.properties,
                    self.transport.clone(),
                    self.connection.clone(),
                    self.config,
                )
            })
            .collect())
    }
}

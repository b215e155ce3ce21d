/*!
 * Descriptor model.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_engine::discovery::DiscoveryStrategy;
use blueflow_engine::registry::Entity;

use crate::error::DiscoveryFailure;
use crate::model::map_latest;
use crate::properties::AttributePermissions;
use crate::transport::{AttributePath, Transport};
use crate::value::{DescriptorValueStateMachine, ValueState};

/// Observable state of a descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorState {
    /// Descriptor UUID
    pub uuid: Uuid,
    /// Full path of the descriptor
    pub path: AttributePath,
    /// Access permissions
    pub permissions: AttributePermissions,
    /// Value machine state
    pub value: ValueState,
}

struct DescriptorInner {
    path: AttributePath,
    value: DescriptorValueStateMachine,
    state: StatePublisher<DescriptorState>,
}

/// A discovered descriptor and its value machine
#[derive(Clone)]
pub struct DescriptorModel {
    inner: Arc<DescriptorInner>,
}

impl DescriptorModel {
    /// Create the model of the descriptor at `path`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        path: AttributePath,
        permissions: AttributePermissions,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        let value = DescriptorValueStateMachine::new(path, permissions, transport, config);
        let describe = move |value: &ValueState| DescriptorState {
            uuid: path.attribute(),
            path,
            permissions,
            value: value.clone(),
        };

        let state = StatePublisher::with_capacity(
            describe(&value.state()),
            config.state_channel_capacity,
        );
        map_latest(
            "descriptor",
            &path.attribute().to_string(),
            value.subscribe(),
            state.clone(),
            describe,
        );

        Self {
            inner: Arc::new(DescriptorInner { path, value, state }),
        }
    }

    /// Descriptor UUID
    pub fn uuid(&self) -> Uuid {
        self.inner.path.attribute()
    }

    /// Full path of the descriptor
    pub fn path(&self) -> AttributePath {
        self.inner.path
    }

    /// The value machine
    pub fn value(&self) -> &DescriptorValueStateMachine {
        &self.inner.value
    }

    /// Read the descriptor value
    pub fn read(&self) {
        self.inner.value.read();
    }

    /// Write the descriptor value
    pub fn write(&self, data: impl Into<Bytes>) {
        self.inner.value.write(data);
    }
}

impl PartialEq for DescriptorModel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for DescriptorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorModel")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl Entity for DescriptorModel {
    type Id = Uuid;
    type State = DescriptorState;

    fn entity_id(&self) -> Uuid {
        self.uuid()
    }

    fn state(&self) -> DescriptorState {
        self.inner.state.current()
    }

    fn subscribe(&self) -> StateStream<DescriptorState> {
        self.inner.state.subscribe()
    }
}

/// Enumerates the descriptors of one characteristic
pub(crate) struct DescriptorDiscovery {
    pub(crate) characteristic: AttributePath,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: EngineConfig,
}

#[async_trait]
impl DiscoveryStrategy<DescriptorModel, DiscoveryFailure> for DescriptorDiscovery {
    async fn discover(&self) -> Result<Vec<DescriptorModel>, DiscoveryFailure> {
        let descriptors = self
            .transport
            .enumerate_descriptors(self.characteristic)
            .await?;

        Ok(descriptors
            .into_iter()
            .map(|info| {
                DescriptorModel::new(
                    self.characteristic.with_descriptor(info.uuid),
                    info.permissions,
                    self.transport.clone(),
                    self.config,
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::simulated::SimulatedTransport;
    use crate::transport::DescriptorInfo;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_descriptor_state_follows_value() {
        let transport = SimulatedTransport::responsive();
        let path = AttributePath::characteristic(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .with_descriptor(Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb));
        transport.set_value(path, vec![0x01, 0x00]);

        let model = DescriptorModel::new(
            path,
            AttributePermissions::READ_WRITE,
            transport.clone(),
            EngineConfig::default(),
        );
        let mut stream = model.subscribe();
        model.read();

        let state = stream
            .wait_for_timeout(WAIT, |s| s.value.value.is_some())
            .await
            .unwrap();
        assert_eq!(state.uuid, path.attribute());
        assert_eq!(state.value.value, Some(Bytes::from_static(&[0x01, 0x00])));
    }

    #[tokio::test]
    async fn test_descriptor_discovery_builds_models() {
        let transport = SimulatedTransport::new();
        let characteristic =
            AttributePath::characteristic(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let uuid = Uuid::new_v4();
        transport.set_descriptors(
            characteristic,
            Ok(vec![DescriptorInfo {
                uuid,
                permissions: AttributePermissions::READ_ONLY,
            }]),
        );

        let strategy = DescriptorDiscovery {
            characteristic,
            transport: transport.clone(),
            config: EngineConfig::default(),
        };
        let models = strategy.discover().await.unwrap();

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].path(), characteristic.with_descriptor(uuid));
        assert_eq!(models[0].value().permissions(), AttributePermissions::READ_ONLY);
    }
}

/*!
 * Leaf value machines.
 *
 * Characteristic and descriptor values are plain read/write actors, not
 * discovery machines. Requests go to the transport fire-and-forget and the
 * matching completion events are folded into a [`ValueState`]. A request
 * the attribute does not support is refused locally with
 * [`ValueFailure::NotPermitted`] and never reaches the transport.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_core::utils::spawn_actor;

use crate::error::{ValueFailure, ValueOperation};
use crate::properties::{AttributePermissions, CharacteristicProperties};
use crate::transport::{AttributePath, Transport, TransportEvent, WriteMode};

/// State of a characteristic or descriptor value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueState {
    /// Last value read or notified
    pub value: Option<Bytes>,
    /// Whether notifications are enabled
    pub is_notifying: bool,
    /// Last failure, cleared by the next successful completion
    pub error: Option<ValueFailure>,
    /// When `value` was last updated
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum ValueCommand {
    Read,
    Write(Bytes, WriteMode),
    SetNotify(bool),
}

impl ValueCommand {
    fn operation(&self) -> ValueOperation {
        match self {
            ValueCommand::Read => ValueOperation::Read,
            ValueCommand::Write(..) => ValueOperation::Write,
            ValueCommand::SetNotify(_) => ValueOperation::Notify,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Capabilities {
    Characteristic(CharacteristicProperties),
    Descriptor(AttributePermissions),
}

impl Capabilities {
    fn permits(&self, command: &ValueCommand) -> bool {
        match (self, command) {
            (Capabilities::Characteristic(props), ValueCommand::Read) => props.can_read(),
            (Capabilities::Characteristic(props), ValueCommand::Write(_, mode)) => {
                props.can_write(*mode)
            }
            (Capabilities::Characteristic(props), ValueCommand::SetNotify(_)) => props.can_notify(),
            (Capabilities::Descriptor(permissions), ValueCommand::Read) => permissions.readable,
            (Capabilities::Descriptor(permissions), ValueCommand::Write(..)) => {
                permissions.writeable
            }
            (Capabilities::Descriptor(_), ValueCommand::SetNotify(_)) => false,
        }
    }
}

/// Value machine plumbing shared by characteristics and descriptors
#[derive(Clone)]
struct ValueHandle {
    path: AttributePath,
    commands: mpsc::UnboundedSender<ValueCommand>,
    state: StatePublisher<ValueState>,
}

impl ValueHandle {
    fn spawn(
        path: AttributePath,
        capabilities: Capabilities,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        let state =
            StatePublisher::with_capacity(ValueState::default(), config.state_channel_capacity);
        let (commands, receiver) = mpsc::unbounded_channel();

        let actor = ValueActor {
            path,
            capabilities,
            events: transport.events(),
            transport,
            state: state.clone(),
            commands: receiver,
        };
        spawn_actor("value", Some(&path.attribute().to_string()), actor.run());

        Self {
            path,
            commands,
            state,
        }
    }

    fn send(&self, command: ValueCommand) {
        if self.commands.send(command).is_err() {
            warn!("Value machine for {} has stopped", self.path);
        }
    }
}

struct ValueActor {
    path: AttributePath,
    capabilities: Capabilities,
    transport: Arc<dyn Transport>,
    state: StatePublisher<ValueState>,
    commands: mpsc::UnboundedReceiver<ValueCommand>,
    events: BoxStream<'static, TransportEvent>,
}

enum Completion {
    Value(Result<Bytes, String>),
    Written(Result<(), String>),
    Notifying(Result<bool, String>),
}

impl ValueActor {
    async fn run(mut self) {
        let mut events_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.events.next(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Transport events ended for {}", self.path);
                        events_open = false;
                    }
                },
            }
        }

        debug!("Value machine for {} stopped", self.path);
    }

    fn update(&self, f: impl FnOnce(&mut ValueState)) {
        let mut next = self.state.current();
        f(&mut next);
        self.state.publish_if_changed(next);
    }

    fn handle_command(&mut self, command: ValueCommand) {
        let operation = command.operation();
        if !self.capabilities.permits(&command) {
            debug!("Refusing {} on {}: not permitted", operation, self.path);
            self.update(|state| state.error = Some(ValueFailure::NotPermitted(operation)));
            return;
        }

        self.update(|state| state.error = None);
        debug!("Requesting {} on {}", operation, self.path);
        match command {
            ValueCommand::Read => self.transport.read_value(self.path),
            ValueCommand::Write(data, mode) => self.transport.write_value(self.path, data, mode),
            ValueCommand::SetNotify(enabled) => self.transport.set_notify(self.path, enabled),
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        let (path, completion) = match event {
            TransportEvent::ValueUpdated { path, result }
            | TransportEvent::DescriptorValueUpdated { path, result } => {
                (path, Completion::Value(result))
            }
            TransportEvent::WriteCompleted { path, result }
            | TransportEvent::DescriptorWriteCompleted { path, result } => {
                (path, Completion::Written(result))
            }
            TransportEvent::NotificationStateUpdated { path, result } => {
                (path, Completion::Notifying(result))
            }
            _ => return,
        };
        if path != self.path {
            return;
        }

        match completion {
            Completion::Value(Ok(value)) => self.update(|state| {
                state.value = Some(value);
                state.error = None;
                state.updated_at = Some(Utc::now());
            }),
            Completion::Written(Ok(())) => self.update(|state| state.error = None),
            Completion::Notifying(Ok(enabled)) => self.update(|state| {
                state.is_notifying = enabled;
                state.error = None;
            }),
            Completion::Value(Err(error))
            | Completion::Written(Err(error))
            | Completion::Notifying(Err(error)) => {
                warn!("Transport error on {}: {}", self.path, error);
                self.update(|state| state.error = Some(ValueFailure::Transport(error)));
            }
        }
    }
}

/// Read, write and notify machine of a characteristic value
#[derive(Clone)]
pub struct CharacteristicValueStateMachine {
    properties: CharacteristicProperties,
    inner: ValueHandle,
}

impl Debug for CharacteristicValueStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicValueStateMachine")
            .field("path", &self.inner.path)
            .field("properties", &self.properties)
            .finish()
    }
}

impl CharacteristicValueStateMachine {
    /// Create the value machine of the characteristic at `path`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        path: AttributePath,
        properties: CharacteristicProperties,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            properties,
            inner: ValueHandle::spawn(
                path,
                Capabilities::Characteristic(properties),
                transport,
                config,
            ),
        }
    }

    /// Characteristic path
    pub fn path(&self) -> AttributePath {
        self.inner.path
    }

    /// Advertised properties
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Current value state
    pub fn state(&self) -> ValueState {
        self.inner.state.current()
    }

    /// Subscribe to value state changes
    pub fn subscribe(&self) -> StateStream<ValueState> {
        self.inner.state.subscribe()
    }

    /// Read the value
    pub fn read(&self) {
        self.inner.send(ValueCommand::Read);
    }

    /// Write `data` in `mode`
    pub fn write(&self, data: impl Into<Bytes>, mode: WriteMode) {
        self.inner.send(ValueCommand::Write(data.into(), mode));
    }

    /// Enable or disable notifications
    pub fn set_notify(&self, enabled: bool) {
        self.inner.send(ValueCommand::SetNotify(enabled));
    }
}

/// Read and write machine of a descriptor value
#[derive(Clone)]
pub struct DescriptorValueStateMachine {
    permissions: AttributePermissions,
    inner: ValueHandle,
}

impl Debug for DescriptorValueStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorValueStateMachine")
            .field("path", &self.inner.path)
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl DescriptorValueStateMachine {
    /// Create the value machine of the descriptor at `path`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        path: AttributePath,
        permissions: AttributePermissions,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            permissions,
            inner: ValueHandle::spawn(
                path,
                Capabilities::Descriptor(permissions),
                transport,
                config,
            ),
        }
    }

    /// Descriptor path
    pub fn path(&self) -> AttributePath {
        self.inner.path
    }

    /// Access permissions
    pub fn permissions(&self) -> AttributePermissions {
        self.permissions
    }

    /// Current value state
    pub fn state(&self) -> ValueState {
        self.inner.state.current()
    }

    /// Subscribe to value state changes
    pub fn subscribe(&self) -> StateStream<ValueState> {
        self.inner.state.subscribe()
    }

    /// Read the value
    pub fn read(&self) {
        self.inner.send(ValueCommand::Read);
    }

    /// Write `data`
    pub fn write(&self, data: impl Into<Bytes>) {
        self.inner
            .send(ValueCommand::Write(data.into(), WriteMode::WithResponse));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::simulated::{SimulatedTransport, TransportCall};

    const WAIT: Duration = Duration::from_secs(5);

    fn characteristic_path() -> AttributePath {
        AttributePath::characteristic(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    fn characteristic(
        transport: &Arc<SimulatedTransport>,
        properties: CharacteristicProperties,
    ) -> CharacteristicValueStateMachine {
        CharacteristicValueStateMachine::new(
            characteristic_path(),
            properties,
            transport.clone(),
            EngineConfig::default(),
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_read_folds_value_update() {
        let transport = SimulatedTransport::new();
        let machine = characteristic(&transport, CharacteristicProperties::READ);
        let mut stream = machine.subscribe();

        machine.read();
        transport
            .wait_for_call(WAIT, |call| *call == TransportCall::ReadValue(machine.path()))
            .await
            .unwrap();
        transport.emit(TransportEvent::ValueUpdated {
            path: machine.path(),
            result: Ok(Bytes::from_static(&[0x2a])),
        });

        let state = stream
            .wait_for_timeout(WAIT, |s| s.value.is_some())
            .await
            .unwrap();
        assert_eq!(state.value, Some(Bytes::from_static(&[0x2a])));
        assert!(state.updated_at.is_some());
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn test_write_refused_locally_without_transport_call() {
        let transport = SimulatedTransport::new();
        let machine = characteristic(&transport, CharacteristicProperties::READ);
        let mut stream = machine.subscribe();

        machine.write(vec![0x01], WriteMode::WithResponse);
        let state = stream
            .wait_for_timeout(WAIT, |s| s.error.is_some())
            .await
            .unwrap();

        assert_eq!(
            state.error,
            Some(ValueFailure::NotPermitted(ValueOperation::Write))
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_write_mode_gate() {
        let transport = SimulatedTransport::new();
        let machine = characteristic(&transport, CharacteristicProperties::WRITE_WITHOUT_RESPONSE);
        let mut stream = machine.subscribe();

        machine.write(vec![0x01], WriteMode::WithoutResponse);
        transport
            .wait_for_call(WAIT, |call| matches!(call, TransportCall::WriteValue(..)))
            .await
            .unwrap();

        machine.write(vec![0x02], WriteMode::WithResponse);
        stream
            .wait_for_timeout(WAIT, |s| s.error.is_some())
            .await
            .unwrap();
        assert_eq!(
            transport
                .calls()
                .iter()
                .filter(|call| matches!(call, TransportCall::WriteValue(..)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_transport_error_then_recovery() {
        let transport = SimulatedTransport::new();
        let machine = characteristic(&transport, CharacteristicProperties::READ);
        let mut stream = machine.subscribe();

        transport.emit(TransportEvent::ValueUpdated {
            path: machine.path(),
            result: Err("insufficient authentication".into()),
        });
        let failed = stream
            .wait_for_timeout(WAIT, |s| s.error.is_some())
            .await
            .unwrap();
        assert_eq!(
            failed.error,
            Some(ValueFailure::Transport("insufficient authentication".into()))
        );

        transport.emit(TransportEvent::ValueUpdated {
            path: machine.path(),
            result: Ok(Bytes::from_static(b"ok")),
        });
        let recovered = stream
            .wait_for_timeout(WAIT, |s| s.error.is_none())
            .await
            .unwrap();
        assert_eq!(recovered.value, Some(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_notifications() {
        let transport = SimulatedTransport::new();
        let machine = characteristic(&transport, CharacteristicProperties::NOTIFY);
        let mut stream = machine.subscribe();

        machine.set_notify(true);
        transport
            .wait_for_call(WAIT, |call| *call == TransportCall::SetNotify(machine.path(), true))
            .await
            .unwrap();
        transport.emit(TransportEvent::NotificationStateUpdated {
            path: machine.path(),
            result: Ok(true),
        });
        stream
            .wait_for_timeout(WAIT, |s| s.is_notifying)
            .await
            .unwrap();

        transport.emit(TransportEvent::ValueUpdated {
            path: machine.path(),
            result: Ok(Bytes::from_static(&[0x48])),
        });
        let state = stream
            .wait_for_timeout(WAIT, |s| s.value.is_some())
            .await
            .unwrap();
        assert!(state.is_notifying);
    }

    #[tokio::test]
    async fn test_events_for_other_attributes_are_ignored() {
        let transport = SimulatedTransport::new();
        let machine = characteristic(&transport, CharacteristicProperties::READ);
        let other = characteristic(&transport, CharacteristicProperties::READ);
        let mut stream = other.subscribe();

        transport.emit(TransportEvent::ValueUpdated {
            path: machine.path(),
            result: Ok(Bytes::from_static(&[0x01])),
        });
        transport.emit(TransportEvent::ValueUpdated {
            path: other.path(),
            result: Ok(Bytes::from_static(&[0x02])),
        });

        stream
            .wait_for_timeout(WAIT, |s| s.value.is_some())
            .await
            .unwrap();
        assert_eq!(other.state().value, Some(Bytes::from_static(&[0x02])));
        let mut first = machine.subscribe();
        let state = first
            .wait_for_timeout(WAIT, |s| s.value.is_some())
            .await
            .unwrap();
        assert_eq!(state.value, Some(Bytes::from_static(&[0x01])));
    }

    #[tokio::test]
    async fn test_descriptor_permissions() {
        let transport = SimulatedTransport::new();
        let path = characteristic_path().with_descriptor(Uuid::new_v4());
        let machine = DescriptorValueStateMachine::new(
            path,
            AttributePermissions::READ_ONLY,
            transport.clone(),
            EngineConfig::default(),
        );
        let mut stream = machine.subscribe();

        machine.write(vec![0x01, 0x00]);
        let refused = stream
            .wait_for_timeout(WAIT, |s| s.error.is_some())
            .await
            .unwrap();
        assert_eq!(
            refused.error,
            Some(ValueFailure::NotPermitted(ValueOperation::Write))
        );

        machine.read();
        transport
            .wait_for_call(WAIT, |call| *call == TransportCall::ReadValue(path))
            .await
            .unwrap();
        transport.emit(TransportEvent::DescriptorValueUpdated {
            path,
            result: Ok(Bytes::from_static(&[0x01, 0x00])),
        });
        let state = stream
            .wait_for_timeout(WAIT, |s| s.value.is_some())
            .await
            .unwrap();
        assert_eq!(state.error, None);
        assert_eq!(transport.calls().len(), 1);
    }
}

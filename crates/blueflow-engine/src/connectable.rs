/*!
 * Connect-then-discover orchestration.
 *
 * A [`ConnectableDiscoveryStateMachine`] owns a discovery machine, shares
 * its device's connection machine, and keeps a `discovery_requested` flag.
 * A `discover()` issued while the link is down connects first; the actor
 * fires the deferred discovery as soon as the link comes up, clearing the
 * flag in the same step.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_core::utils::spawn_actor;

use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::discovery::{DiscoveryState, DiscoveryStateMachine, DiscoveryStrategy};

/// Combined connection and discovery state of an entity
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectableDiscoveryState<V, E> {
    /// Discovery of the entity's children
    pub discovery: DiscoveryState<V, E>,
    /// Connection of the owning device
    pub connection: ConnectionState,
    /// A discovery is waiting for the connection to come up
    pub discovery_requested: bool,
}

impl<V, E> ConnectableDiscoveryState<V, E> {
    fn needs_deferred_discovery(&self) -> bool {
        self.discovery_requested
            && self.connection.is_connected()
            && !self.discovery.is_discovering()
    }
}

enum ConnectableCommand {
    Discover,
}

/// Handle to a connect-then-discover actor
pub struct ConnectableDiscoveryStateMachine<V, E> {
    connection: ConnectionStateMachine,
    discovery: DiscoveryStateMachine<V, E>,
    commands: mpsc::UnboundedSender<ConnectableCommand>,
    state: StatePublisher<ConnectableDiscoveryState<V, E>>,
}

impl<V, E> Clone for ConnectableDiscoveryStateMachine<V, E> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            discovery: self.discovery.clone(),
            commands: self.commands.clone(),
            state: self.state.clone(),
        }
    }
}

impl<V, E> Debug for ConnectableDiscoveryStateMachine<V, E>
where
    V: Clone + Debug + Send + 'static,
    E: Clone + Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectableDiscoveryStateMachine")
            .field("connection", &self.connection.id())
            .field("state", &self.state.current())
            .finish()
    }
}

impl<V, E> ConnectableDiscoveryStateMachine<V, E>
where
    V: Clone + Debug + PartialEq + Send + Sync + 'static,
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
{
    /// Compose a shared connection with a new discovery machine
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        label: impl Into<String>,
        connection: ConnectionStateMachine,
        strategy: Arc<dyn DiscoveryStrategy<V, E>>,
        config: EngineConfig,
    ) -> Self {
        let label = label.into();
        let discovery = DiscoveryStateMachine::new(label.clone(), strategy, config);

        // Subscribe before sampling so nothing published in between is lost
        let connection_updates = connection.subscribe();
        let discovery_updates = discovery.subscribe();
        let initial = ConnectableDiscoveryState {
            discovery: discovery.state(),
            connection: connection.state(),
            discovery_requested: false,
        };

        let state = StatePublisher::with_capacity(initial.clone(), config.state_channel_capacity);
        let (commands, receiver) = mpsc::unbounded_channel();

        let actor = ConnectableActor {
            label: label.clone(),
            connection: connection.clone(),
            discovery: discovery.clone(),
            current: initial,
            state: state.clone(),
            commands: receiver,
            connection_updates,
            discovery_updates,
        };
        spawn_actor("connectable", Some(&label), actor.run());

        Self {
            connection,
            discovery,
            commands,
            state,
        }
    }

    /// Current combined state
    pub fn state(&self) -> ConnectableDiscoveryState<V, E> {
        self.state.current()
    }

    /// Subscribe to combined state changes, starting with the current state
    pub fn subscribe(&self) -> StateStream<ConnectableDiscoveryState<V, E>> {
        self.state.subscribe()
    }

    /// Discover now if connected, otherwise connect and discover afterwards
    pub fn discover(&self) {
        if self.commands.send(ConnectableCommand::Discover).is_err() {
            warn!("Connectable discovery machine has stopped");
        }
    }

    /// Request a connection on the shared connection machine
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Request a disconnection on the shared connection machine
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// The shared connection machine
    pub fn connection(&self) -> &ConnectionStateMachine {
        &self.connection
    }

    /// The inner discovery machine
    pub fn discovery(&self) -> &DiscoveryStateMachine<V, E> {
        &self.discovery
    }
}

struct ConnectableActor<V, E> {
    label: String,
    connection: ConnectionStateMachine,
    discovery: DiscoveryStateMachine<V, E>,
    current: ConnectableDiscoveryState<V, E>,
    state: StatePublisher<ConnectableDiscoveryState<V, E>>,
    commands: mpsc::UnboundedReceiver<ConnectableCommand>,
    connection_updates: StateStream<ConnectionState>,
    discovery_updates: StateStream<DiscoveryState<V, E>>,
}

impl<V, E> ConnectableActor<V, E>
where
    V: Clone + Debug + PartialEq + Send + Sync + 'static,
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ConnectableCommand::Discover) => self.request_discovery(),
                    None => break,
                },
                Some(connection) = self.connection_updates.next() => {
                    self.current.connection = connection;
                }
                Some(discovery) = self.discovery_updates.next() => {
                    self.current.discovery = discovery;
                }
            }

            self.fire_deferred_discovery();
            self.state.publish_if_changed(self.current.clone());
        }

        debug!("Connectable discovery machine for {} stopped", self.label);
    }

    fn request_discovery(&mut self) {
        if self.current.connection.is_connected() {
            self.discovery.discover();
        } else {
            debug!(
                "Discovery for {} deferred until connected ({})",
                self.label, self.current.connection
            );
            self.current.discovery_requested = true;
            self.connection.connect();
        }
    }

    fn fire_deferred_discovery(&mut self) {
        if self.current.needs_deferred_discovery() {
            debug!("Connected, running deferred discovery for {}", self.label);
            self.current.discovery_requested = false;
            self.discovery.discover();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::connection::testing::RecordingConnector;
    use crate::connection::ConnectionEventKind;
    use crate::error::ConnectionFailure;

    const WAIT: Duration = Duration::from_secs(5);

    type State = ConnectableDiscoveryState<u8, String>;

    #[derive(Default)]
    struct CountingStrategy {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryStrategy<u8, String> for CountingStrategy {
        async fn discover(&self) -> Result<Vec<u8>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2])
        }
    }

    struct Fixture {
        machine: ConnectableDiscoveryStateMachine<u8, String>,
        connector: Arc<RecordingConnector>,
        strategy: Arc<CountingStrategy>,
        id: Uuid,
    }

    fn fixture() -> Fixture {
        let connector = RecordingConnector::new();
        let id = Uuid::new_v4();
        let connection =
            ConnectionStateMachine::new(id, true, connector.clone(), EngineConfig::default());
        let strategy = Arc::new(CountingStrategy::default());
        let machine = ConnectableDiscoveryStateMachine::new(
            "device",
            connection,
            strategy.clone(),
            EngineConfig::default(),
        );
        Fixture {
            machine,
            connector,
            strategy,
            id,
        }
    }

    async fn connect(fixture: &Fixture, stream: &mut StateStream<State>) {
        stream
            .wait_for_timeout(WAIT, |s| s.connection == ConnectionState::Connecting)
            .await
            .unwrap();
        fixture.connector.emit(fixture.id, ConnectionEventKind::Connected);
    }

    #[test_log::test(tokio::test)]
    async fn test_discover_while_disconnected_connects_then_discovers() {
        let fixture = fixture();
        let mut stream = fixture.machine.subscribe();

        fixture.machine.discover();
        let requested = stream
            .wait_for_timeout(WAIT, |s| s.discovery_requested)
            .await
            .unwrap();
        assert_eq!(requested.discovery, DiscoveryState::NotDiscoveredYet);

        connect(&fixture, &mut stream).await;

        let done = stream
            .wait_for_timeout(WAIT, |s| matches!(s.discovery, DiscoveryState::Discovered(_)))
            .await
            .unwrap();
        assert!(!done.discovery_requested);
        assert_eq!(done.connection, ConnectionState::Connected);
        assert_eq!(done.discovery, DiscoveryState::Discovered(vec![1, 2]));
        assert_eq!(fixture.strategy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.connector.count("connect"), 1);
    }

    #[tokio::test]
    async fn test_deferred_discovery_fires_once() {
        let fixture = fixture();
        let mut stream = fixture.machine.subscribe();

        fixture.machine.discover();
        fixture.machine.discover();
        connect(&fixture, &mut stream).await;

        stream
            .wait_for_timeout(WAIT, |s| matches!(s.discovery, DiscoveryState::Discovered(_)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fixture.strategy.calls.load(Ordering::SeqCst), 1);
        assert!(!fixture.machine.state().discovery_requested);
    }

    #[tokio::test]
    async fn test_discover_while_connected_delegates() {
        let fixture = fixture();
        let mut stream = fixture.machine.subscribe();

        fixture.machine.connect();
        connect(&fixture, &mut stream).await;
        stream
            .wait_for_timeout(WAIT, |s| s.connection.is_connected())
            .await
            .unwrap();

        fixture.machine.discover();
        let done = stream
            .wait_for_timeout(WAIT, |s| matches!(s.discovery, DiscoveryState::Discovered(_)))
            .await
            .unwrap();
        assert!(!done.discovery_requested);
        assert_eq!(fixture.connector.count("connect"), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_keeps_request_for_retry() {
        let fixture = fixture();
        let mut stream = fixture.machine.subscribe();

        fixture.machine.discover();
        stream
            .wait_for_timeout(WAIT, |s| s.connection == ConnectionState::Connecting)
            .await
            .unwrap();
        fixture
            .connector
            .emit(fixture.id, ConnectionEventKind::FailedToConnect(ConnectionFailure::new("TEST")));

        let failed = stream
            .wait_for_timeout(WAIT, |s| s.connection.failure().is_some())
            .await
            .unwrap();
        assert!(failed.discovery_requested);
        assert_eq!(fixture.strategy.calls.load(Ordering::SeqCst), 0);

        // User retry
        fixture.machine.connect();
        connect(&fixture, &mut stream).await;
        let done = stream
            .wait_for_timeout(WAIT, |s| matches!(s.discovery, DiscoveryState::Discovered(_)))
            .await
            .unwrap();
        assert!(!done.discovery_requested);
        assert_eq!(fixture.strategy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_connection_between_machines() {
        let connector = RecordingConnector::new();
        let id = Uuid::new_v4();
        let connection =
            ConnectionStateMachine::new(id, true, connector.clone(), EngineConfig::default());
        let first = ConnectableDiscoveryStateMachine::new(
            "first",
            connection.clone(),
            Arc::new(CountingStrategy::default()),
            EngineConfig::default(),
        );
        let second = ConnectableDiscoveryStateMachine::new(
            "second",
            connection.clone(),
            Arc::new(CountingStrategy::default()),
            EngineConfig::default(),
        );

        let mut second_stream = second.subscribe();
        first.connect();
        let mut connection_stream = connection.subscribe();
        connection_stream
            .wait_for_timeout(WAIT, |s| *s == ConnectionState::Connecting)
            .await
            .unwrap();
        connector.emit(id, ConnectionEventKind::Connected);

        let state = second_stream
            .wait_for_timeout(WAIT, |s| s.connection.is_connected())
            .await
            .unwrap();
        assert_eq!(state.discovery, DiscoveryState::NotDiscoveredYet);
        assert_eq!(connector.count("connect"), 1);
    }
}

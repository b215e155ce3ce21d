/*!
 * Device connection lifecycle.
 *
 * A [`ConnectionStateMachine`] is a single-writer actor that folds
 * `connect()` / `disconnect()` requests and transport callbacks into a
 * [`ConnectionState`]. The handle is cheap to clone and is shared by every
 * entity below a device; none of them connect on their own.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_core::utils::spawn_actor;

use crate::error::ConnectionFailure;

/// Connection state of a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The peripheral does not accept connections
    NotConnectable,
    /// Idle, ready to connect
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// The link is up
    Connected,
    /// A disconnection is in flight
    Disconnecting,
    /// The last connection attempt failed
    ConnectionFailed(ConnectionFailure),
}

impl ConnectionState {
    /// Initial state for a peripheral
    pub fn initial(is_connectable: bool) -> Self {
        if is_connectable {
            ConnectionState::Disconnected
        } else {
            ConnectionState::NotConnectable
        }
    }

    /// Whether `connect()` is accepted in this state
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::ConnectionFailed(_)
        )
    }

    /// Whether `disconnect()` is accepted in this state
    pub fn can_disconnect(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// The failure, if the last attempt failed
    pub fn failure(&self) -> Option<&ConnectionFailure> {
        match self {
            ConnectionState::ConnectionFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotConnectable => write!(f, "not connectable"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::ConnectionFailed(failure) => {
                write!(f, "connection failed ({})", failure.description())
            }
        }
    }
}

/// Outcome reported by the transport for a peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// The link came up
    Connected,
    /// The connection attempt failed
    FailedToConnect(ConnectionFailure),
    /// The link went down, possibly with an error
    Disconnected(Option<ConnectionFailure>),
}

/// A connection callback correlated by peripheral identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The peripheral the event refers to
    pub peripheral: Uuid,
    /// What happened
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    /// Create a new connection event
    pub fn new(peripheral: Uuid, kind: ConnectionEventKind) -> Self {
        Self { peripheral, kind }
    }
}

/// The transport side of a connection
///
/// Both requests are fire-and-forget; their outcome arrives later on
/// [`Connector::connection_events`].
pub trait Connector: Send + Sync + Debug {
    /// Start connecting to a peripheral
    fn connect(&self, peripheral: Uuid);

    /// Cancel or tear down the connection to a peripheral
    fn cancel_connection(&self, peripheral: Uuid);

    /// Stream of connection callbacks for all peripherals
    fn connection_events(&self) -> BoxStream<'static, ConnectionEvent>;
}

#[derive(Debug)]
enum ConnectionCommand {
    Connect,
    Disconnect,
    MarkConnectable,
}

/// Handle to a device's connection actor
#[derive(Clone)]
pub struct ConnectionStateMachine {
    id: Uuid,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    state: StatePublisher<ConnectionState>,
}

impl Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("id", &self.id)
            .field("state", &self.state.current())
            .finish()
    }
}

impl ConnectionStateMachine {
    /// Create a connection machine and spawn its actor
    ///
    /// Must be called from within a Tokio runtime. The transport's event
    /// stream is subscribed before this returns, so no callback issued
    /// after a later `connect()` can be missed.
    pub fn new(
        id: Uuid,
        is_connectable: bool,
        connector: Arc<dyn Connector>,
        config: EngineConfig,
    ) -> Self {
        let initial = ConnectionState::initial(is_connectable);
        debug!("Connection machine for {} starts {}", id, initial);

        let state = StatePublisher::with_capacity(initial, config.state_channel_capacity);
        let (commands, receiver) = mpsc::unbounded_channel();
        let events = connector.connection_events();

        let actor = ConnectionActor {
            id,
            connector,
            state: state.clone(),
            commands: receiver,
            events,
        };
        spawn_actor("connection", Some(&id.to_string()), actor.run());

        Self {
            id,
            commands,
            state,
        }
    }

    /// The peripheral identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Subscribe to connection state changes, starting with the current state
    pub fn subscribe(&self) -> StateStream<ConnectionState> {
        self.state.subscribe()
    }

    /// Request a connection
    ///
    /// No-op unless the machine is `Disconnected` or `ConnectionFailed`.
    pub fn connect(&self) {
        self.send(ConnectionCommand::Connect);
    }

    /// Request a disconnection
    ///
    /// No-op unless the machine is `Connected`.
    pub fn disconnect(&self) {
        self.send(ConnectionCommand::Disconnect);
    }

    /// Record that the peripheral now accepts connections
    ///
    /// Moves `NotConnectable` to `Disconnected`; no-op in every other state.
    pub fn mark_connectable(&self) {
        self.send(ConnectionCommand::MarkConnectable);
    }

    fn send(&self, command: ConnectionCommand) {
        if self.commands.send(command).is_err() {
            warn!("Connection machine for {} has stopped", self.id);
        }
    }
}

struct ConnectionActor {
    id: Uuid,
    connector: Arc<dyn Connector>,
    state: StatePublisher<ConnectionState>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: BoxStream<'static, ConnectionEvent>,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut events_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.events.next(), if events_open => match event {
                    Some(event) if event.peripheral == self.id => self.handle_event(event.kind),
                    Some(_) => {}
                    None => {
                        warn!("Transport connection events ended for {}", self.id);
                        events_open = false;
                    }
                },
            }
        }

        debug!("Connection machine for {} stopped", self.id);
    }

    fn transition(&self, next: ConnectionState) {
        debug!("Connection {}: {} -> {}", self.id, self.state.current(), next);
        self.state.publish(next);
    }

    fn handle_command(&mut self, command: ConnectionCommand) {
        let current = self.state.current();
        match (command, &current) {
            (ConnectionCommand::Connect, state) if state.can_connect() => {
                self.transition(ConnectionState::Connecting);
                self.connector.connect(self.id);
            }
            (ConnectionCommand::Disconnect, ConnectionState::Connected) => {
                self.transition(ConnectionState::Disconnecting);
                self.connector.cancel_connection(self.id);
            }
            (ConnectionCommand::MarkConnectable, ConnectionState::NotConnectable) => {
                info!("{} became connectable", self.id);
                self.transition(ConnectionState::Disconnected);
            }
            (command, state) => {
                debug!("Ignoring {:?} for {} while {}", command, self.id, state);
            }
        }
    }

    fn handle_event(&mut self, kind: ConnectionEventKind) {
        let current = self.state.current();
        match (&current, kind) {
            (ConnectionState::Connecting, ConnectionEventKind::Connected) => {
                info!("Connected to {}", self.id);
                self.transition(ConnectionState::Connected);
            }
            (ConnectionState::Connecting, ConnectionEventKind::FailedToConnect(failure)) => {
                warn!("Failed to connect to {}: {}", self.id, failure);
                self.transition(ConnectionState::ConnectionFailed(failure));
            }
            (ConnectionState::Disconnecting, ConnectionEventKind::Disconnected(failure)) => {
                if let Some(failure) = failure {
                    warn!("Disconnected from {} with error: {}", self.id, failure);
                } else {
                    info!("Disconnected from {}", self.id);
                }
                self.transition(ConnectionState::Disconnected);
            }
            (state, kind) => {
                debug!("Ignoring transport event {:?} for {} while {}", kind, self.id, state);
            }
        }
    }
}

/*!
 * Central: scanning and the top-level device list.
 *
 * While scanning, the central actor folds advertisements into a registry
 * of [`DeviceModel`]s. A peripheral seen for the first time gets a new model;
 * a peripheral seen again only has its advertisement updated, so its
 * connection machine and discovered services survive.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use blueflow_core::config::{Config, EngineConfig};
use blueflow_core::state::{StatePublisher, StateStream};
use blueflow_core::utils::spawn_actor;
use blueflow_engine::registry::{EntityRegistry, RegistryEntry};

use crate::advertisement::{manufacturer_name, Advertisement, CompanyCatalog};
use crate::device::DeviceModel;
use crate::search::SearchFilter;
use crate::transport::{ScanFilter, Transport, TransportEvent};

/// Scanning state of the central
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralState {
    /// Whether a scan is running
    pub is_scanning: bool,
    /// Filter of the running or last scan
    pub filter: Option<ScanFilter>,
}

#[derive(Debug)]
enum CentralCommand {
    StartScan(Option<ScanFilter>),
    StopScan,
}

/// Scanner and owner of the top-level device registry
pub struct Central {
    commands: mpsc::UnboundedSender<CentralCommand>,
    state: StatePublisher<CentralState>,
    devices: EntityRegistry<DeviceModel>,
}

impl Debug for Central {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Central")
            .field("state", &self.state.current())
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Central {
    /// Create a central over `transport`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self::build(transport, config, None)
    }

    /// Create a central that resolves manufacturer names through `catalog`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_catalog(
        transport: Arc<dyn Transport>,
        config: &Config,
        catalog: Arc<dyn CompanyCatalog>,
    ) -> Self {
        Self::build(transport, config, Some(catalog))
    }

    fn build(
        transport: Arc<dyn Transport>,
        config: &Config,
        catalog: Option<Arc<dyn CompanyCatalog>>,
    ) -> Self {
        let engine = config.engine;
        let state =
            StatePublisher::with_capacity(CentralState::default(), engine.state_channel_capacity);
        let devices = EntityRegistry::new(engine);
        let (commands, receiver) = mpsc::unbounded_channel();

        let actor = CentralActor {
            events: transport.events(),
            transport,
            catalog,
            engine,
            default_filter: ScanFilter::from(&config.scan),
            state: state.clone(),
            devices: devices.clone(),
            commands: receiver,
        };
        spawn_actor("central", None, actor.run());

        Self {
            commands,
            state,
            devices,
        }
    }

    fn send(&self, command: CentralCommand) {
        if self.commands.send(command).is_err() {
            warn!("Central has stopped");
        }
    }

    /// Start scanning; `None` uses the configured default filter
    pub fn start_scan(&self, filter: Option<ScanFilter>) {
        self.send(CentralCommand::StartScan(filter));
    }

    /// Stop scanning
    pub fn stop_scan(&self) {
        self.send(CentralCommand::StopScan);
    }

    /// Current scanning state
    pub fn state(&self) -> CentralState {
        self.state.current()
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.state.current().is_scanning
    }

    /// Subscribe to scanning state changes
    pub fn subscribe(&self) -> StateStream<CentralState> {
        self.state.subscribe()
    }

    /// Registry of every device seen so far
    pub fn devices(&self) -> &EntityRegistry<DeviceModel> {
        &self.devices
    }

    /// Look up a device by its session identifier
    pub fn device(&self, id: &Uuid) -> Option<DeviceModel> {
        self.devices.get(id)
    }

    /// Live device list narrowed by `filter`
    pub fn filtered_devices(
        &self,
        filter: SearchFilter,
    ) -> BoxStream<'static, Vec<RegistryEntry<DeviceModel>>> {
        filter.filtered_view(self.devices.subscribe())
    }
}

struct CentralActor {
    transport: Arc<dyn Transport>,
    catalog: Option<Arc<dyn CompanyCatalog>>,
    engine: EngineConfig,
    default_filter: ScanFilter,
    state: StatePublisher<CentralState>,
    devices: EntityRegistry<DeviceModel>,
    commands: mpsc::UnboundedReceiver<CentralCommand>,
    events: BoxStream<'static, TransportEvent>,
}

impl CentralActor {
    async fn run(mut self) {
        let mut events_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.events.next(), if events_open => match event {
                    Some(TransportEvent::DeviceDiscovered(advertisement)) => {
                        self.handle_advertisement(advertisement);
                    }
                    Some(_) => {}
                    None => {
                        warn!("Transport events ended for central");
                        events_open = false;
                    }
                },
            }
        }

        debug!("Central stopped");
    }

    fn handle_command(&mut self, command: CentralCommand) {
        match command {
            CentralCommand::StartScan(filter) => {
                let filter = filter.unwrap_or_else(|| self.default_filter.clone());
                info!("Starting scan");
                self.transport.scan(Some(filter.clone()));
                self.state.publish_if_changed(CentralState {
                    is_scanning: true,
                    filter: Some(filter),
                });
            }
            CentralCommand::StopScan => {
                let current = self.state.current();
                if !current.is_scanning {
                    debug!("Ignoring stop_scan while not scanning");
                    return;
                }
                info!("Stopping scan");
                self.transport.stop_scan();
                self.state.publish(CentralState {
                    is_scanning: false,
                    ..current
                });
            }
        }
    }

    fn handle_advertisement(&mut self, advertisement: Advertisement) {
        let state = self.state.current();
        if !state.is_scanning {
            trace!("Advertisement from {} after scan stopped", advertisement.peripheral);
            return;
        }
        if let Some(filter) = &state.filter {
            if !filter.accepts(&advertisement) {
                trace!("Advertisement from {} filtered out", advertisement.peripheral);
                return;
            }
        }

        let name = manufacturer_name(&advertisement, self.catalog.as_deref());
        match self.devices.get(&advertisement.peripheral) {
            Some(device) => device.update_advertisement(advertisement, name),
            None => {
                debug!("Discovered device {}", advertisement.peripheral);
                let device =
                    DeviceModel::new(advertisement, name, self.transport.clone(), self.engine);
                self.devices.append(device);
            }
        }
    }
}

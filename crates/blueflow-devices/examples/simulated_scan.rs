use std::time::Duration;

use blueflow_core::config::Config;
use blueflow_devices::transport::{CharacteristicInfo, DescriptorInfo, ServiceInfo};
use blueflow_devices::{
    Advertisement, AttributePath, AttributePermissions, Central, CharacteristicProperties,
    SimulatedTransport, WriteMode,
};
use blueflow_engine::discovery::DiscoveryState;
use blueflow_engine::registry::Entity;
use uuid::Uuid;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const WAIT: Duration = Duration::from_secs(5);

const HEART_RATE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
const MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
const CONTROL_POINT: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);
const CLIENT_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Simulated heart rate monitor
    let transport = SimulatedTransport::responsive();
    let monitor = Uuid::new_v4();
    let measurement = AttributePath::characteristic(monitor, HEART_RATE, MEASUREMENT);
    transport.set_services(
        monitor,
        Ok(vec![ServiceInfo {
            uuid: HEART_RATE,
            is_primary: true,
        }]),
    );
    transport.set_characteristics(
        monitor,
        HEART_RATE,
        Ok(vec![
            CharacteristicInfo {
                uuid: MEASUREMENT,
                properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            },
            CharacteristicInfo {
                uuid: CONTROL_POINT,
                properties: CharacteristicProperties::WRITE,
            },
        ]),
    );
    transport.set_descriptors(
        measurement,
        Ok(vec![DescriptorInfo {
            uuid: CLIENT_CONFIG,
            permissions: AttributePermissions::READ_WRITE,
        }]),
    );
    transport.set_value(measurement, vec![0x06, 72]);

    // Scan until the monitor shows up
    let central = Central::new(transport.clone(), &Config::default());
    central.start_scan(None);
    central
        .subscribe()
        .wait_for_timeout(WAIT, |state| state.is_scanning)
        .await?;

    transport.advertise(Advertisement::new(Uuid::new_v4(), -90).connectable(false));
    transport.advertise(Advertisement::new(monitor, -48).with_name("HRM Pro"));

    let devices = central
        .devices()
        .subscribe()
        .wait_for_timeout(WAIT, |entries| entries.len() == 2)
        .await?;
    for entry in &devices {
        info!(
            "Found {} ({}) rssi {} {}",
            entry.state.name.as_deref().unwrap_or("unnamed"),
            entry.id,
            entry.state.rssi,
            entry.state.connection()
        );
    }
    central.stop_scan();

    // Discovering services connects first
    let device = central
        .device(&monitor)
        .ok_or("monitor disappeared from the device list")?;
    device.discover_services();
    let services = device
        .services()
        .subscribe()
        .wait_for_timeout(WAIT, |entries| !entries.is_empty())
        .await?;
    info!("Connection: {}", device.state().connection());

    for service in services {
        info!("Service {}", service.id);
        let service = service.machine;
        service.discover_characteristics();

        let characteristics = service
            .characteristics()
            .subscribe()
            .wait_for_timeout(WAIT, |entries| entries.len() == 2)
            .await?;
        for entry in characteristics {
            let characteristic = entry.machine;
            info!(
                "  Characteristic {} [{}]",
                characteristic.uuid(),
                characteristic.properties()
            );

            if characteristic.properties().can_read() {
                characteristic.read();
                let value = characteristic
                    .value()
                    .subscribe()
                    .wait_for_timeout(WAIT, |state| state.value.is_some())
                    .await?;
                info!("    Value {:02x?}", value.value.as_deref().unwrap_or_default());
            }

            // Writing without the write-without-response property is refused locally
            characteristic.write(vec![0x01], WriteMode::WithoutResponse);
            let refused = characteristic
                .value()
                .subscribe()
                .wait_for_timeout(WAIT, |state| state.error.is_some())
                .await?;
            if let Some(error) = refused.error {
                info!("    Write without response: {}", error);
            }

            characteristic.discover_descriptors();
            let descriptors = characteristic
                .subscribe()
                .wait_for_timeout(WAIT, |state| {
                    matches!(state.descriptors.discovery, DiscoveryState::Discovered(_))
                })
                .await?;
            for descriptor in descriptors.descriptors.discovery.values().unwrap_or_default() {
                info!("    Descriptor {}", descriptor.uuid());
            }
        }
    }

    device.disconnect();
    let state = device
        .subscribe()
        .wait_for_timeout(WAIT, |state| !state.connection().is_connected())
        .await?;
    info!("Connection: {}", state.connection());
    info!("{} transport calls", transport.calls().len());

    Ok(())
}

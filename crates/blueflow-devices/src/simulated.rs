/*!
 * In-memory transport.
 *
 * [`SimulatedTransport`] records every call, serves enumeration results
 * from tables the caller fills in and lets the caller inject events. A
 * responsive transport also answers connect, disconnect, read, write and
 * notify requests on its own, which makes it usable as a demo backend.
 * The call log keeps the most recent [`CALL_LOG_CAPACITY`] calls.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

use blueflow_core::error::Result;
use blueflow_core::utils::{broadcast_stream, with_timeout};

use crate::advertisement::Advertisement;
use crate::error::DiscoveryFailure;
use crate::transport::{
    AttributePath, CharacteristicInfo, DescriptorInfo, ScanFilter, ServiceInfo, Transport,
    TransportEvent, WriteMode,
};

const EVENT_CAPACITY: usize = 256;

/// Number of calls kept in the call log
pub const CALL_LOG_CAPACITY: usize = 4096;

/// A call received by the simulated transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `scan`
    Scan(Option<ScanFilter>),
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(Uuid),
    /// `disconnect`
    Disconnect(Uuid),
    /// `enumerate_services`
    EnumerateServices(Uuid),
    /// `enumerate_characteristics`
    EnumerateCharacteristics(Uuid, Uuid),
    /// `enumerate_descriptors`
    EnumerateDescriptors(AttributePath),
    /// `read_value`
    ReadValue(AttributePath),
    /// `write_value`
    WriteValue(AttributePath, Bytes, WriteMode),
    /// `set_notify`
    SetNotify(AttributePath, bool),
}

type Listing<T> = std::result::Result<Vec<T>, DiscoveryFailure>;

#[derive(Debug, Default)]
struct Gatt {
    services: HashMap<Uuid, Listing<ServiceInfo>>,
    characteristics: HashMap<(Uuid, Uuid), Listing<CharacteristicInfo>>,
    descriptors: HashMap<AttributePath, Listing<DescriptorInfo>>,
    values: HashMap<AttributePath, Bytes>,
}

/// Transport backed by in-memory tables
#[derive(Debug)]
pub struct SimulatedTransport {
    calls: Mutex<VecDeque<TransportCall>>,
    recorded: Notify,
    events: broadcast::Sender<TransportEvent>,
    gatt: Mutex<Gatt>,
    responsive: bool,
}

impl SimulatedTransport {
    /// A passive transport: the caller emits every completion
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// A transport that completes requests on its own
    pub fn responsive() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(responsive: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            calls: Mutex::new(VecDeque::new()),
            recorded: Notify::new(),
            events,
            gatt: Mutex::new(Gatt::default()),
            responsive,
        }
    }

    fn gatt(&self) -> MutexGuard<'_, Gatt> {
        self.gatt.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn call_log(&self) -> MutexGuard<'_, VecDeque<TransportCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: TransportCall) {
        trace!(?call, "simulated transport call");
        {
            let mut calls = self.call_log();
            if calls.len() == CALL_LOG_CAPACITY {
                calls.pop_front();
            }
            calls.push_back(call);
        }
        self.recorded.notify_waiters();
    }

    /// Inject a transport event
    pub fn emit(&self, event: TransportEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Inject an advertisement
    pub fn advertise(&self, advertisement: Advertisement) {
        self.emit(TransportEvent::DeviceDiscovered(advertisement));
    }

    /// Set the enumeration result for a device's services
    pub fn set_services(&self, device: Uuid, services: Listing<ServiceInfo>) {
        self.gatt().services.insert(device, services);
    }

    /// Set the enumeration result for a service's characteristics
    pub fn set_characteristics(
        &self,
        device: Uuid,
        service: Uuid,
        characteristics: Listing<CharacteristicInfo>,
    ) {
        self.gatt()
            .characteristics
            .insert((device, service), characteristics);
    }

    /// Set the enumeration result for a characteristic's descriptors
    pub fn set_descriptors(
        &self,
        characteristic: AttributePath,
        descriptors: Listing<DescriptorInfo>,
    ) {
        self.gatt().descriptors.insert(characteristic, descriptors);
    }

    /// Set the value a responsive transport answers reads with
    pub fn set_value(&self, path: AttributePath, value: impl Into<Bytes>) {
        self.gatt().values.insert(path, value.into());
    }

    /// Stored value of an attribute
    pub fn value(&self, path: &AttributePath) -> Option<Bytes> {
        self.gatt().values.get(path).cloned()
    }

    /// Calls in the log, oldest first
    pub fn calls(&self) -> Vec<TransportCall> {
        self.call_log().iter().cloned().collect()
    }

    /// Number of logged calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.call_log().iter().filter(|call| predicate(call)).count()
    }

    /// Wait until a call matching `predicate` has been received
    pub async fn wait_for_call<F>(&self, timeout: Duration, predicate: F) -> Result<TransportCall>
    where
        F: Fn(&TransportCall) -> bool,
    {
        with_timeout(timeout, async {
            loop {
                let recorded = self.recorded.notified();
                let found = self.call_log().iter().find(|call| predicate(call)).cloned();
                if let Some(call) = found {
                    return Ok(call);
                }
                recorded.await;
            }
        })
        .await
    }

    fn listing<K, T>(table: &HashMap<K, Listing<T>>, key: &K) -> Listing<T>
    where
        K: std::hash::Hash + Eq,
        T: Clone,
    {
        table.get(key).cloned().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn scan(&self, filter: Option<ScanFilter>) {
        self.record(TransportCall::Scan(filter));
    }

    fn stop_scan(&self) {
        self.record(TransportCall::StopScan);
    }

    fn connect(&self, device: Uuid) {
        self.record(TransportCall::Connect(device));
        if self.responsive {
            self.emit(TransportEvent::Connected(device));
        }
    }

    fn disconnect(&self, device: Uuid) {
        self.record(TransportCall::Disconnect(device));
        if self.responsive {
            self.emit(TransportEvent::Disconnected(device, None));
        }
    }

    async fn enumerate_services(
        &self,
        device: Uuid,
    ) -> std::result::Result<Vec<ServiceInfo>, DiscoveryFailure> {
        self.record(TransportCall::EnumerateServices(device));
        Self::listing(&self.gatt().services, &device)
    }

    async fn enumerate_characteristics(
        &self,
        device: Uuid,
        service: Uuid,
    ) -> std::result::Result<Vec<CharacteristicInfo>, DiscoveryFailure> {
        self.record(TransportCall::EnumerateCharacteristics(device, service));
        Self::listing(&self.gatt().characteristics, &(device, service))
    }

    async fn enumerate_descriptors(
        &self,
        characteristic: AttributePath,
    ) -> std::result::Result<Vec<DescriptorInfo>, DiscoveryFailure> {
        self.record(TransportCall::EnumerateDescriptors(characteristic));
        Self::listing(&self.gatt().descriptors, &characteristic)
    }

    fn read_value(&self, path: AttributePath) {
        self.record(TransportCall::ReadValue(path));
        if !self.responsive {
            return;
        }

        let result = Ok(self.value(&path).unwrap_or_default());
        debug!("Answering read of {}", path);
        if path.is_descriptor() {
            self.emit(TransportEvent::DescriptorValueUpdated { path, result });
        } else {
            self.emit(TransportEvent::ValueUpdated { path, result });
        }
    }

    fn write_value(&self, path: AttributePath, data: Bytes, mode: WriteMode) {
        self.record(TransportCall::WriteValue(path, data.clone(), mode));
        if !self.responsive {
            return;
        }

        self.gatt().values.insert(path, data);
        if path.is_descriptor() {
            self.emit(TransportEvent::DescriptorWriteCompleted { path, result: Ok(()) });
        } else if mode == WriteMode::WithResponse {
            self.emit(TransportEvent::WriteCompleted { path, result: Ok(()) });
        }
    }

    fn set_notify(&self, path: AttributePath, enabled: bool) {
        self.record(TransportCall::SetNotify(path, enabled));
        if self.responsive {
            self.emit(TransportEvent::NotificationStateUpdated {
                path,
                result: Ok(enabled),
            });
        }
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        broadcast_stream(self.events.subscribe())
    }
}

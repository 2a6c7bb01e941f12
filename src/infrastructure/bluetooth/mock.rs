//! Scripted [`BleTransport`] for tests.

use crate::domain::commands::CommandTable;
use crate::domain::models::AdapterState;
use crate::domain::settings::{DeviceRecord, DeviceRecordStore};
use crate::infrastructure::bluetooth::protocol::{
    WireFrame, NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID, SERIAL_CHAR_UUID,
    SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharProps, CharacteristicRef, DiscoveredPeripheral, GattCharacteristic,
    GattService, PeripheralInfo, TransportError, WriteKind,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// HM-10 style serial service: one characteristic for both directions.
pub fn serial_services() -> Vec<GattService> {
    vec![GattService {
        uuid: SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: SERIAL_CHAR_UUID,
            properties: CharProps {
                read: true,
                write: true,
                write_without_response: true,
                notify: true,
                indicate: false,
            },
        }],
    }]
}

/// Nordic UART layout only.
pub fn nus_services() -> Vec<GattService> {
    vec![
        GattService {
            uuid: uuid::Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb),
            characteristics: Vec::new(),
        },
        GattService {
            uuid: NUS_SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: NUS_RX_CHAR_UUID,
                    properties: CharProps {
                        write: true,
                        write_without_response: true,
                        ..CharProps::default()
                    },
                },
                GattCharacteristic {
                    uuid: NUS_TX_CHAR_UUID,
                    properties: CharProps {
                        notify: true,
                        ..CharProps::default()
                    },
                },
            ],
        },
    ]
}

pub fn advertisement(id: &str, name: Option<&str>) -> DiscoveredPeripheral {
    DiscoveredPeripheral {
        id: id.to_string(),
        name: name.map(str::to_string),
        rssi: Some(-60),
    }
}

struct MockState {
    adapter_states: VecDeque<AdapterState>,
    advertisements: Vec<DiscoveredPeripheral>,
    services: Vec<GattService>,
    mtu: Result<u16, TransportError>,
    connected: Option<String>,
    connect_failure: Option<TransportError>,
    connect_delay: Option<Duration>,
    yield_on_cancel: bool,
    writes: Vec<(Vec<u8>, WriteKind)>,
    write_failures: VecDeque<TransportError>,
    ack_disconnect: bool,
    scan_sender: Option<mpsc::UnboundedSender<DiscoveredPeripheral>>,
    notify_sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    disconnect_sender: Option<oneshot::Sender<()>>,
    scan_stops: usize,
    unsubscribes: usize,
    cancels: usize,
}

pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                adapter_states: VecDeque::from([AdapterState::PoweredOn]),
                advertisements: Vec::new(),
                services: serial_services(),
                mtu: Ok(185),
                connected: None,
                connect_failure: None,
                connect_delay: None,
                yield_on_cancel: false,
                writes: Vec::new(),
                write_failures: VecDeque::new(),
                ack_disconnect: false,
                scan_sender: None,
                notify_sender: None,
                disconnect_sender: None,
                scan_stops: 0,
                unsubscribes: 0,
                cancels: 0,
            }),
        }
    }

    /// States returned by successive polls; the last one repeats.
    pub fn with_adapter_states(self, states: Vec<AdapterState>) -> Self {
        self.lock().adapter_states = states.into();
        self
    }

    pub fn with_services(self, services: Vec<GattService>) -> Self {
        self.lock().services = services;
        self
    }

    pub fn with_advertisements(self, advertisements: Vec<DiscoveredPeripheral>) -> Self {
        self.lock().advertisements = advertisements;
        self
    }

    pub fn with_mtu(self, mtu: Result<u16, TransportError>) -> Self {
        self.lock().mtu = mtu;
        self
    }

    pub fn with_connect_failure(self, error: TransportError) -> Self {
        self.lock().connect_failure = Some(error);
        self
    }

    /// Stall every connect attempt for `delay` before it answers.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    /// Let other tasks run right after a cancelled link fires its
    /// disconnect callback, so the watcher reports it before teardown.
    pub fn yielding_cancel(self) -> Self {
        self.lock().yield_on_cancel = true;
        self
    }

    /// Answer every DISCONNECT frame with a DISCONNECT_ACK notification.
    pub fn acking_disconnect(self) -> Self {
        self.lock().ack_disconnect = true;
        self
    }

    pub fn fail_next_writes(&self, errors: Vec<TransportError>) {
        self.lock().write_failures.extend(errors);
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.lock().adapter_states = VecDeque::from([state]);
    }

    /// Deliver a notification on the subscribed characteristic.
    pub fn notify(&self, text: &str) -> bool {
        self.lock()
            .notify_sender
            .as_ref()
            .map(|tx| tx.send(text.as_bytes().to_vec()).is_ok())
            .unwrap_or(false)
    }

    /// Drop the link as if the chair walked out of range.
    pub fn trigger_disconnect(&self) {
        let mut state = self.lock();
        state.connected = None;
        state.notify_sender = None;
        if let Some(tx) = state.disconnect_sender.take() {
            let _ = tx.send(());
        }
    }

    /// Advertise one more device on the running scan.
    pub fn advertise(&self, peripheral: DiscoveredPeripheral) -> bool {
        self.lock()
            .scan_sender
            .as_ref()
            .map(|tx| tx.send(peripheral).is_ok())
            .unwrap_or(false)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.iter().map(|(data, _)| data.clone()).collect()
    }

    pub fn write_kinds(&self) -> Vec<WriteKind> {
        self.lock().writes.iter().map(|(_, kind)| *kind).collect()
    }

    /// Successful writes resolved back to command names.
    pub fn sent_commands(&self) -> Vec<&'static str> {
        self.writes()
            .iter()
            .map(|frame| match WireFrame::decode(frame) {
                Ok(packet) => CommandTable::identify(&packet),
                Err(_) => "<garbage>",
            })
            .collect()
    }

    pub fn connected_id(&self) -> Option<String> {
        self.lock().connected.clone()
    }

    pub fn scan_stops(&self) -> usize {
        self.lock().scan_stops
    }

    pub fn unsubscribes(&self) -> usize {
        self.lock().unsubscribes
    }

    pub fn cancels(&self) -> usize {
        self.lock().cancels
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn require_connected(state: &MockState, id: &str) -> Result<(), TransportError> {
        match &state.connected {
            Some(connected) if connected == id => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn adapter_state(&self) -> Result<AdapterState, TransportError> {
        let mut state = self.lock();
        let current = if state.adapter_states.len() > 1 {
            state.adapter_states.pop_front()
        } else {
            state.adapter_states.front().copied()
        };
        Ok(current.unwrap_or(AdapterState::Unknown))
    }

    async fn start_scan(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredPeripheral>, TransportError> {
        let mut state = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        for advertisement in &state.advertisements {
            let _ = tx.send(advertisement.clone());
        }
        state.scan_sender = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.scan_sender = None;
        state.scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, TransportError> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.connect_failure.clone() {
            return Err(error);
        }
        state.connected = Some(id.to_string());
        let name = state
            .advertisements
            .iter()
            .find(|a| a.id == id)
            .and_then(|a| a.name.clone());
        Ok(PeripheralInfo {
            id: id.to_string(),
            name,
        })
    }

    async fn discover_services(&self, id: &str) -> Result<Vec<GattService>, TransportError> {
        let state = self.lock();
        Self::require_connected(&state, id)?;
        Ok(state.services.clone())
    }

    async fn request_mtu(&self, _id: &str, _mtu: u16) -> Result<u16, TransportError> {
        self.lock().mtu.clone()
    }

    async fn write(
        &self,
        id: &str,
        _characteristic: &CharacteristicRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::require_connected(&state, id)?;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        state.writes.push((data.to_vec(), kind));

        let is_disconnect = WireFrame::decode(data)
            .map(|p| CommandTable::identify(&p) == "DISCONNECT")
            .unwrap_or(false);
        if is_disconnect && state.ack_disconnect {
            if let Some(tx) = &state.notify_sender {
                let _ = tx.send(br#"{"type":"DISCONNECT_ACK"}"#.to_vec());
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        id: &str,
        _characteristic: &CharacteristicRef,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let mut state = self.lock();
        Self::require_connected(&state, id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.notify_sender = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        _id: &str,
        _characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.unsubscribes += 1;
        state.notify_sender = None;
        Ok(())
    }

    async fn disconnect_events(&self, id: &str) -> Result<oneshot::Receiver<()>, TransportError> {
        let mut state = self.lock();
        Self::require_connected(&state, id)?;
        let (tx, rx) = oneshot::channel();
        state.disconnect_sender = Some(tx);
        Ok(rx)
    }

    async fn is_connected(&self, id: &str) -> Result<bool, TransportError> {
        Ok(self.lock().connected.as_deref() == Some(id))
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        let yield_after = {
            let mut state = self.lock();
            state.cancels += 1;
            Self::require_connected(&state, id)?;
            state.connected = None;
            state.notify_sender = None;
            // A cancelled link also fires the platform disconnect callback.
            if let Some(tx) = state.disconnect_sender.take() {
                let _ = tx.send(());
            }
            state.yield_on_cancel
        };
        if yield_after {
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// In-memory [`DeviceRecordStore`]; clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryRecords {
    slot: Arc<Mutex<Option<DeviceRecord>>>,
}

impl MemoryRecords {
    pub fn current(&self) -> Option<DeviceRecord> {
        self.slot.lock().unwrap().clone()
    }
}

impl DeviceRecordStore for MemoryRecords {
    fn save_device(&mut self, record: DeviceRecord) -> anyhow::Result<()> {
        *self.slot.lock().unwrap() = Some(record);
        Ok(())
    }

    fn load_device(&self) -> Option<DeviceRecord> {
        self.current()
    }

    fn clear_device(&mut self) -> anyhow::Result<()> {
        *self.slot.lock().unwrap() = None;
        Ok(())
    }
}

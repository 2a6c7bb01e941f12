//! [`BleTransport`] on the host radio through btleplug.

use crate::domain::models::AdapterState;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharProps, CharacteristicRef, DiscoveredPeripheral, GattCharacteristic,
    GattService, PeripheralInfo, TransportError, WriteKind,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound(String::new()),
            btleplug::Error::TimedOut(_) => TransportError::Timeout,
            btleplug::Error::NotSupported(_) => TransportError::Unsupported,
            other => {
                let message = other.to_string();
                if signals_unsettled_adapter(&message) {
                    TransportError::UnknownState
                } else {
                    TransportError::Backend(message)
                }
            }
        }
    }
}

/// Platform stacks report a radio that is powering up or resetting as plain
/// error text.
fn signals_unsettled_adapter(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["not ready", "powered off", "not powered", "resetting", "unknown state"]
        .iter()
        .any(|marker| message.contains(marker))
}

/// A GATT failure while the adapter is not powered on says nothing about the
/// link; report it as `UnknownState` so the caller waits and retries.
fn classify_failure(error: TransportError, adapter: Option<AdapterState>) -> TransportError {
    match (error, adapter) {
        (TransportError::UnknownState, _) => TransportError::UnknownState,
        (TransportError::NotConnected, _) => TransportError::NotConnected,
        (
            _,
            Some(AdapterState::PoweredOff | AdapterState::Resetting | AdapterState::Unknown),
        ) => TransportError::UnknownState,
        (error, _) => error,
    }
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn char_props(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// First adapter of the host. With no adapter present every state query
/// answers `Unknown`, which the connection layer reads as "no radio".
pub struct BtleplugBackend {
    adapter: Option<Adapter>,
    known: Mutex<HashMap<String, Peripheral>>,
    scan_forward: Mutex<Option<JoinHandle<()>>>,
    notify_forwards: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleplugBackend {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        match &adapter {
            Some(adapter) => match adapter.adapter_info().await {
                Ok(info) => info!("Using Bluetooth adapter {}", info),
                Err(e) => debug!("Adapter info unavailable: {}", e),
            },
            None => warn!("No Bluetooth adapter found"),
        }

        Ok(Self {
            adapter,
            known: Mutex::new(HashMap::new()),
            scan_forward: Mutex::new(None),
            notify_forwards: Mutex::new(HashMap::new()),
        })
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .as_ref()
            .ok_or_else(|| TransportError::Backend("no Bluetooth adapter".to_string()))
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.known.lock().await.get(id).cloned() {
            return Ok(peripheral);
        }

        let adapter = self.adapter()?;
        for peripheral in adapter.peripherals().await? {
            if peripheral.id().to_string() == id {
                self.known
                    .lock()
                    .await
                    .insert(id.to_string(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(TransportError::DeviceNotFound(id.to_string()))
    }

    /// Re-read the adapter after a failed GATT operation and classify the
    /// error against it.
    async fn settle_failure(&self, error: btleplug::Error) -> TransportError {
        let error = TransportError::from(error);
        let adapter = self.adapter_state().await.ok();
        let classified = classify_failure(error, adapter);
        if classified == TransportError::UnknownState {
            debug!("GATT operation failed with the adapter in {:?}", adapter);
        }
        classified
    }

    fn characteristic(
        peripheral: &Peripheral,
        target: &CharacteristicRef,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.characteristic && c.service_uuid == target.service)
            .ok_or_else(|| {
                TransportError::Backend(format!(
                    "characteristic {} not discovered",
                    target.characteristic
                ))
            })
    }
}

#[async_trait]
impl BleTransport for BtleplugBackend {
    async fn adapter_state(&self) -> Result<AdapterState, TransportError> {
        match &self.adapter {
            Some(adapter) => Ok(adapter_state(adapter.adapter_state().await?)),
            None => Ok(AdapterState::Unknown),
        }
    }

    async fn start_scan(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredPeripheral>, TransportError> {
        let adapter = self.adapter()?.clone();
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = peripheral.properties().await.ok().flatten();
                let advertisement = DiscoveredPeripheral {
                    id: id.to_string(),
                    name: properties.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: properties.and_then(|p| p.rssi),
                };
                trace!("Advertisement: {:?}", advertisement);
                if tx.send(advertisement).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.scan_forward.lock().await.replace(forward) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(forward) = self.scan_forward.lock().await.take() {
            forward.abort();
        }
        self.adapter()?.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, TransportError> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        let name = peripheral
            .properties()
            .await?
            .and_then(|properties| properties.local_name);
        Ok(PeripheralInfo {
            id: id.to_string(),
            name,
        })
    }

    async fn discover_services(&self, id: &str) -> Result<Vec<GattService>, TransportError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        properties: char_props(c.properties),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn request_mtu(&self, _id: &str, _mtu: u16) -> Result<u16, TransportError> {
        // btleplug negotiates the MTU inside the platform stack.
        Err(TransportError::Unsupported)
    }

    async fn write(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        match peripheral.write(&target, data, write_type).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.settle_failure(e).await),
        }
    }

    async fn subscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let peripheral = self.peripheral(id).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        if let Err(e) = peripheral.subscribe(&target).await {
            return Err(self.settle_failure(e).await);
        }
        let mut notifications = peripheral.notifications().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let uuid = target.uuid;
        let forward = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self
            .notify_forwards
            .lock()
            .await
            .insert(id.to_string(), forward)
        {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        if let Some(forward) = self.notify_forwards.lock().await.remove(id) {
            forward.abort();
        }
        let peripheral = self.peripheral(id).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn disconnect_events(&self, id: &str) -> Result<oneshot::Receiver<()>, TransportError> {
        let adapter = self.adapter()?;
        let target = self.peripheral(id).await?.id();
        let mut events = adapter.events().await?;

        let (mut tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == target => {
                            debug!("Adapter reported {:?} disconnected", id);
                            let _ = tx.send(());
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn is_connected(&self, id: &str) -> Result<bool, TransportError> {
        Ok(self.peripheral(id).await?.is_connected().await?)
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        if let Some(forward) = self.notify_forwards.lock().await.remove(id) {
            forward.abort();
        }
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            return Err(TransportError::NotConnected);
        }
        peripheral.disconnect().await?;
        Ok(())
    }
}

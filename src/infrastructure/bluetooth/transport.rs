//! BLE Transport
//!
//! The narrow set of central-role operations the connection logic needs.
//! [`super::btleplug_backend::BtleplugBackend`] talks to the real radio;
//! tests script a mock behind the same trait.

use crate::domain::models::AdapterState;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The adapter is between states (powering up, resetting).
    #[error("Bluetooth adapter is in an unknown state")]
    UnknownState,
    #[error("Device is not connected")]
    NotConnected,
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Operation not supported by this platform")]
    Unsupported,
    #[error("Operation timed out")]
    Timeout,
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRole {
    /// Phone to chair, written
    Rx,
    /// Chair to phone, notified
    Tx,
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "RX (write)"),
            Self::Tx => write!(f, "TX (notify)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProps {
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn is_notifiable(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharProps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Address of one characteristic on a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// An advertisement seen during a scan, before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub id: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn adapter_state(&self) -> Result<AdapterState, TransportError>;

    /// Start an unfiltered scan. Advertisements are delivered until
    /// [`BleTransport::stop_scan`] is called.
    async fn start_scan(&self)
        -> Result<mpsc::UnboundedReceiver<DiscoveredPeripheral>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, TransportError>;

    async fn discover_services(&self, id: &str) -> Result<Vec<GattService>, TransportError>;

    /// Negotiate a larger ATT MTU, returning the granted value.
    async fn request_mtu(&self, id: &str, mtu: u16) -> Result<u16, TransportError>;

    async fn write(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError>;

    async fn unsubscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError>;

    /// Resolves once the platform reports the link to `id` dropped.
    async fn disconnect_events(&self, id: &str) -> Result<oneshot::Receiver<()>, TransportError>;

    async fn is_connected(&self, id: &str) -> Result<bool, TransportError>;

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError>;
}

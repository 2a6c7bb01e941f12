use crate::domain::intent::Intent;
use crate::domain::state::MassageTechnique;
use crate::error::ErrorKind;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Radio state as reported by the platform Bluetooth stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// States that will not change without user action; polling them is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PoweredOff | Self::Unauthorized | Self::Unsupported
        )
    }

    pub fn is_ready(&self) -> bool {
        *self == Self::PoweredOn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// A device reported by a scan, after name filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedDevice {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Massage program reported in STATUS messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChairProgram {
    Relax,
    Massage,
    Therapy,
    Custom,
}

impl ChairProgram {
    /// Firmware program codes; anything unrecognised is treated as relax.
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Massage,
            2 => Self::Therapy,
            3 => Self::Custom,
            _ => Self::Relax,
        }
    }
}

/// Snapshot carried by a STATUS message. Every field is optional; the
/// firmware only reports what it knows.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MassageSettings {
    #[serde(default, deserialize_with = "program")]
    pub mode: Option<ChairProgram>,
    #[serde(default, deserialize_with = "level")]
    pub intensity: Option<u8>,
    #[serde(default, rename = "power", deserialize_with = "flag")]
    pub is_running: Option<bool>,
    #[serde(default, deserialize_with = "seconds")]
    pub timer: Option<u32>,
    #[serde(default, deserialize_with = "flag")]
    pub roll_spot: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub kneading: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub combine: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub percussion: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub compression: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub recline: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub incline: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub backward: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub forward: Option<bool>,
}

// Lenient field decoders: a field with an unexpected shape becomes `None`
// instead of rejecting the whole snapshot.

fn program<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ChairProgram>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_u64().map(ChairProgram::from_code),
        Value::Null => None,
        _ => Some(ChairProgram::Relax),
    })
}

fn level<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_u64().and_then(|v| u8::try_from(v).ok()),
        Value::String(s) => match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(1),
            "HIGH" => Some(2),
            other => other.parse().ok(),
        },
        _ => None,
    })
}

fn seconds<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.to_ascii_uppercase().as_str() {
            "ON" | "TRUE" | "1" => Some(true),
            "OFF" | "FALSE" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Events emitted by the core to whoever drives the UI or state store.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    ScanResult(ScannedDevice),
    ScanningChanged(bool),
    SettingsUpdate(MassageSettings),
    ConnectionError { kind: ErrorKind, message: String },
    DeviceError(String),
    CommandAcknowledged(Option<String>),
    DisconnectAcknowledged,
    TimerExpired,
    /// The firmware ended its 20 minute AUTO session; the store must drop to MANUAL.
    AutoTimeout { message: Option<String> },
    DeviceConnected,
    AutoModeChanged(bool),
    TechniqueChanged(MassageTechnique),
    /// Connection-dependent state must be cleared.
    SessionReset,
    RawMessage(String),
    LogMessage(StatusMessage),
}

/// Where the core publishes its events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AppEvent);

    fn log(&self, message: &str, severity: MessageSeverity) {
        self.emit(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl EventSink for mpsc::UnboundedSender<AppEvent> {
    fn emit(&self, event: AppEvent) {
        let _ = self.send(event);
    }
}

/// Requests accepted by the Bluetooth service loop.
#[derive(Debug, Clone)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Dispatch(Intent),
    Shutdown,
}

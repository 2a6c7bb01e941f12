use crate::domain::models::AdapterState;
use crate::domain::state::MassageTechnique;
use crate::infrastructure::bluetooth::transport::{CharacteristicRole, TransportError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Coarse error classification handed to the UI together with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    AdapterUnready,
    AdapterTimeout,
    NoRadio,
    ServiceNotFound,
    CharacteristicNotFound,
    ConnectionTimeout,
    WriteFailed,
    InvalidMode,
    UnsupportedMode,
    InvalidIntensity,
    UnknownCommand,
    MalformedResponse,
    NotConnected,
    InvalidPairing,
    InvalidIntent,
    Transport,
    Storage,
}

#[derive(Debug, Error)]
pub enum ChairError {
    #[error("Bluetooth adapter is not ready (state: {state:?})")]
    AdapterUnready { state: AdapterState },

    #[error("Bluetooth adapter did not become ready in time (last state: {last_state:?})")]
    AdapterTimeout { last_state: AdapterState },

    #[error("No working Bluetooth radio detected")]
    NoRadio,

    #[error("Chair service not found (device offers: {available:?})")]
    ServiceNotFound { available: Vec<Uuid> },

    #[error("No usable {role} characteristic (service offers: {available:?})")]
    CharacteristicNotFound {
        role: CharacteristicRole,
        available: Vec<Uuid>,
    },

    #[error("Connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("{command} is only available in AUTO mode")]
    InvalidMode { command: &'static str },

    #[error("Intensity cannot be adjusted while technique is {technique:?}")]
    UnsupportedMode { technique: MassageTechnique },

    #[error("Invalid intensity level {0}, expected 1 or 2")]
    InvalidIntensity(u8),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Not connected to a chair")]
    NotConnected,

    #[error("Invalid pairing payload: {0}")]
    InvalidPairing(String),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChairError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdapterUnready { .. } => ErrorKind::AdapterUnready,
            Self::AdapterTimeout { .. } => ErrorKind::AdapterTimeout,
            Self::NoRadio => ErrorKind::NoRadio,
            Self::ServiceNotFound { .. } => ErrorKind::ServiceNotFound,
            Self::CharacteristicNotFound { .. } => ErrorKind::CharacteristicNotFound,
            Self::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            Self::WriteFailed(_) => ErrorKind::WriteFailed,
            Self::InvalidMode { .. } => ErrorKind::InvalidMode,
            Self::UnsupportedMode { .. } => ErrorKind::UnsupportedMode,
            Self::InvalidIntensity(_) => ErrorKind::InvalidIntensity,
            Self::UnknownCommand(_) => ErrorKind::UnknownCommand,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::InvalidPairing(_) => ErrorKind::InvalidPairing,
            Self::InvalidIntent(_) => ErrorKind::InvalidIntent,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Io(_) | Self::Json(_) => ErrorKind::Storage,
        }
    }

    /// Whether waiting and retrying may succeed without user action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AdapterUnready { state } => !state.is_terminal(),
            Self::AdapterTimeout { .. } => true,
            Self::Transport(TransportError::UnknownState) => true,
            _ => false,
        }
    }

    /// Suggested next step for the user.
    pub fn remedy(&self) -> &'static str {
        match self {
            Self::AdapterUnready { state } => match state {
                AdapterState::PoweredOff => "Turn Bluetooth on and try again.",
                AdapterState::Unauthorized => "Allow Bluetooth access for this app in system settings.",
                AdapterState::Unsupported => "This device does not support Bluetooth Low Energy.",
                _ => "Wait a moment for Bluetooth to start, then try again.",
            },
            Self::AdapterTimeout { .. } => "Bluetooth is still starting. Toggle it off and on, then retry.",
            Self::NoRadio => "No Bluetooth radio is available. Use a device with Bluetooth.",
            Self::ServiceNotFound { .. } | Self::CharacteristicNotFound { .. } => {
                "This device does not look like a massage chair. Check the chair's power and pick it again."
            }
            Self::ConnectionTimeout(_) => "Move closer to the chair and make sure it is powered on.",
            Self::WriteFailed(_) | Self::Transport(_) => "Connection is unstable. Reconnect to the chair.",
            Self::InvalidMode { .. } => "Switch the chair to AUTO mode first.",
            Self::UnsupportedMode { .. } => "Pick a technique that supports intensity first.",
            Self::InvalidIntensity(_) => "Choose intensity 1 or 2.",
            Self::NotConnected => "Connect to a chair first.",
            Self::InvalidPairing(_) => "Scan the QR code printed on the chair.",
            Self::UnknownCommand(_)
            | Self::MalformedResponse(_)
            | Self::InvalidIntent(_)
            | Self::Io(_)
            | Self::Json(_) => "Try again. If the problem persists, restart the app.",
        }
    }
}

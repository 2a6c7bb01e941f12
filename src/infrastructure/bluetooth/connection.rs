//! BLE Connection Module
//!
//! Adapter readiness, GATT resolution with fallback, and the write path
//! with its retry policy.

use crate::domain::models::AdapterState;
use crate::domain::settings::Settings;
use crate::error::ChairError;
use crate::infrastructure::bluetooth::protocol::{
    FALLBACK_CHAR_UUIDS, FALLBACK_SERVICE_UUIDS, SERIAL_CHAR_UUID, SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharProps, CharacteristicRef, CharacteristicRole, GattService, TransportError,
    WriteKind,
};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub service_uuid: Uuid,
    pub rx_char_uuid: Uuid,
    pub tx_char_uuid: Uuid,
    /// Probed in order when the primary service is absent
    pub fallback_service_uuids: Vec<Uuid>,
    pub fallback_char_uuids: Vec<Uuid>,

    pub scan_timeout: Duration,
    pub connection_timeout: Duration,
    pub fragment_timeout: Duration,
    pub max_fragment_buffer: usize,
    pub adapter_ready_timeout: Duration,
    pub adapter_poll_interval: Duration,
    pub adapter_settle: Duration,
    /// Consecutive `Unknown` polls after which the host is assumed to have no radio
    pub no_radio_after_polls: u32,
    pub write_retry_wait: Duration,
    pub heartbeat_delay: Duration,
    pub heartbeat_periodic: bool,
    pub disconnect_debounce: Duration,
    pub disconnect_ack_timeout: Duration,
    pub requested_mtu: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(s: &Settings) -> Self {
        Self {
            service_uuid: parse_or(&s.ble_service_uuid, SERVICE_UUID),
            rx_char_uuid: parse_or(&s.ble_rx_char_uuid, SERIAL_CHAR_UUID),
            tx_char_uuid: parse_or(&s.ble_tx_char_uuid, SERIAL_CHAR_UUID),
            fallback_service_uuids: parse_list(&s.fallback_service_uuids, &FALLBACK_SERVICE_UUIDS),
            fallback_char_uuids: parse_list(&s.fallback_char_uuids, &FALLBACK_CHAR_UUIDS),

            scan_timeout: Duration::from_millis(s.scan_timeout_ms),
            connection_timeout: Duration::from_millis(s.connection_timeout_ms),
            fragment_timeout: Duration::from_millis(s.fragment_timeout_ms),
            max_fragment_buffer: s.max_fragment_buffer,
            adapter_ready_timeout: Duration::from_millis(s.adapter_ready_timeout_ms),
            adapter_poll_interval: Duration::from_millis(s.adapter_poll_interval_ms),
            adapter_settle: Duration::from_millis(s.adapter_settle_ms),
            no_radio_after_polls: s.no_radio_after_polls,
            write_retry_wait: Duration::from_millis(s.write_retry_wait_ms),
            heartbeat_delay: Duration::from_millis(s.heartbeat_delay_ms),
            heartbeat_periodic: s.heartbeat_periodic,
            disconnect_debounce: Duration::from_millis(s.disconnect_debounce_ms),
            disconnect_ack_timeout: Duration::from_millis(s.disconnect_ack_timeout_ms),
            requested_mtu: s.requested_mtu,
        }
    }
}

fn parse_or(value: &str, default: Uuid) -> Uuid {
    Uuid::parse_str(value).unwrap_or_else(|_| {
        warn!("Ignoring invalid UUID '{}' in settings, using {}", value, default);
        default
    })
}

fn parse_list(values: &[String], defaults: &[Uuid]) -> Vec<Uuid> {
    let parsed: Vec<Uuid> = values
        .iter()
        .filter_map(|v| match Uuid::parse_str(v) {
            Ok(uuid) => Some(uuid),
            Err(_) => {
                warn!("Ignoring invalid fallback UUID '{}'", v);
                None
            }
        })
        .collect();
    if parsed.is_empty() {
        defaults.to_vec()
    } else {
        parsed
    }
}

/// Poll the adapter until it is powered on.
///
/// Terminal states fail at once. Transient states are polled every
/// `adapter_poll_interval` until `timeout`; a run of `Unknown` answers long
/// enough to exhaust `no_radio_after_polls` is reported as [`ChairError::NoRadio`].
pub async fn wait_for_adapter(
    transport: &dyn BleTransport,
    config: &ConnectionConfig,
    timeout: Duration,
) -> Result<AdapterState, ChairError> {
    let deadline = Instant::now() + timeout;
    let mut unknown_polls = 0u32;

    loop {
        let state = match transport.adapter_state().await {
            Ok(state) => state,
            Err(e) => {
                debug!("Adapter state query failed: {}", e);
                AdapterState::Unknown
            }
        };

        if state.is_ready() {
            return Ok(state);
        }
        if state.is_terminal() {
            warn!("Bluetooth adapter unavailable: {:?}", state);
            return Err(ChairError::AdapterUnready { state });
        }

        if state == AdapterState::Unknown {
            unknown_polls += 1;
            if unknown_polls >= config.no_radio_after_polls {
                warn!(
                    "Adapter stayed Unknown for {} polls, assuming no radio",
                    unknown_polls
                );
                return Err(ChairError::NoRadio);
            }
        } else {
            unknown_polls = 0;
        }

        if Instant::now() + config.adapter_poll_interval > deadline {
            return Err(ChairError::AdapterTimeout { last_state: state });
        }
        debug!("Adapter state {:?}, waiting...", state);
        sleep(config.adapter_poll_interval).await;
    }
}

/// Service and characteristics the session talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedGatt {
    pub service: Uuid,
    pub rx: CharacteristicRef,
    pub rx_properties: CharProps,
    /// `None` when the service exposes nothing notifiable.
    pub tx: Option<CharacteristicRef>,
}

impl ResolvedGatt {
    /// Preferred write type for RX.
    pub fn write_kind(&self) -> WriteKind {
        if !self.rx_properties.write && self.rx_properties.write_without_response {
            WriteKind::WithoutResponse
        } else {
            WriteKind::WithResponse
        }
    }
}

/// Pick the chair service and its RX/TX characteristics.
///
/// Service: the configured UUID, then each fallback in order. Characteristics:
/// the configured UUID, then the fallback list, then the first characteristic
/// with the needed capability. RX and TX may resolve to the same one.
pub fn resolve_characteristics(
    services: &[GattService],
    config: &ConnectionConfig,
) -> Result<ResolvedGatt, ChairError> {
    let service = std::iter::once(&config.service_uuid)
        .chain(config.fallback_service_uuids.iter())
        .find_map(|uuid| services.iter().find(|s| s.uuid == *uuid))
        .ok_or_else(|| ChairError::ServiceNotFound {
            available: services.iter().map(|s| s.uuid).collect(),
        })?;

    if service.uuid != config.service_uuid {
        info!("Primary service absent, using fallback service {}", service.uuid);
    }

    let pick = |preferred: Uuid, capable: fn(&CharProps) -> bool| {
        std::iter::once(&preferred)
            .chain(config.fallback_char_uuids.iter())
            .find_map(|uuid| {
                service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == *uuid && capable(&c.properties))
            })
            .or_else(|| service.characteristics.iter().find(|c| capable(&c.properties)))
    };

    let rx = pick(config.rx_char_uuid, CharProps::is_writable).ok_or_else(|| {
        ChairError::CharacteristicNotFound {
            role: CharacteristicRole::Rx,
            available: service.characteristics.iter().map(|c| c.uuid).collect(),
        }
    })?;

    let tx = pick(config.tx_char_uuid, CharProps::is_notifiable);
    if tx.is_none() {
        warn!("No notifiable characteristic on {}, responses will not be received", service.uuid);
    }

    Ok(ResolvedGatt {
        service: service.uuid,
        rx: CharacteristicRef {
            service: service.uuid,
            characteristic: rx.uuid,
        },
        rx_properties: rx.properties,
        tx: tx.map(|c| CharacteristicRef {
            service: service.uuid,
            characteristic: c.uuid,
        }),
    })
}

/// Write one frame to RX.
///
/// An adapter in an unknown state gets one retry after it settles (bounded
/// by `write_retry_wait`); any remaining failure falls back to a write
/// without response before giving up.
pub async fn write_with_retry(
    transport: &dyn BleTransport,
    config: &ConnectionConfig,
    device_id: &str,
    rx: &CharacteristicRef,
    preferred: WriteKind,
    data: &[u8],
) -> Result<(), ChairError> {
    if preferred == WriteKind::WithResponse {
        match transport.write(device_id, rx, data, WriteKind::WithResponse).await {
            Ok(()) => return Ok(()),
            Err(TransportError::UnknownState) => {
                warn!("Write hit an unsettled adapter, waiting before retry");
                if let Err(e) = wait_for_adapter(transport, config, config.write_retry_wait).await {
                    debug!("Adapter still not ready: {}", e);
                }
                match transport.write(device_id, rx, data, WriteKind::WithResponse).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Retried write failed: {}", e),
                }
            }
            Err(TransportError::NotConnected) => return Err(ChairError::NotConnected),
            Err(e) => warn!("Write with response failed: {}", e),
        }
        debug!("Falling back to write without response");
    }

    transport
        .write(device_id, rx, data, WriteKind::WithoutResponse)
        .await
        .map_err(|e| match e {
            TransportError::NotConnected => ChairError::NotConnected,
            other => ChairError::WriteFailed(other.to_string()),
        })
}

//! QR pairing payload printed on the chair.
//!
//! ```json
//! {"type":"massage_device","mac":"3c:8a:1f:81:a0:9e","uuid":"6e400001-b5a3-f393-e0a9-e50e24dcca9e"}
//! ```

use crate::error::ChairError;
use serde::Deserialize;
use uuid::Uuid;

pub const DEVICE_TYPE: &str = "massage_device";

#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    uuid: Option<String>,
    mac: Option<String>,
    name: Option<String>,
    paircode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPayload {
    pub mac: String,
    pub service_uuid: Uuid,
    pub name: Option<String>,
    /// Kept for display; the OS runs the actual pairing dialog.
    pub pair_code: Option<String>,
}

impl PairingPayload {
    pub fn parse(data: &str) -> Result<Self, ChairError> {
        let raw: RawPayload = serde_json::from_str(data)
            .map_err(|_| ChairError::InvalidPairing("QR code is not valid JSON".to_string()))?;

        let kind = required(raw.kind, "type")?;
        let uuid = required(raw.uuid, "uuid")?;
        let mac = required(raw.mac, "mac")?;

        if !is_mac_address(&mac) {
            return Err(ChairError::InvalidPairing(format!(
                "invalid MAC address format: {}",
                mac
            )));
        }

        // Only the hyphenated form is accepted; the version nibble is not checked.
        let service_uuid = Some(&uuid)
            .filter(|u| u.len() == 36)
            .and_then(|u| Uuid::parse_str(u).ok())
            .ok_or_else(|| ChairError::InvalidPairing(format!("invalid UUID format: {}", uuid)))?;

        if kind != DEVICE_TYPE {
            return Err(ChairError::InvalidPairing(format!(
                "device type not supported: {}",
                kind
            )));
        }

        Ok(Self {
            mac,
            service_uuid,
            name: raw.name,
            pair_code: raw.paircode,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ChairError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ChairError::InvalidPairing(format!("missing field: {}", field)))
}

/// Six hex pairs separated consistently by `:` or `-`.
fn is_mac_address(mac: &str) -> bool {
    let separator = match mac.as_bytes().get(2) {
        Some(b':') => ':',
        Some(b'-') => '-',
        _ => return false,
    };
    let groups: Vec<&str> = mac.split(separator).collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

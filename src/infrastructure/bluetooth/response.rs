//! Response Interpreter
//!
//! Turns reassembled notification messages into [`AppEvent`]s.

use crate::domain::models::{AppEvent, MassageSettings};
use crate::error::ChairError;
use crate::infrastructure::bluetooth::fragments::AssembledMessage;
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    Status(MassageSettings),
    Ack { command: Option<String> },
    Error { message: String },
    DisconnectAck,
    TimerExpired,
    AutoTimeout { message: Option<String> },
    Connected,
    Unknown { kind: Option<String> },
}

impl DeviceResponse {
    /// Classify a JSON message by its `type` field.
    pub fn parse(text: &str) -> Result<Self, ChairError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ChairError::MalformedResponse(format!("{}: {}", e, text)))?;
        if !value.is_object() {
            return Err(ChairError::MalformedResponse(format!(
                "expected a JSON object: {}",
                text
            )));
        }

        let text_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

        let response = match value.get("type").and_then(Value::as_str) {
            Some("STATUS") => {
                let settings: MassageSettings = serde_json::from_value(value.clone())
                    .map_err(|e| ChairError::MalformedResponse(e.to_string()))?;
                Self::Status(settings)
            }
            Some("ACK") => Self::Ack {
                command: value.get("command").map(|c| match c {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            },
            Some("ERROR") => Self::Error {
                message: text_field("message").unwrap_or_else(|| "unspecified device error".to_string()),
            },
            Some("DISCONNECT_ACK") => Self::DisconnectAck,
            Some("TIMER_EXPIRED") => Self::TimerExpired,
            Some("AUTO_TIMEOUT") => Self::AutoTimeout {
                message: text_field("message"),
            },
            Some("CONNECTED") => Self::Connected,
            other => Self::Unknown {
                kind: other.map(str::to_string),
            },
        };
        Ok(response)
    }

    pub fn into_events(self) -> Vec<AppEvent> {
        match self {
            Self::Status(settings) => vec![AppEvent::SettingsUpdate(settings)],
            Self::Ack { command } => {
                debug!("Command acknowledged: {:?}", command);
                vec![AppEvent::CommandAcknowledged(command)]
            }
            Self::Error { message } => {
                warn!("Device reported error: {}", message);
                vec![AppEvent::DeviceError(message)]
            }
            Self::DisconnectAck => vec![AppEvent::DisconnectAcknowledged],
            Self::TimerExpired => vec![AppEvent::TimerExpired],
            Self::AutoTimeout { message } => {
                info!("AUTO session expired on the chair, switching to MANUAL");
                vec![AppEvent::AutoTimeout { message }]
            }
            Self::Connected => vec![AppEvent::DeviceConnected],
            Self::Unknown { kind } => {
                info!("Unknown response type: {:?}", kind);
                Vec::new()
            }
        }
    }
}

/// Interpret one assembled message. Malformed JSON is logged and dropped.
pub fn interpret(message: AssembledMessage) -> Vec<AppEvent> {
    match message {
        AssembledMessage::Json(text) => match DeviceResponse::parse(&text) {
            Ok(response) => response.into_events(),
            Err(e) => {
                warn!("Dropping response: {}", e);
                Vec::new()
            }
        },
        AssembledMessage::Text(text) => {
            // Older firmware acknowledges disconnects in plain text.
            if text.contains("DISCONNECT_ACK") {
                vec![AppEvent::DisconnectAcknowledged]
            } else {
                vec![AppEvent::RawMessage(text)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ChairProgram;

    fn events(json: &str) -> Vec<AppEvent> {
        interpret(AssembledMessage::Json(json.to_string()))
    }

    #[test]
    fn test_status_maps_fields() {
        let response = DeviceResponse::parse(
            r#"{"type":"STATUS","mode":2,"intensity":1,"power":true,"timer":900,
                "rollSpot":1,"kneading":false,"combine":0,"percussion":"ON",
                "compression":false,"recline":false,"incline":false,
                "backward":false,"forward":true}"#,
        )
        .unwrap();
        let DeviceResponse::Status(settings) = response else {
            panic!("expected status");
        };
        assert_eq!(settings.mode, Some(ChairProgram::Therapy));
        assert_eq!(settings.intensity, Some(1));
        assert_eq!(settings.is_running, Some(true));
        assert_eq!(settings.timer, Some(900));
        assert_eq!(settings.roll_spot, Some(true));
        assert_eq!(settings.combine, Some(false));
        assert_eq!(settings.percussion, Some(true));
        assert_eq!(settings.forward, Some(true));
    }

    #[test]
    fn test_status_with_unknown_mode_is_relax() {
        let response = DeviceResponse::parse(r#"{"type":"STATUS","mode":9}"#).unwrap();
        assert_eq!(
            response,
            DeviceResponse::Status(MassageSettings {
                mode: Some(ChairProgram::Relax),
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_status_intensity_words() {
        let response = DeviceResponse::parse(r#"{"type":"STATUS","intensity":"HIGH"}"#).unwrap();
        let DeviceResponse::Status(settings) = response else {
            panic!("expected status");
        };
        assert_eq!(settings.intensity, Some(2));
        assert_eq!(settings.mode, None);
    }

    #[test]
    fn test_auto_timeout_forces_manual_event() {
        let out = events(r#"{"type":"AUTO_TIMEOUT","message":"20 minutes done"}"#);
        assert!(matches!(
            out.as_slice(),
            [AppEvent::AutoTimeout { message: Some(m) }] if m == "20 minutes done"
        ));
    }

    #[test]
    fn test_simple_types() {
        assert!(matches!(
            events(r#"{"type":"ACK","command":"AUTO_ON"}"#).as_slice(),
            [AppEvent::CommandAcknowledged(Some(c))] if c == "AUTO_ON"
        ));
        assert!(matches!(
            events(r#"{"type":"ERROR","message":"motor stall"}"#).as_slice(),
            [AppEvent::DeviceError(m)] if m == "motor stall"
        ));
        assert!(matches!(
            events(r#"{"type":"DISCONNECT_ACK"}"#).as_slice(),
            [AppEvent::DisconnectAcknowledged]
        ));
        assert!(matches!(
            events(r#"{"type":"TIMER_EXPIRED"}"#).as_slice(),
            [AppEvent::TimerExpired]
        ));
        assert!(matches!(
            events(r#"{"type":"CONNECTED"}"#).as_slice(),
            [AppEvent::DeviceConnected]
        ));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            DeviceResponse::parse(r#"{"type":"FIRMWARE_INFO"}"#).unwrap(),
            DeviceResponse::Unknown {
                kind: Some("FIRMWARE_INFO".to_string())
            }
        );
        assert!(events(r#"{"hello":1}"#).is_empty());
    }

    #[test]
    fn test_malformed_json_is_dropped() {
        assert!(matches!(
            DeviceResponse::parse("{oops}"),
            Err(ChairError::MalformedResponse(_))
        ));
        assert!(events("{oops}").is_empty());
        assert!(events("[1,2]").is_empty());
    }

    #[test]
    fn test_plain_text_messages() {
        assert!(matches!(
            interpret(AssembledMessage::Text("DISCONNECT_ACK".to_string())).as_slice(),
            [AppEvent::DisconnectAcknowledged]
        ));
        assert!(matches!(
            interpret(AssembledMessage::Text("READY".to_string())).as_slice(),
            [AppEvent::RawMessage(t)] if t == "READY"
        ));
    }
}

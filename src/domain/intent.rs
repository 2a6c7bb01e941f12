//! Textual control intents (`NAME:VALUE`), as typed at the command prompt
//! and as sent by older app builds.

use crate::domain::state::MassageTechnique;
use crate::error::ChairError;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChairAxis {
    Recline,
    Incline,
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollSpot {
    Roll,
    Spot,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    SetAutoMode(bool),
    /// Momentary seat or backrest motor; `pressed` false is the release.
    Axis { axis: ChairAxis, pressed: bool },
    RollUp(bool),
    RollDown(bool),
    ManualKneading(bool),
    ManualPercussion(bool),
    RollSpot(RollSpot),
    /// AUTO technique toggle. Turning any technique off stops the massage.
    Technique { technique: MassageTechnique, on: bool },
    Intensity(u8),
    RequestStatus,
    Disconnect,
}

impl FromStr for Intent {
    type Err = ChairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (name, value) = match input.split_once(':') {
            Some((name, value)) => (name.trim().to_ascii_uppercase(), value.trim().to_ascii_uppercase()),
            None => (input.to_ascii_uppercase(), String::new()),
        };
        let invalid = || ChairError::InvalidIntent(input.to_string());

        let on_off = |value: &str| match value {
            "ON" | "1" => Ok(true),
            "OFF" | "0" => Ok(false),
            _ => Err(invalid()),
        };
        // 1 and 2 are both "pressed"; any other number releases.
        let press_level = |value: &str| {
            value
                .parse::<i32>()
                .map(|level| level == 1 || level == 2)
                .map_err(|_| invalid())
        };

        let intent = match name.as_str() {
            "MODE" => match value.as_str() {
                "AUTO" => Intent::SetAutoMode(true),
                "MANUAL" => Intent::SetAutoMode(false),
                _ => return Err(invalid()),
            },
            "RECLINE" | "INCLINE" | "FORWARD" | "BACKWARD" => {
                let axis = match name.as_str() {
                    "RECLINE" => ChairAxis::Recline,
                    "INCLINE" => ChairAxis::Incline,
                    "FORWARD" => ChairAxis::Forward,
                    _ => ChairAxis::Backward,
                };
                Intent::Axis {
                    axis,
                    pressed: press_level(&value)?,
                }
            }
            "ROLLUP" => Intent::RollUp(on_off(&value)?),
            "ROLLDOWN" => Intent::RollDown(on_off(&value)?),
            "MKNEADING" => Intent::ManualKneading(on_off(&value)?),
            "MPERCUSSION" => Intent::ManualPercussion(on_off(&value)?),
            "ROLLSPOT" => match value.as_str() {
                "ROLL" => Intent::RollSpot(RollSpot::Roll),
                "SPOT" => Intent::RollSpot(RollSpot::Spot),
                "OFF" => Intent::RollSpot(RollSpot::Off),
                _ => return Err(invalid()),
            },
            "INTENSITY" => Intent::Intensity(value.parse().map_err(|_| invalid())?),
            "KNEADING" | "COMBINE" | "PERCUSSION" | "COMPRESSION" => {
                let technique = match name.as_str() {
                    "KNEADING" => MassageTechnique::Kneading,
                    "COMBINE" => MassageTechnique::Combine,
                    "PERCUSSION" => MassageTechnique::Percussion,
                    _ => MassageTechnique::Compression,
                };
                Intent::Technique {
                    technique,
                    on: on_off(&value)?,
                }
            }
            "STATUS" => Intent::RequestStatus,
            "DISCONNECT" => Intent::Disconnect,
            _ => return Err(invalid()),
        };
        Ok(intent)
    }
}

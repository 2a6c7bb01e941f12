//! Command Table
//!
//! Named command packets understood by the chair firmware. The sequence byte
//! is a fixed tag per command family, not a counter. Several entries share a
//! command byte and differ only in their data bytes (roll up and roll down
//! both use 0x21), and ROLL_OFF and SPOT_ON are byte-identical.

use crate::error::ChairError;
use crate::infrastructure::bluetooth::protocol::{Packet, DEVICE_ID};

const ON: u8 = 0xF0;
const OFF: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub device_id: u8,
    pub sequence: u8,
    pub command: u8,
    pub data1: u8,
    pub data2: u8,
    pub data3: u8,
    pub description: &'static str,
}

impl CommandSpec {
    const fn new(
        name: &'static str,
        sequence: u8,
        command: u8,
        data: [u8; 3],
        description: &'static str,
    ) -> Self {
        Self {
            name,
            device_id: DEVICE_ID,
            sequence,
            command,
            data1: data[0],
            data2: data[1],
            data3: data[2],
            description,
        }
    }

    pub fn packet(&self) -> Packet {
        Packet::build(
            self.device_id,
            self.sequence,
            self.command,
            self.data1,
            self.data2,
            self.data3,
        )
    }
}

#[rustfmt::skip]
static TABLE: &[CommandSpec] = &[
    CommandSpec::new("AUTO_ON",            0xC3, 0x10, [ON, 0, 0],       "Enter AUTO mode"),
    CommandSpec::new("AUTO_OFF",           0xC3, 0x10, [OFF, 0, 0],      "Leave AUTO mode"),
    CommandSpec::new("ROLL_ON",            0x62, 0x20, [ON, 0, 0],       "Roll massage along the back"),
    CommandSpec::new("ROLL_OFF",           0x62, 0x20, [OFF, 0, 0],      "Stop the roll motor"),
    CommandSpec::new("SPOT_ON",            0x62, 0x20, [OFF, 0, 0],      "Hold rollers on one spot"),
    CommandSpec::new("KNEADING_ON",        0x93, 0x30, [ON, 0, 0],       "AUTO kneading technique"),
    CommandSpec::new("COMBINE_ON",         0x03, 0x50, [ON, 0, 0],       "AUTO combined technique"),
    CommandSpec::new("PERCUSSION_ON",      0xE3, 0x40, [ON, 0, 0],       "AUTO percussion technique"),
    CommandSpec::new("COMPRESSION_ON",     0x24, 0x60, [ON, 0, 0],       "AUTO air compression technique"),
    CommandSpec::new("INTENSITY_UP",       0x73, 0x70, [0, 0, 0x50],     "Raise technique intensity"),
    CommandSpec::new("INTENSITY_DOWN",     0x73, 0x70, [0, 0, 0x50],     "Lower technique intensity"),
    CommandSpec::new("RECLINE_PUSH",       0x41, 0x90, [ON, 0, 0],       "Start reclining the backrest"),
    CommandSpec::new("RECLINE_RELEASE",    0x61, 0x90, [OFF, 0, 0],      "Stop reclining"),
    CommandSpec::new("INCLINE_PUSH",       0x81, 0x80, [ON, 0, 0],       "Start raising the backrest"),
    CommandSpec::new("INCLINE_RELEASE",    0x61, 0x80, [OFF, 0, 0],      "Stop raising"),
    CommandSpec::new("FORWARD_PUSH",       0xD2, 0xA0, [ON, 0, 0],       "Start sliding the seat forward"),
    CommandSpec::new("FORWARD_RELEASE",    0xD2, 0xA0, [OFF, 0, 0],      "Stop sliding forward"),
    CommandSpec::new("BACKWARD_PUSH",      0xA2, 0xB0, [ON, 0, 0],       "Start sliding the seat back"),
    CommandSpec::new("BACKWARD_RELEASE",   0xA2, 0xB0, [OFF, 0, 0],      "Stop sliding back"),
    CommandSpec::new("ROLL_UP_PUSH",       0x72, 0x21, [0x02, ON, 0],    "Move rollers up"),
    CommandSpec::new("ROLL_UP_RELEASE",    0x72, 0x21, [0x02, OFF, 0],   "Stop moving rollers up"),
    CommandSpec::new("ROLL_DOWN_PUSH",     0x82, 0x21, [0x01, ON, 0],    "Move rollers down"),
    CommandSpec::new("ROLL_DOWN_RELEASE",  0x82, 0x21, [0x01, OFF, 0],   "Stop moving rollers down"),
    CommandSpec::new("KNEADING_PUSH",      0x93, 0x22, [0x03, ON, 0],    "Manual kneading motor on"),
    CommandSpec::new("KNEADING_RELEASE",   0x93, 0x22, [0x03, OFF, 0],   "Manual kneading motor off"),
    CommandSpec::new("PERCUSSION_PUSH",    0xE3, 0x23, [0x04, ON, 0],    "Manual percussion motor on"),
    CommandSpec::new("PERCUSSION_RELEASE", 0xE3, 0x23, [0x04, OFF, 0],   "Manual percussion motor off"),
    CommandSpec::new("HEARTBEAT_START",    0x01, 0xEE, [ON, 0, 0],       "Announce the app is present"),
    CommandSpec::new("HEARTBEAT_STOP",     0x01, 0xEE, [OFF, 0, 0],      "Announce the app is leaving"),
    CommandSpec::new("DISCONNECT",         0xFF, 0xFF, [0, 0, 0],        "Ask the chair to end the session"),
    CommandSpec::new("STATUS_REQUEST",     0x00, 0x00, [0, 0, 0],        "Request a STATUS message"),
];

/// Read-only view over the fixed command table.
pub struct CommandTable;

impl CommandTable {
    pub fn lookup(name: &str) -> Result<&'static CommandSpec, ChairError> {
        TABLE
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| ChairError::UnknownCommand(name.to_string()))
    }

    /// Build the packet for a named command.
    pub fn packet(name: &str) -> Result<Packet, ChairError> {
        Self::lookup(name).map(CommandSpec::packet)
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        TABLE.iter().map(|spec| spec.name)
    }

    /// Reverse lookup for logging. Byte-identical entries resolve to the
    /// first one in table order; unknown data bytes fall back to the family.
    pub fn identify(packet: &Packet) -> &'static str {
        let payload = packet.payload();
        TABLE
            .iter()
            .find(|spec| {
                payload
                    == [
                        spec.device_id,
                        spec.sequence,
                        spec.command,
                        spec.data1,
                        spec.data2,
                        spec.data3,
                    ]
            })
            .map(|spec| spec.name)
            .unwrap_or_else(|| Self::family(packet.command()))
    }

    pub fn family(command: u8) -> &'static str {
        match command {
            0x00 => "STATUS",
            0x10 => "AUTO_MODE",
            0x20 => "ROLL_MOTOR",
            0x21 => "MANUAL_ROLL",
            0x22 => "MANUAL_KNEADING",
            0x23 => "MANUAL_PERCUSSION",
            0x30 => "KNEADING",
            0x40 => "PERCUSSION",
            0x50 => "COMBINE",
            0x60 => "COMPRESSION",
            0x70 => "INTENSITY",
            0x80 => "INCLINE",
            0x90 => "RECLINE",
            0xA0 => "FORWARD",
            0xB0 => "BACKWARD",
            0xEE => "HEARTBEAT",
            0xFF => "DISCONNECT",
            _ => "UNKNOWN",
        }
    }
}

//! Massage Chair Wire Protocol
//!
//! This module contains the packet format spoken by the chair controller
//! and the GATT identifiers of the serial bridge it sits behind.
//!
//! A packet is nine bytes:
//!
//! ```text
//! STX  devId  seq  cmd  d1  d2  d3  chk  ETX
//! 02   70     C3   10   F0  00  00  DA   03
//! ```
//!
//! On the air the seven bytes between the markers travel as uppercase ASCII
//! hex, so the frame written to the RX characteristic is 16 bytes long.

use crate::error::ChairError;
use std::fmt;
use uuid::Uuid;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Device class of the supported chair board
pub const DEVICE_ID: u8 = 0x70;

pub const PACKET_LEN: usize = 9;
pub const FRAME_LEN: usize = 16;

/// HM-10 style serial service exposed by the chair's BLE bridge
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Serial characteristic, used for both writes and notifications on HM-10 bridges
pub const SERIAL_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Nordic UART service used by newer firmware profiles
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Nordic UART RX characteristic (phone to chair, write)
pub const NUS_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Nordic UART TX characteristic (chair to phone, notify)
pub const NUS_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Alternative services probed when the configured one is absent, in order
pub const FALLBACK_SERVICE_UUIDS: [Uuid; 2] = [SERVICE_UUID, NUS_SERVICE_UUID];

/// Known characteristics probed when the configured ones are absent, in order
pub const FALLBACK_CHAR_UUIDS: [Uuid; 3] = [SERIAL_CHAR_UUID, NUS_RX_CHAR_UUID, NUS_TX_CHAR_UUID];

/// ATT MTU requested after connecting
pub const REQUESTED_MTU: u16 = 512;

/// ATT MTU assumed when negotiation is unavailable
pub const DEFAULT_MTU: u16 = 23;

/// Compute the packet checksum over deviceId..data3.
///
/// The six bytes are summed with end-around carry, complemented, and offset
/// by 0x10. The firmware rejects any frame whose checksum differs.
pub fn checksum(payload: &[u8; 6]) -> u8 {
    let mut sum: u16 = payload.iter().map(|&b| u16::from(b)).sum();
    while sum >> 8 != 0 {
        sum = (sum & 0xFF) + (sum >> 8);
    }
    (!(sum as u8)).wrapping_add(0x10)
}

/// One command or response packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet {
    bytes: [u8; PACKET_LEN],
}

impl Packet {
    pub fn build(device_id: u8, sequence: u8, command: u8, data1: u8, data2: u8, data3: u8) -> Self {
        let payload = [device_id, sequence, command, data1, data2, data3];
        Self {
            bytes: [
                STX,
                device_id,
                sequence,
                command,
                data1,
                data2,
                data3,
                checksum(&payload),
                ETX,
            ],
        }
    }

    /// Validate a raw 9-byte packet: length, framing markers and checksum.
    pub fn parse(bytes: &[u8]) -> Result<Self, ChairError> {
        let bytes: [u8; PACKET_LEN] = bytes.try_into().map_err(|_| {
            ChairError::MalformedResponse(format!(
                "packet must be {} bytes, got {}",
                PACKET_LEN,
                bytes.len()
            ))
        })?;

        if bytes[0] != STX || bytes[PACKET_LEN - 1] != ETX {
            return Err(ChairError::MalformedResponse(format!(
                "bad framing markers {:02X}/{:02X}",
                bytes[0],
                bytes[PACKET_LEN - 1]
            )));
        }

        let packet = Self { bytes };
        let expected = checksum(&packet.payload());
        if packet.checksum() != expected {
            return Err(ChairError::MalformedResponse(format!(
                "checksum {:02X} does not match computed {:02X}",
                packet.checksum(),
                expected
            )));
        }

        Ok(packet)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_LEN] {
        &self.bytes
    }

    pub fn device_id(&self) -> u8 {
        self.bytes[1]
    }

    pub fn sequence(&self) -> u8 {
        self.bytes[2]
    }

    pub fn command(&self) -> u8 {
        self.bytes[3]
    }

    pub fn data(&self) -> [u8; 3] {
        [self.bytes[4], self.bytes[5], self.bytes[6]]
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[7]
    }

    /// The six checksummed bytes (deviceId..data3).
    pub fn payload(&self) -> [u8; 6] {
        [
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
            self.bytes[4],
            self.bytes[5],
            self.bytes[6],
        ]
    }

    pub fn to_wire_frame(&self) -> WireFrame {
        WireFrame::encode(self)
    }

    /// Space separated hex, for logs.
    pub fn describe(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet[{}]", self.describe())
    }
}

/// The bytes actually written to the RX characteristic.
#[derive(Clone, PartialEq, Eq)]
pub struct WireFrame {
    bytes: [u8; FRAME_LEN],
}

impl WireFrame {
    pub fn encode(packet: &Packet) -> Self {
        let hex = hex::encode_upper(&packet.as_bytes()[1..PACKET_LEN - 1]);
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = STX;
        bytes[1..FRAME_LEN - 1].copy_from_slice(hex.as_bytes());
        bytes[FRAME_LEN - 1] = ETX;
        Self { bytes }
    }

    /// Reverse of [`WireFrame::encode`], validating the embedded packet.
    pub fn decode(frame: &[u8]) -> Result<Packet, ChairError> {
        if frame.len() != FRAME_LEN {
            return Err(ChairError::MalformedResponse(format!(
                "wire frame must be {} bytes, got {}",
                FRAME_LEN,
                frame.len()
            )));
        }
        if frame[0] != STX || frame[FRAME_LEN - 1] != ETX {
            return Err(ChairError::MalformedResponse(
                "wire frame is missing STX/ETX".to_string(),
            ));
        }

        let inner = hex::decode(&frame[1..FRAME_LEN - 1])
            .map_err(|e| ChairError::MalformedResponse(format!("bad hex in wire frame: {}", e)))?;

        let mut bytes = [0u8; PACKET_LEN];
        bytes[0] = STX;
        bytes[1..PACKET_LEN - 1].copy_from_slice(&inner);
        bytes[PACKET_LEN - 1] = ETX;
        Packet::parse(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for WireFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WireFrame").field(&self.to_string()).finish()
    }
}

impl fmt::Display for WireFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Markers are not printable; show them symbolically.
        let text = String::from_utf8_lossy(&self.bytes[1..FRAME_LEN - 1]);
        write!(f, "<STX>{}<ETX>", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_golden_vectors() {
        assert_eq!(checksum(&[0x70, 0xC3, 0x10, 0xF0, 0x00, 0x00]), 0xDA);
        assert_eq!(checksum(&[0x00; 6]), 0x0F);
        assert_eq!(checksum(&[0xFF; 6]), 0x10);
    }

    #[test]
    fn test_checksum_end_around_carry() {
        // 0x100 -> 0x01
        assert_eq!(checksum(&[0xFF, 0x01, 0, 0, 0, 0]), 0x0E);
        // 0x1FE -> 0xFF
        assert_eq!(checksum(&[0xFF, 0xFF, 0, 0, 0, 0]), 0x10);
        // 0x1FF -> 0x100 -> 0x01, folds twice
        assert_eq!(checksum(&[0xFF, 0xFF, 0x01, 0, 0, 0]), 0x0E);
    }

    #[test]
    fn test_build_packet_layout() {
        let packet = Packet::build(0x70, 0xC3, 0x10, 0xF0, 0x00, 0x00);
        assert_eq!(
            packet.as_bytes(),
            &[0x02, 0x70, 0xC3, 0x10, 0xF0, 0x00, 0x00, 0xDA, 0x03]
        );
        assert_eq!(packet.sequence(), 0xC3);
        assert_eq!(packet.command(), 0x10);
        assert_eq!(packet.data(), [0xF0, 0x00, 0x00]);
        assert_eq!(checksum(&packet.payload()), packet.checksum());
    }

    #[test]
    fn test_wire_frame_for_auto_on() {
        let frame = Packet::build(0x70, 0xC3, 0x10, 0xF0, 0x00, 0x00).to_wire_frame();
        let mut expected = vec![STX];
        expected.extend_from_slice(b"70C310F00000DA");
        expected.push(ETX);
        assert_eq!(frame.as_bytes(), expected.as_slice());
        assert_eq!(frame.to_string(), "<STX>70C310F00000DA<ETX>");
    }

    #[test]
    fn test_wire_frame_is_lossless_for_every_field_value() {
        let base = [0x70u8, 0xC3, 0x10, 0xF0, 0x00, 0x00];
        for field in 0..6 {
            for value in 0..=255u8 {
                let mut fields = base;
                fields[field] = value;
                let [a, b, c, d, e, f] = fields;
                let packet = Packet::build(a, b, c, d, e, f);
                let frame = packet.to_wire_frame();
                assert_eq!(frame.as_bytes().len(), FRAME_LEN);
                let decoded = hex::decode(&frame.as_bytes()[1..FRAME_LEN - 1]).unwrap();
                assert_eq!(decoded.as_slice(), &packet.as_bytes()[1..8]);
                assert_eq!(
                    WireFrame::decode(frame.as_bytes()).unwrap(),
                    packet,
                    "field {} = {:#04x}",
                    field,
                    value
                );
            }
        }
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut bytes = *Packet::build(0x70, 0x62, 0x20, 0xF0, 0, 0).as_bytes();
        bytes[7] ^= 0x01;
        assert!(matches!(
            Packet::parse(&bytes),
            Err(ChairError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_framing_and_length() {
        let mut bytes = *Packet::build(0x70, 0x62, 0x20, 0xF0, 0, 0).as_bytes();
        assert!(Packet::parse(&bytes[..8]).is_err());
        bytes[0] = 0x00;
        assert!(Packet::parse(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_non_hex_frame() {
        let mut frame = *b"\x0270C310F00000DA\x03";
        frame[3] = b'Z';
        assert!(WireFrame::decode(&frame).is_err());
    }

    #[test]
    fn test_describe() {
        let packet = Packet::build(0x70, 0, 0, 0, 0, 0);
        assert_eq!(packet.describe(), "02 70 00 00 00 00 00 9F 03");
    }
}

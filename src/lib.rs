//! Massage chair BLE control core.
//!
//! Talks to the chair's ESP32 controller through a serial-over-GATT bridge:
//! builds checksummed command packets, frames them as ASCII hex, reassembles
//! JSON notifications and drives the connection lifecycle.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ChairError, ErrorKind};

//! Bluetooth Module
//!
//! Provides BLE communication with the massage chair controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Connection state machine - one actor owns the session) │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┬──────────────┐
//!         │             │              │              │
//!         ▼             ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Fragments │  │ Protocol │
//! │           │  │            │  │ Response  │  │          │
//! │ - BLE     │  │ - Adapter  │  │ - JSON    │  │ - Packet │
//! │ discovery │  │ - GATT     │  │ reassembly│  │ - Frame  │
//! └───────────┘  └────────────┘  └───────────┘  └──────────┘
//!                       │
//!                       ▼
//!               BleTransport (btleplug)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Packet layout, checksum, ASCII-hex wire frame, UUIDs
//! - [`transport`] - The central-role operations the session needs
//! - [`btleplug_backend`] - [`transport::BleTransport`] on the host radio
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Adapter readiness, GATT resolution, write retry
//! - [`fragments`] - Notification fragment reassembly
//! - [`response`] - Chair message interpretation
//! - [`service`] - Main service coordinator

pub mod btleplug_backend;
pub mod connection;
pub mod fragments;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod response;
pub mod scanner;
pub mod service;
pub mod transport;

// Re-export main service for convenience
pub use service::BluetoothService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "massage_chair".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// The chair this app last connected to. Informational only; nothing
/// reconnects to it automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub last_connected: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE identity
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_char_uuid")]
    pub ble_rx_char_uuid: String,
    #[serde(default = "default_char_uuid")]
    pub ble_tx_char_uuid: String,
    #[serde(default = "default_fallback_services")]
    pub fallback_service_uuids: Vec<String>,
    #[serde(default = "default_fallback_chars")]
    pub fallback_char_uuids: Vec<String>,

    // Timing (milliseconds)
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_fragment_timeout_ms")]
    pub fragment_timeout_ms: u64,
    #[serde(default = "default_max_fragment_buffer")]
    pub max_fragment_buffer: usize,
    #[serde(default = "default_adapter_ready_timeout_ms")]
    pub adapter_ready_timeout_ms: u64,
    #[serde(default = "default_adapter_poll_interval_ms")]
    pub adapter_poll_interval_ms: u64,
    #[serde(default = "default_adapter_settle_ms")]
    pub adapter_settle_ms: u64,
    #[serde(default = "default_no_radio_after_polls")]
    pub no_radio_after_polls: u32,
    #[serde(default = "default_write_retry_wait_ms")]
    pub write_retry_wait_ms: u64,
    #[serde(default = "default_heartbeat_delay_ms")]
    pub heartbeat_delay_ms: u64,
    #[serde(default = "default_false")]
    pub heartbeat_periodic: bool,
    #[serde(default = "default_disconnect_debounce_ms")]
    pub disconnect_debounce_ms: u64,
    #[serde(default = "default_disconnect_ack_timeout_ms")]
    pub disconnect_ack_timeout_ms: u64,
    #[serde(default = "default_requested_mtu")]
    pub requested_mtu: u16,

    #[serde(default)]
    pub last_connected: Option<DeviceRecord>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_rx_char_uuid: default_char_uuid(),
            ble_tx_char_uuid: default_char_uuid(),
            fallback_service_uuids: default_fallback_services(),
            fallback_char_uuids: default_fallback_chars(),

            scan_timeout_ms: default_scan_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            fragment_timeout_ms: default_fragment_timeout_ms(),
            max_fragment_buffer: default_max_fragment_buffer(),
            adapter_ready_timeout_ms: default_adapter_ready_timeout_ms(),
            adapter_poll_interval_ms: default_adapter_poll_interval_ms(),
            adapter_settle_ms: default_adapter_settle_ms(),
            no_radio_after_polls: default_no_radio_after_polls(),
            write_retry_wait_ms: default_write_retry_wait_ms(),
            heartbeat_delay_ms: default_heartbeat_delay_ms(),
            heartbeat_periodic: false,
            disconnect_debounce_ms: default_disconnect_debounce_ms(),
            disconnect_ack_timeout_ms: default_disconnect_ack_timeout_ms(),
            requested_mtu: default_requested_mtu(),

            last_connected: None,
        }
    }
}

fn default_service_uuid() -> String {
    "0000ffe0-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_char_uuid() -> String {
    "0000ffe1-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_fallback_services() -> Vec<String> {
    vec![
        "0000ffe0-0000-1000-8000-00805f9b34fb".to_string(),
        "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
    ]
}
fn default_fallback_chars() -> Vec<String> {
    vec![
        "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
        "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
        "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
    ]
}
fn default_scan_timeout_ms() -> u64 {
    20_000
}
fn default_connection_timeout_ms() -> u64 {
    15_000
}
fn default_fragment_timeout_ms() -> u64 {
    5_000
}
fn default_max_fragment_buffer() -> usize {
    2000
}
fn default_adapter_ready_timeout_ms() -> u64 {
    15_000
}
fn default_adapter_poll_interval_ms() -> u64 {
    500
}
fn default_adapter_settle_ms() -> u64 {
    1000
}
fn default_no_radio_after_polls() -> u32 {
    20
}
fn default_write_retry_wait_ms() -> u64 {
    5_000
}
fn default_heartbeat_delay_ms() -> u64 {
    5_000
}
fn default_disconnect_debounce_ms() -> u64 {
    500
}
fn default_disconnect_ack_timeout_ms() -> u64 {
    3_000
}
fn default_requested_mtu() -> u16 {
    512
}

/// Durable home of the last-connected device record.
pub trait DeviceRecordStore: Send + Sync {
    fn save_device(&mut self, record: DeviceRecord) -> anyhow::Result<()>;
    fn load_device(&self) -> Option<DeviceRecord>;
    fn clear_device(&mut self) -> anyhow::Result<()>;
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load (or default) settings stored at an explicit location.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MassageChairControl");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

impl DeviceRecordStore for SettingsService {
    fn save_device(&mut self, record: DeviceRecord) -> anyhow::Result<()> {
        self.settings.last_connected = Some(record);
        self.save()
    }

    fn load_device(&self) -> Option<DeviceRecord> {
        self.settings.last_connected.clone()
    }

    fn clear_device(&mut self) -> anyhow::Result<()> {
        if self.settings.last_connected.take().is_some() {
            self.save()?;
        }
        Ok(())
    }
}

impl<T: DeviceRecordStore> DeviceRecordStore for Arc<Mutex<T>> {
    fn save_device(&mut self, record: DeviceRecord) -> anyhow::Result<()> {
        self.lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .save_device(record)
    }

    fn load_device(&self) -> Option<DeviceRecord> {
        self.lock().ok().and_then(|store| store.load_device())
    }

    fn clear_device(&mut self) -> anyhow::Result<()> {
        self.lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .clear_device()
    }
}

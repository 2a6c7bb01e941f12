use anyhow::Context;
use clap::Parser;
use massage_chair_control::domain::intent::Intent;
use massage_chair_control::domain::models::{AppEvent, BluetoothCommand, MessageSeverity};
use massage_chair_control::domain::pairing::PairingPayload;
use massage_chair_control::domain::settings::{DeviceRecordStore, SettingsService};
use massage_chair_control::domain::state::{StoreEvents, SystemStore};
use massage_chair_control::infrastructure::bluetooth::btleplug_backend::BtleplugBackend;
use massage_chair_control::infrastructure::bluetooth::connection::ConnectionConfig;
use massage_chair_control::infrastructure::bluetooth::BluetoothService;
use massage_chair_control::infrastructure::logging::init_logger;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Control a massage chair over Bluetooth LE.
///
/// After startup, type intents such as `MODE:AUTO`, `KNEADING:ON`,
/// `INTENSITY:2`, `STATUS` or `DISCONNECT`, one per line. `quit` exits.
#[derive(Debug, Parser)]
#[command(name = "massage-chair-control", version)]
struct Args {
    /// Scan for chairs for this many seconds before anything else
    #[arg(long, value_name = "SECS")]
    scan_secs: Option<u64>,

    /// Connect to the device with this id
    #[arg(long, value_name = "ID", conflicts_with_all = ["last", "pair"])]
    connect: Option<String>,

    /// Connect to the last device this app connected to
    #[arg(long, conflicts_with = "pair")]
    last: bool,

    /// Connect using the JSON payload of the chair's pairing QR code
    #[arg(long, value_name = "QR-JSON")]
    pair: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = SettingsService::new().context("Failed to load settings")?;
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting Massage Chair Control");

    let mut config = ConnectionConfig::from(settings.get());
    let last_device = settings.load_device();

    let target = match (&args.connect, args.last, &args.pair) {
        (Some(id), _, _) => Some(id.clone()),
        (None, true, _) => match &last_device {
            Some(record) => {
                info!(
                    "Last device: {} ({}), seen {}",
                    record.name, record.id, record.last_connected
                );
                Some(record.id.clone())
            }
            None => anyhow::bail!("No device has been connected yet"),
        },
        (None, false, Some(qr)) => {
            let payload = PairingPayload::parse(qr)?;
            if let Some(code) = &payload.pair_code {
                info!("Pair code for the system dialog: {}", code);
            }
            if !config.fallback_service_uuids.contains(&payload.service_uuid) {
                config.fallback_service_uuids.insert(0, payload.service_uuid);
            }
            Some(payload.mac)
        }
        (None, false, None) => None,
    };

    let transport = Arc::new(BtleplugBackend::new().await?);
    let store = Arc::new(SystemStore::new());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let events = Arc::new(StoreEvents::new(store.clone(), event_tx));
    let records = Arc::new(Mutex::new(settings));

    let service = BluetoothService::new(
        transport,
        config,
        store.subscribe(),
        events,
        Box::new(records),
    );

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let actor = tokio::spawn(service.run(command_rx));

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    if let Some(secs) = args.scan_secs {
        command_tx.send(BluetoothCommand::StartScan)?;
        tokio::time::sleep(Duration::from_secs(secs)).await;
        command_tx.send(BluetoothCommand::StopScan)?;
    }
    if let Some(id) = target {
        command_tx.send(BluetoothCommand::Connect(id))?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match line.to_ascii_lowercase().as_str() {
            "quit" | "exit" => break,
            "scan" => BluetoothCommand::StartScan,
            "stop" => BluetoothCommand::StopScan,
            _ => match line.parse::<Intent>() {
                Ok(intent) => BluetoothCommand::Dispatch(intent),
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            },
        };
        command_tx.send(command)?;
    }

    command_tx.send(BluetoothCommand::Shutdown)?;
    actor.await?;
    info!("Application shut down");
    Ok(())
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::ScanResult(device) => match device.rssi {
            Some(rssi) => println!("found  {}  {}  ({} dBm)", device.id, device.name, rssi),
            None => println!("found  {}  {}", device.id, device.name),
        },
        AppEvent::ConnectionStatus(status) => println!("status {:?}", status),
        AppEvent::SettingsUpdate(settings) => match serde_json::to_string(settings) {
            Ok(json) => println!("chair  {}", json),
            Err(_) => println!("chair  {:?}", settings),
        },
        AppEvent::ConnectionError { kind, message } => println!("error  [{:?}] {}", kind, message),
        AppEvent::DeviceError(message) => println!("chair error  {}", message),
        AppEvent::LogMessage(message) => {
            let tag = match message.severity {
                MessageSeverity::Info => "info ",
                MessageSeverity::Success => "ok   ",
                MessageSeverity::Warning => "warn ",
                MessageSeverity::Error => "fail ",
            };
            println!("{}  {}", tag, message.message);
        }
        other => println!("event  {:?}", other),
    }
}

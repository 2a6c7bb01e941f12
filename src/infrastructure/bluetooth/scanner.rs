//! BLE Scanner Module
//!
//! Unfiltered discovery. Advertisements are forwarded to the owning session,
//! which folds them into the registry through [`BleScanner::on_advertisement`].

use crate::domain::models::{AppEvent, EventSink, MessageSeverity, ScannedDevice};
use crate::error::ChairError;
use crate::infrastructure::bluetooth::transport::{BleTransport, DiscoveredPeripheral};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Placeholder some stacks report for nameless devices.
const UNKNOWN_DEVICE_NAME: &str = "unknown device";

#[derive(Debug)]
pub enum ScanEvent {
    Advertisement(DiscoveredPeripheral),
    TimedOut,
}

/// BLE Scanner for discovering massage chairs
pub struct BleScanner {
    transport: Arc<dyn BleTransport>,
    events: Arc<dyn EventSink>,
    registry: HashMap<String, ScannedDevice>,
    pump: Option<JoinHandle<()>>,
    /// Events of the current scan only; every start gets a new channel.
    event_rx: Option<mpsc::UnboundedReceiver<ScanEvent>>,
}

impl BleScanner {
    pub fn new(transport: Arc<dyn BleTransport>, events: Arc<dyn EventSink>) -> Self {
        Self {
            transport,
            events,
            registry: HashMap::new(),
            pump: None,
            event_rx: None,
        }
    }

    /// Start a fresh scan that stops on its own after `timeout`.
    pub async fn start(&mut self, timeout: Duration) -> Result<(), ChairError> {
        self.stop().await;
        self.registry.clear();

        info!("Starting BLE scan ({:?})", timeout);
        self.events.log("Scanning for massage chairs...", MessageSeverity::Info);

        let mut advertisements = self.transport.start_scan().await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.event_rx = Some(receiver);
        let deadline = Instant::now() + timeout;

        self.pump = Some(tokio::spawn(async move {
            loop {
                match timeout_at(deadline, advertisements.recv()).await {
                    Ok(Some(peripheral)) => {
                        if sender.send(ScanEvent::Advertisement(peripheral)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let _ = sender.send(ScanEvent::TimedOut);
                        break;
                    }
                }
            }
        }));

        self.events.emit(AppEvent::ScanningChanged(true));
        Ok(())
    }

    /// Stop scanning. Safe to call when idle.
    pub async fn stop(&mut self) {
        self.event_rx = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            info!("Stopping BLE scan ({} devices found)", self.registry.len());
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan cleanly: {}", e);
            }
            self.events.log("Scan stopped.", MessageSeverity::Info);
            self.events.emit(AppEvent::ScanningChanged(false));
        }
    }

    /// Next advertisement or timeout from the running scan. Pends while no
    /// scan has anything left to report.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        if let Some(receiver) = self.event_rx.as_mut() {
            if let Some(event) = receiver.recv().await {
                return Some(event);
            }
            self.event_rx = None;
        }
        std::future::pending().await
    }

    /// Fold one advertisement into the registry. Returns the device when it
    /// is reported for the first time.
    pub fn on_advertisement(&mut self, peripheral: DiscoveredPeripheral) -> Option<ScannedDevice> {
        if !self.is_scanning() {
            return None;
        }

        let name = match peripheral.name.as_deref().map(str::trim) {
            Some(name) if is_displayable_name(name) => name.to_string(),
            _ => {
                debug!("Skipping unnamed device {}", peripheral.id);
                return None;
            }
        };

        if let Some(known) = self.registry.get_mut(&peripheral.id) {
            known.rssi = peripheral.rssi.or(known.rssi);
            return None;
        }

        let device = ScannedDevice {
            id: peripheral.id.clone(),
            name,
            rssi: peripheral.rssi,
        };
        info!("Found device: {} ({})", device.name, device.id);
        self.registry.insert(peripheral.id, device.clone());
        self.events.emit(AppEvent::ScanResult(device.clone()));
        Some(device)
    }

    pub fn is_scanning(&self) -> bool {
        self.pump.is_some()
    }

    pub fn get(&self, id: &str) -> Option<&ScannedDevice> {
        self.registry.get(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn clear(&mut self) {
        self.registry.clear();
    }
}

fn is_displayable_name(name: &str) -> bool {
    !name.is_empty() && !name.eq_ignore_ascii_case(UNKNOWN_DEVICE_NAME)
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let transport = self.transport.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = transport.stop_scan().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{advertisement, MockTransport};

    fn scanner(transport: Arc<MockTransport>) -> (BleScanner, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BleScanner::new(transport, Arc::new(tx)), rx)
    }

    async fn drain(scanner: &mut BleScanner) -> Vec<ScannedDevice> {
        let mut reported = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), scanner.next_event()).await
        {
            match event {
                ScanEvent::Advertisement(p) => reported.extend(scanner.on_advertisement(p)),
                ScanEvent::TimedOut => break,
            }
        }
        reported
    }

    #[tokio::test]
    async fn test_unnamed_devices_are_filtered() {
        let transport = Arc::new(MockTransport::new().with_advertisements(vec![
            advertisement("a", Some("")),
            advertisement("b", Some("Unknown Device")),
            advertisement("c", None),
            advertisement("d", Some("UNKNOWN DEVICE")),
            advertisement("e", Some("Chair-01")),
        ]));
        let (mut scanner, _events) = scanner(transport);
        scanner.start(Duration::from_secs(5)).await.unwrap();

        let reported = drain(&mut scanner).await;
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].name, "Chair-01");
        assert_eq!(scanner.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_reported_once() {
        let transport = Arc::new(MockTransport::new().with_advertisements(vec![
            advertisement("e", Some("Chair-01")),
            advertisement("e", Some("Chair-01")),
            advertisement("f", Some("Chair-02")),
        ]));
        let (mut scanner, mut events) = scanner(transport);
        scanner.start(Duration::from_secs(5)).await.unwrap();
        assert_eq!(drain(&mut scanner).await.len(), 2);

        let mut results = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AppEvent::ScanResult(_)) {
                results += 1;
            }
        }
        assert_eq!(results, 2);
    }

    #[tokio::test]
    async fn test_restart_clears_registry() {
        let transport = Arc::new(
            MockTransport::new().with_advertisements(vec![advertisement("e", Some("Chair-01"))]),
        );
        let (mut scanner, _events) = scanner(transport.clone());
        scanner.start(Duration::from_secs(5)).await.unwrap();
        drain(&mut scanner).await;
        assert_eq!(scanner.len(), 1);

        scanner.start(Duration::from_secs(5)).await.unwrap();
        assert!(scanner.is_empty());
        assert_eq!(transport.scan_stops(), 1);
    }

    #[tokio::test]
    async fn test_restart_drops_events_of_previous_scan() {
        let transport = Arc::new(
            MockTransport::new().with_advertisements(vec![advertisement("e", Some("Chair-01"))]),
        );
        let (mut scanner, _events) = scanner(transport.clone());
        scanner.start(Duration::from_millis(20)).await.unwrap();
        // Let the first scan queue its advertisement and its timeout.
        tokio::time::sleep(Duration::from_millis(40)).await;

        scanner.start(Duration::from_secs(5)).await.unwrap();
        assert!(transport.advertise(advertisement("f", Some("Chair-02"))));

        let first = tokio::time::timeout(Duration::from_millis(100), scanner.next_event())
            .await
            .unwrap();
        match first {
            Some(ScanEvent::Advertisement(p)) => assert_eq!(p.id, "e"),
            other => panic!("unexpected {:?}", other),
        }
        let second = tokio::time::timeout(Duration::from_millis(100), scanner.next_event())
            .await
            .unwrap();
        match second {
            Some(ScanEvent::Advertisement(p)) => assert_eq!(p.id, "f"),
            other => panic!("unexpected {:?}", other),
        }
        // The old scan's timeout never surfaces in the new one.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), scanner.next_event())
                .await
                .is_err()
        );
        assert!(scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_times_out() {
        let transport = Arc::new(MockTransport::new());
        let (mut scanner, _events) = scanner(transport);
        scanner.start(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(scanner.next_event().await, Some(ScanEvent::TimedOut)));
    }

    #[tokio::test]
    async fn test_advertisement_after_stop_is_ignored() {
        let transport = Arc::new(MockTransport::new());
        let (mut scanner, _events) = scanner(transport);
        scanner.start(Duration::from_secs(5)).await.unwrap();
        scanner.stop().await;
        assert!(scanner
            .on_advertisement(advertisement("e", Some("Chair-01")))
            .is_none());
        assert!(!scanner.is_scanning());
    }
}

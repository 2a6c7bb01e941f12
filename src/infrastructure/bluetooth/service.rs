//! Bluetooth Service Module
//!
//! Connection State Machine. One [`BluetoothService`] owns the session: the
//! discovered-device registry, the link to the connected chair, the fragment
//! buffer and the heartbeat. [`BluetoothService::run`] drives it as a single
//! actor, so every mutation happens on one task.

use crate::domain::commands::CommandTable;
use crate::domain::dispatcher::{CommandDispatcher, PacketSink};
use crate::domain::intent::Intent;
use crate::domain::models::{
    AdapterState, AppEvent, BluetoothCommand, ConnectionStatus, EventSink, MessageSeverity,
};
use crate::domain::settings::{DeviceRecord, DeviceRecordStore};
use crate::domain::state::SystemStateReader;
use crate::error::ChairError;
use crate::infrastructure::bluetooth::connection::{
    resolve_characteristics, wait_for_adapter, write_with_retry, ConnectionConfig, ResolvedGatt,
};
use crate::infrastructure::bluetooth::fragments::FragmentReassembler;
use crate::infrastructure::bluetooth::protocol::{Packet, WireFrame, DEFAULT_MTU, STX};
use crate::infrastructure::bluetooth::response;
use crate::infrastructure::bluetooth::scanner::{BleScanner, ScanEvent};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicRef, PeripheralInfo, TransportError,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disabled,
    Initializing,
    AdapterUnready,
    AdapterReady,
    Scanning,
    Connecting,
    Discovering,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Messages from the background tasks of a link, tagged with the
/// generation of the link that spawned them.
#[derive(Debug)]
enum LinkEvent {
    Notification { generation: u64, data: Vec<u8> },
    Disconnected { generation: u64 },
}

/// The connected chair and the tasks attached to it.
struct Link {
    generation: u64,
    device_id: String,
    name: String,
    gatt: ResolvedGatt,
    mtu: u16,
    notify_pump: Option<JoinHandle<()>>,
    disconnect_watcher: Option<JoinHandle<()>>,
    heartbeat_due: Option<Instant>,
}

impl Link {
    fn stop_notify_pump(&mut self) {
        if let Some(pump) = self.notify_pump.take() {
            pump.abort();
        }
    }

    fn remove_disconnect_watcher(&mut self) {
        if let Some(watcher) = self.disconnect_watcher.take() {
            watcher.abort();
        }
    }
}

struct ConnectionSession {
    state: ConnectionState,
    adapter_state: AdapterState,
    /// Set once the adapter proved to be missing; BLE operations then fail fast.
    no_radio: bool,
    link: Option<Link>,
    /// Bumped for every established link; events from older links are stale.
    generation: u64,
    reassembler: FragmentReassembler,
    disconnect_due: Option<Instant>,
}

/// Point-in-time view of the session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ConnectionState,
    pub adapter_state: AdapterState,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub service_uuid: Option<Uuid>,
    pub rx_char_uuid: Option<Uuid>,
    pub tx_char_uuid: Option<Uuid>,
    pub mtu: Option<u16>,
    pub scanning: bool,
    pub discovered_devices: usize,
    pub notifications_active: bool,
    pub buffered_fragment_bytes: usize,
}

/// Write path of the current link.
struct LinkWriter<'a> {
    transport: &'a dyn BleTransport,
    config: &'a ConnectionConfig,
    device_id: &'a str,
    gatt: ResolvedGatt,
}

#[async_trait]
impl<'a> PacketSink for LinkWriter<'a> {
    async fn send_packet(&self, packet: Packet) -> Result<(), ChairError> {
        let frame = packet.to_wire_frame();
        debug!(
            command = CommandTable::identify(&packet),
            packet = %packet.describe(),
            frame = %frame,
            "Sending packet"
        );
        write_with_retry(
            self.transport,
            self.config,
            self.device_id,
            &self.gatt.rx,
            self.gatt.write_kind(),
            frame.as_bytes(),
        )
        .await
    }
}

enum Step {
    Command(BluetoothCommand),
    Link(LinkEvent),
    Scan(ScanEvent),
    Timer,
    Closed,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    transport: Arc<dyn BleTransport>,
    config: ConnectionConfig,
    events: Arc<dyn EventSink>,
    records: Box<dyn DeviceRecordStore>,
    dispatcher: CommandDispatcher,
    scanner: BleScanner,
    session: ConnectionSession,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl BluetoothService {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: ConnectionConfig,
        state: impl SystemStateReader + 'static,
        events: Arc<dyn EventSink>,
        records: Box<dyn DeviceRecordStore>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let reassembler =
            FragmentReassembler::new(config.max_fragment_buffer, config.fragment_timeout);
        Self {
            scanner: BleScanner::new(transport.clone(), events.clone()),
            dispatcher: CommandDispatcher::new(state, events.clone()),
            transport,
            config,
            events,
            records,
            session: ConnectionSession {
                state: ConnectionState::Disabled,
                adapter_state: AdapterState::Unknown,
                no_radio: false,
                link: None,
                generation: 0,
                reassembler,
                disconnect_due: None,
            },
            link_tx,
            link_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.link.is_some()
    }

    /// The persisted last-connected device, if any.
    pub fn last_device(&self) -> Option<DeviceRecord> {
        self.records.load_device()
    }

    pub fn status_snapshot(&self) -> ServiceStatus {
        let link = self.session.link.as_ref();
        ServiceStatus {
            state: self.session.state,
            adapter_state: self.session.adapter_state,
            device_id: link.map(|l| l.device_id.clone()),
            device_name: link.map(|l| l.name.clone()),
            service_uuid: link.map(|l| l.gatt.service),
            rx_char_uuid: link.map(|l| l.gatt.rx.characteristic),
            tx_char_uuid: link.and_then(|l| l.gatt.tx.map(|c| c.characteristic)),
            mtu: link.map(|l| l.mtu),
            scanning: self.scanner.is_scanning(),
            discovered_devices: self.scanner.len(),
            notifications_active: link
                .and_then(|l| l.notify_pump.as_ref())
                .map(|pump| !pump.is_finished())
                .unwrap_or(false),
            buffered_fragment_bytes: self.session.reassembler.buffered_len(),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.session.state != state {
            debug!("Connection state {:?} -> {:?}", self.session.state, state);
            self.session.state = state;
        }
    }

    /// State to fall back to when no operation is running.
    fn idle_state(&self) -> ConnectionState {
        if self.session.link.is_some() {
            ConnectionState::Connected
        } else if self.session.adapter_state.is_ready() {
            ConnectionState::AdapterReady
        } else {
            ConnectionState::AdapterUnready
        }
    }

    fn report(&self, error: &ChairError) {
        match error {
            ChairError::InvalidMode { .. }
            | ChairError::UnsupportedMode { .. }
            | ChairError::InvalidIntensity(_) => warn!("{}", error),
            _ => error!("{}", error),
        }
        self.events.emit(AppEvent::ConnectionError {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.events.log(
            &format!("{} {}", error, error.remedy()),
            MessageSeverity::Error,
        );
    }

    /// Let the platform stack settle, then take a first look at the adapter.
    pub async fn initialize(&mut self) {
        self.set_state(ConnectionState::Initializing);
        sleep(self.config.adapter_settle).await;
        if let Err(e) = self.ensure_adapter().await {
            self.report(&e);
        }
    }

    async fn ensure_adapter(&mut self) -> Result<(), ChairError> {
        if self.session.no_radio {
            return Err(ChairError::NoRadio);
        }

        let result = wait_for_adapter(
            self.transport.as_ref(),
            &self.config,
            self.config.adapter_ready_timeout,
        )
        .await;

        match result {
            Ok(state) => {
                self.session.adapter_state = state;
                if self.session.link.is_none() {
                    self.set_state(ConnectionState::AdapterReady);
                }
                Ok(())
            }
            Err(e) => {
                match &e {
                    ChairError::AdapterUnready { state } => self.session.adapter_state = *state,
                    ChairError::AdapterTimeout { last_state } => {
                        self.session.adapter_state = *last_state
                    }
                    ChairError::NoRadio => {
                        self.session.no_radio = true;
                        self.session.adapter_state = AdapterState::Unknown;
                        self.events.log(
                            "No Bluetooth radio detected, continuing without BLE",
                            MessageSeverity::Warning,
                        );
                    }
                    _ => {}
                }
                if self.session.link.is_none() {
                    let state = if self.session.no_radio {
                        ConnectionState::Disabled
                    } else {
                        ConnectionState::AdapterUnready
                    };
                    self.set_state(state);
                }
                Err(e)
            }
        }
    }

    pub async fn start_scan(&mut self) -> Result<(), ChairError> {
        self.ensure_adapter().await?;
        self.scanner.start(self.config.scan_timeout).await?;
        if self.session.link.is_none() {
            self.set_state(ConnectionState::Scanning);
        }
        Ok(())
    }

    pub async fn stop_scan(&mut self) {
        self.scanner.stop().await;
        if self.session.state == ConnectionState::Scanning {
            let idle = self.idle_state();
            self.set_state(idle);
        }
    }

    async fn handle_scan_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Advertisement(peripheral) => {
                self.scanner.on_advertisement(peripheral);
            }
            ScanEvent::TimedOut => {
                info!("Scan timeout reached");
                self.stop_scan().await;
            }
        }
    }

    /// Connect to `device_id`, replacing any current link.
    pub async fn connect(&mut self, device_id: &str) -> Result<(), ChairError> {
        let current = self
            .session
            .link
            .as_ref()
            .map(|link| (link.device_id.clone(), link.generation));
        if let Some((current_id, generation)) = current {
            if current_id != device_id {
                info!(
                    "Disconnecting {} before connecting to {}",
                    current_id, device_id
                );
                self.safe_disconnect().await?;
            } else {
                match self.transport.is_connected(device_id).await {
                    Ok(false) => {
                        warn!("Link to {} is gone, reconnecting", device_id);
                        self.handle_unexpected_disconnect(generation).await;
                    }
                    Ok(true) => {
                        info!("Already connected to {}", device_id);
                        return Ok(());
                    }
                    Err(e) => {
                        debug!("Could not confirm link to {}: {}", device_id, e);
                        return Ok(());
                    }
                }
            }
        }

        self.stop_scan().await;
        self.ensure_adapter().await?;

        info!("Connecting to {}", device_id);
        self.set_state(ConnectionState::Connecting);
        self.events
            .emit(AppEvent::ConnectionStatus(ConnectionStatus::Connecting));
        self.events.log("Connecting to device...", MessageSeverity::Info);

        let limit = self.config.connection_timeout;
        let (peripheral, gatt) = match timeout(limit, self.open_link(device_id)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.abort_connect(device_id).await;
                return Err(e);
            }
            Err(_) => {
                self.abort_connect(device_id).await;
                return Err(ChairError::ConnectionTimeout(limit));
            }
        };

        self.finish_connect(peripheral, gatt).await;
        Ok(())
    }

    async fn open_link(
        &mut self,
        device_id: &str,
    ) -> Result<(PeripheralInfo, ResolvedGatt), ChairError> {
        let peripheral = self.transport.connect(device_id).await?;
        self.set_state(ConnectionState::Discovering);

        let services = self.transport.discover_services(device_id).await?;
        debug!(
            "Discovered services: {:?}",
            services.iter().map(|s| s.uuid).collect::<Vec<_>>()
        );
        let gatt = resolve_characteristics(&services, &self.config)?;
        Ok((peripheral, gatt))
    }

    async fn abort_connect(&mut self, device_id: &str) {
        if let Err(e) = self.transport.cancel_connection(device_id).await {
            debug!("Cancel after failed connect: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        self.events
            .emit(AppEvent::ConnectionStatus(ConnectionStatus::Error));
    }

    async fn finish_connect(&mut self, peripheral: PeripheralInfo, gatt: ResolvedGatt) {
        let device_id = peripheral.id.clone();
        info!(
            service = %gatt.service,
            rx = %gatt.rx.characteristic,
            tx = ?gatt.tx.map(|c| c.characteristic),
            "Chair characteristics resolved"
        );

        let mtu = match self
            .transport
            .request_mtu(&device_id, self.config.requested_mtu)
            .await
        {
            Ok(mtu) => {
                info!("MTU negotiated: {}", mtu);
                mtu
            }
            Err(TransportError::Unsupported) => {
                debug!("MTU request not supported, using default {}", DEFAULT_MTU);
                DEFAULT_MTU
            }
            Err(e) => {
                warn!("MTU request failed ({}), using default {}", e, DEFAULT_MTU);
                DEFAULT_MTU
            }
        };

        let name = peripheral
            .name
            .or_else(|| self.scanner.get(&device_id).map(|d| d.name.clone()))
            .unwrap_or_else(|| device_id.clone());

        let record = DeviceRecord {
            id: device_id.clone(),
            name: name.clone(),
            last_connected: Utc::now(),
        };
        if let Err(e) = self.records.save_device(record) {
            warn!("Failed to persist device record: {}", e);
        }

        self.session.generation += 1;
        let generation = self.session.generation;
        let disconnect_watcher = self.spawn_disconnect_watcher(&device_id, generation).await;

        self.session.reassembler.reset();
        let notify_pump = match gatt.tx {
            Some(tx) => self.start_notifications(&device_id, &tx, generation).await,
            None => None,
        };

        self.session.link = Some(Link {
            generation,
            device_id,
            name: name.clone(),
            gatt,
            mtu,
            notify_pump,
            disconnect_watcher,
            heartbeat_due: Some(Instant::now() + self.config.heartbeat_delay),
        });
        self.set_state(ConnectionState::Connected);
        self.events
            .emit(AppEvent::ConnectionStatus(ConnectionStatus::Connected));
        self.events
            .log(&format!("Connected to {}", name), MessageSeverity::Success);
    }

    async fn spawn_disconnect_watcher(
        &self,
        device_id: &str,
        generation: u64,
    ) -> Option<JoinHandle<()>> {
        match self.transport.disconnect_events(device_id).await {
            Ok(dropped) => {
                let sender = self.link_tx.clone();
                Some(tokio::spawn(async move {
                    if dropped.await.is_ok() {
                        let _ = sender.send(LinkEvent::Disconnected { generation });
                    }
                }))
            }
            Err(e) => {
                warn!("Could not watch for disconnects: {}", e);
                None
            }
        }
    }

    async fn start_notifications(
        &self,
        device_id: &str,
        tx: &CharacteristicRef,
        generation: u64,
    ) -> Option<JoinHandle<()>> {
        let subscribed = match self.transport.subscribe(device_id, tx).await {
            Err(TransportError::UnknownState) => {
                warn!("Subscribe hit an unsettled adapter, waiting before retry");
                if let Err(e) = wait_for_adapter(
                    self.transport.as_ref(),
                    &self.config,
                    self.config.write_retry_wait,
                )
                .await
                {
                    debug!("Adapter still not ready: {}", e);
                }
                self.transport.subscribe(device_id, tx).await
            }
            other => other,
        };

        match subscribed {
            Ok(mut notifications) => {
                info!("Notifications enabled on {}", tx.characteristic);
                let sender = self.link_tx.clone();
                let device_id = device_id.to_string();
                Some(tokio::spawn(async move {
                    while let Some(data) = notifications.recv().await {
                        let event = LinkEvent::Notification { generation, data };
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                    debug!("Notification stream for {} ended", device_id);
                }))
            }
            Err(e) => {
                warn!("Could not enable notifications: {}", e);
                self.events.log(
                    "Connected (device responses unavailable)",
                    MessageSeverity::Warning,
                );
                None
            }
        }
    }

    fn writer(&self) -> Result<LinkWriter<'_>, ChairError> {
        let link = self.session.link.as_ref().ok_or(ChairError::NotConnected)?;
        Ok(LinkWriter {
            transport: self.transport.as_ref(),
            config: &self.config,
            device_id: &link.device_id,
            gatt: link.gatt,
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .link
            .as_ref()
            .map(|l| l.generation == generation)
            .unwrap_or(false)
    }

    /// Run one control intent against the connected chair.
    pub async fn dispatch(&mut self, intent: Intent) -> Result<(), ChairError> {
        if intent == Intent::Disconnect {
            return self.safe_disconnect().await;
        }
        let writer = self.writer()?;
        self.dispatcher.run_intent(&writer, intent).await
    }

    async fn send_heartbeat(&mut self) {
        let next = self
            .config
            .heartbeat_periodic
            .then(|| Instant::now() + self.config.heartbeat_delay);
        if let Some(link) = self.session.link.as_mut() {
            link.heartbeat_due = next;
        }

        let result = match self.writer() {
            Ok(writer) => self.dispatcher.send_heartbeat(&writer, true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Heartbeat not delivered: {}", e);
        }
    }

    fn on_notification(&mut self, data: &[u8]) -> bool {
        if data.first() == Some(&STX) {
            if let Ok(packet) = WireFrame::decode(data) {
                debug!(
                    "Chair echoed {} ({})",
                    CommandTable::identify(&packet),
                    packet.describe()
                );
                self.events.emit(AppEvent::RawMessage(packet.describe()));
                return false;
            }
        }

        let text = String::from_utf8_lossy(data);
        trace!("Fragment received: {:?}", text);
        let Some(message) = self
            .session
            .reassembler
            .on_fragment(&text, std::time::Instant::now())
        else {
            return false;
        };

        let mut acknowledged = false;
        for event in response::interpret(message) {
            if matches!(event, AppEvent::DisconnectAcknowledged) {
                acknowledged = true;
            }
            self.events.emit(event);
        }
        acknowledged
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification { generation, data } => {
                if self.is_current(generation) {
                    self.on_notification(&data);
                } else {
                    trace!("Dropping notification from stale link #{}", generation);
                }
            }
            LinkEvent::Disconnected { generation } => {
                self.handle_unexpected_disconnect(generation).await;
            }
        }
    }

    /// Platform reported the link dropped. Idempotent; never fails.
    async fn handle_unexpected_disconnect(&mut self, generation: u64) {
        if !self.is_current(generation) || self.session.state == ConnectionState::Disconnecting {
            debug!("Ignoring disconnect callback from link #{}", generation);
            return;
        }

        self.session.reassembler.reset();
        self.session.disconnect_due = None;

        if let Some(mut link) = self.session.link.take() {
            warn!("Device {} disconnected unexpectedly", link.device_id);
            link.stop_notify_pump();
            if let Some(tx) = link.gatt.tx {
                if let Err(e) = self.transport.unsubscribe(&link.device_id, &tx).await {
                    debug!("Unsubscribe after link loss: {}", e);
                }
            }
            link.remove_disconnect_watcher();
        }

        self.set_state(ConnectionState::Disconnected);
        self.events
            .emit(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected));
        self.events.emit(AppEvent::SessionReset);
        self.events
            .log("Connection to the chair was lost", MessageSeverity::Warning);
    }

    /// Queue a graceful disconnect. Requests inside the debounce window
    /// collapse into one.
    pub fn request_disconnect(&mut self) {
        if self.session.disconnect_due.is_some() {
            debug!("Disconnect already pending");
            return;
        }
        self.session.disconnect_due = Some(Instant::now() + self.config.disconnect_debounce);
    }

    /// Graceful disconnect. Every step is best-effort; calling it again, or
    /// while not connected, is a no-op.
    pub async fn safe_disconnect(&mut self) -> Result<(), ChairError> {
        self.session.disconnect_due = None;
        if self.session.state == ConnectionState::Disconnecting {
            debug!("Disconnect already in progress");
            return Ok(());
        }
        let Some(device_id) = self.session.link.as_ref().map(|l| l.device_id.clone()) else {
            debug!("No device to disconnect");
            return Ok(());
        };

        info!("Disconnecting from {}", device_id);
        self.set_state(ConnectionState::Disconnecting);

        let sent = match self.writer() {
            Ok(writer) => self.dispatcher.send_disconnect(&writer).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => self.wait_for_disconnect_ack().await,
            Err(e) => debug!("DISCONNECT not delivered: {}", e),
        }

        if let Some(link) = self.session.link.as_mut() {
            link.heartbeat_due = None;
        }
        let stopped = match self.writer() {
            Ok(writer) => self.dispatcher.send_heartbeat(&writer, false).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stopped {
            debug!("Heartbeat stop not delivered: {}", e);
        }

        if let Some(mut link) = self.session.link.take() {
            if let Some(tx) = link.gatt.tx {
                if let Err(e) = self.transport.unsubscribe(&link.device_id, &tx).await {
                    debug!("Unsubscribe failed: {}", e);
                }
            }
            link.stop_notify_pump();

            match self.transport.cancel_connection(&link.device_id).await {
                Ok(()) => {}
                Err(TransportError::NotConnected) => debug!("Device was already disconnected"),
                Err(e) => warn!("Cancel connection failed: {}", e),
            }
            link.remove_disconnect_watcher();
        }

        if let Err(e) = self.records.clear_device() {
            warn!("Failed to clear device record: {}", e);
        }

        self.session.reassembler.reset();
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from {}", device_id);
        self.events
            .log("Disconnected from device", MessageSeverity::Info);
        self.events
            .emit(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected));
        self.events.emit(AppEvent::SessionReset);
        Ok(())
    }

    async fn wait_for_disconnect_ack(&mut self) {
        let deadline = Instant::now() + self.config.disconnect_ack_timeout;
        loop {
            match timeout_at(deadline, self.link_rx.recv()).await {
                Ok(Some(LinkEvent::Notification { generation, data })) => {
                    if self.is_current(generation) && self.on_notification(&data) {
                        debug!("DISCONNECT acknowledged");
                        return;
                    }
                }
                Ok(Some(LinkEvent::Disconnected { generation })) => {
                    if self.is_current(generation) {
                        debug!("Link dropped while waiting for DISCONNECT_ACK");
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    debug!(
                        "No DISCONNECT_ACK within {:?}",
                        self.config.disconnect_ack_timeout
                    );
                    return;
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let fragments = self
            .session
            .reassembler
            .deadline()
            .map(Instant::from_std);
        let heartbeat = self.session.link.as_ref().and_then(|l| l.heartbeat_due);
        [fragments, heartbeat, self.session.disconnect_due]
            .into_iter()
            .flatten()
            .min()
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        self.session.reassembler.expire(now.into_std());

        if self.session.disconnect_due.is_some_and(|due| due <= now) {
            if let Err(e) = self.safe_disconnect().await {
                self.report(&e);
            }
        }

        let heartbeat_due = self.session.link.as_ref().and_then(|l| l.heartbeat_due);
        if heartbeat_due.is_some_and(|due| due <= now) {
            self.send_heartbeat().await;
        }
    }

    async fn handle_command(&mut self, command: BluetoothCommand) {
        let result = match command {
            BluetoothCommand::StartScan => self.start_scan().await,
            BluetoothCommand::StopScan => {
                self.stop_scan().await;
                Ok(())
            }
            BluetoothCommand::Connect(device_id) => self.connect(&device_id).await,
            BluetoothCommand::Disconnect | BluetoothCommand::Dispatch(Intent::Disconnect) => {
                self.request_disconnect();
                Ok(())
            }
            BluetoothCommand::Dispatch(intent) => self.dispatch(intent).await,
            BluetoothCommand::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            self.report(&e);
        }
    }

    /// Drive the service until `Shutdown` arrives or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BluetoothCommand>) {
        self.initialize().await;

        loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                },
                Some(event) = self.link_rx.recv() => Step::Link(event),
                Some(event) = self.scanner.next_event() => Step::Scan(event),
                _ = sleep_until_deadline(deadline) => Step::Timer,
            };

            match step {
                Step::Command(BluetoothCommand::Shutdown) | Step::Closed => break,
                Step::Command(command) => self.handle_command(command).await,
                Step::Link(event) => self.handle_link_event(event).await,
                Step::Scan(event) => self.handle_scan_event(event).await,
                Step::Timer => self.on_timer().await,
            }
        }

        self.shutdown().await;
    }

    /// Teardown: stop scanning, drop background tasks and the link.
    pub async fn shutdown(&mut self) {
        info!("Shutting down Bluetooth service");
        self.scanner.stop().await;
        self.scanner.clear();
        self.session.disconnect_due = None;

        if let Some(mut link) = self.session.link.take() {
            link.stop_notify_pump();
            link.remove_disconnect_watcher();
            if let Err(e) = self.transport.cancel_connection(&link.device_id).await {
                debug!("Cancel during shutdown: {}", e);
            }
            self.events
                .emit(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected));
        }

        self.session.reassembler.reset();
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

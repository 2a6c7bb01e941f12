//! Command Dispatcher
//!
//! Turns control intents into command packets and enforces the chair's
//! mode rules before anything reaches the radio:
//!
//! - AUTO techniques and roll/spot selection require AUTO mode.
//! - Entering AUTO first releases both manual motors.
//! - Pressing a manual motor control while in AUTO only leaves AUTO; the
//!   motor itself moves on the next press. Sending both at once makes the
//!   rollers jump back to their home position.
//! - Intensity only applies to percussion, compression and combine.
//!
//! Callers serialize calls; two overlapping dispatches race on the link.

use crate::domain::commands::CommandTable;
use crate::domain::intent::{ChairAxis, Intent, RollSpot};
use crate::domain::models::{AppEvent, EventSink};
use crate::domain::state::{MassageTechnique, SystemMode, SystemStateReader};
use crate::error::ChairError;
use crate::infrastructure::bluetooth::protocol::Packet;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Destination for outgoing command packets.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_packet(&self, packet: Packet) -> Result<(), ChairError>;
}

pub struct CommandDispatcher {
    state: Box<dyn SystemStateReader>,
    events: Arc<dyn EventSink>,
}

impl CommandDispatcher {
    pub fn new(state: impl SystemStateReader + 'static, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Box::new(state),
            events,
        }
    }

    pub fn system_mode(&self) -> SystemMode {
        self.state.system_mode()
    }

    async fn send(&self, sink: &dyn PacketSink, name: &str) -> Result<(), ChairError> {
        let packet = CommandTable::packet(name)?;
        trace!(command = name, "Dispatching command");
        sink.send_packet(packet).await
    }

    fn require_auto(&self, command: &'static str) -> Result<SystemMode, ChairError> {
        let mode = self.state.system_mode();
        if !mode.is_auto_mode {
            warn!("{} ignored, chair is not in AUTO mode", command);
            return Err(ChairError::InvalidMode { command });
        }
        Ok(mode)
    }

    pub async fn set_auto_mode(&self, sink: &dyn PacketSink, enabled: bool) -> Result<(), ChairError> {
        if enabled {
            self.enable_auto_mode(sink).await
        } else {
            self.disable_auto_mode(sink).await
        }
    }

    pub async fn enable_auto_mode(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        // Both releases go out unconditionally, whatever the manual motors are doing.
        self.send(sink, "KNEADING_RELEASE").await?;
        self.send(sink, "PERCUSSION_RELEASE").await?;
        self.send(sink, "AUTO_ON").await?;
        info!("AUTO mode enabled");
        self.events.emit(AppEvent::AutoModeChanged(true));
        Ok(())
    }

    pub async fn disable_auto_mode(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.send(sink, "AUTO_OFF").await?;
        info!("AUTO mode disabled");
        self.events.emit(AppEvent::AutoModeChanged(false));
        Ok(())
    }

    pub async fn enable_roll(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.require_auto("ROLL_ON")?;
        self.send(sink, "ROLL_ON").await
    }

    pub async fn enable_spot(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.require_auto("SPOT_ON")?;
        self.send(sink, "SPOT_ON").await
    }

    pub async fn disable_roll(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.send(sink, "ROLL_OFF").await
    }

    /// Select an AUTO technique, or stop the massage when `on` is false.
    pub async fn set_technique(
        &self,
        sink: &dyn PacketSink,
        technique: MassageTechnique,
        on: bool,
    ) -> Result<(), ChairError> {
        let command = match technique {
            MassageTechnique::Kneading => "KNEADING_ON",
            MassageTechnique::Combine => "COMBINE_ON",
            MassageTechnique::Percussion => "PERCUSSION_ON",
            MassageTechnique::Compression => "COMPRESSION_ON",
            MassageTechnique::None => return Err(ChairError::UnsupportedMode { technique }),
        };

        if !on {
            return self.stop_massage(sink).await;
        }

        self.require_auto(command)?;
        self.send(sink, command).await?;
        self.events.emit(AppEvent::TechniqueChanged(technique));
        Ok(())
    }

    pub async fn stop_massage(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.events
            .emit(AppEvent::TechniqueChanged(MassageTechnique::None));
        self.send(sink, "ROLL_OFF").await
    }

    /// Levels 1 and 2 currently encode to the same packet.
    pub async fn set_intensity(&self, sink: &dyn PacketSink, level: u8) -> Result<(), ChairError> {
        let technique = self.state.system_mode().technique;
        if !technique.supports_intensity() {
            warn!("INTENSITY ignored, technique is {:?}", technique);
            return Err(ChairError::UnsupportedMode { technique });
        }
        let command = match level {
            1 => "INTENSITY_DOWN",
            2 => "INTENSITY_UP",
            other => return Err(ChairError::InvalidIntensity(other)),
        };
        self.send(sink, command).await
    }

    pub async fn control_axis(
        &self,
        sink: &dyn PacketSink,
        axis: ChairAxis,
        pressed: bool,
    ) -> Result<(), ChairError> {
        let command = match (axis, pressed) {
            (ChairAxis::Recline, true) => "RECLINE_PUSH",
            (ChairAxis::Recline, false) => "RECLINE_RELEASE",
            (ChairAxis::Incline, true) => "INCLINE_PUSH",
            (ChairAxis::Incline, false) => "INCLINE_RELEASE",
            (ChairAxis::Forward, true) => "FORWARD_PUSH",
            (ChairAxis::Forward, false) => "FORWARD_RELEASE",
            (ChairAxis::Backward, true) => "BACKWARD_PUSH",
            (ChairAxis::Backward, false) => "BACKWARD_RELEASE",
        };
        self.send(sink, command).await
    }

    pub async fn control_recline(&self, sink: &dyn PacketSink, pressed: bool) -> Result<(), ChairError> {
        self.control_axis(sink, ChairAxis::Recline, pressed).await
    }

    pub async fn control_incline(&self, sink: &dyn PacketSink, pressed: bool) -> Result<(), ChairError> {
        self.control_axis(sink, ChairAxis::Incline, pressed).await
    }

    pub async fn control_forward(&self, sink: &dyn PacketSink, pressed: bool) -> Result<(), ChairError> {
        self.control_axis(sink, ChairAxis::Forward, pressed).await
    }

    pub async fn control_backward(&self, sink: &dyn PacketSink, pressed: bool) -> Result<(), ChairError> {
        self.control_axis(sink, ChairAxis::Backward, pressed).await
    }

    /// Shared rule for manual motor controls: an activation while in AUTO
    /// only leaves AUTO and reports whether the motor command was suppressed.
    async fn leave_auto_on_activation(
        &self,
        sink: &dyn PacketSink,
        active: bool,
        command: &str,
    ) -> Result<bool, ChairError> {
        if active && self.state.system_mode().is_auto_mode {
            info!("{} pressed in AUTO mode, switching to MANUAL only", command);
            self.disable_auto_mode(sink).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn control_roll_up(&self, sink: &dyn PacketSink, pressed: bool) -> Result<(), ChairError> {
        if self
            .leave_auto_on_activation(sink, pressed, "ROLL_UP_PUSH")
            .await?
        {
            return Ok(());
        }
        let command = if pressed { "ROLL_UP_PUSH" } else { "ROLL_UP_RELEASE" };
        self.send(sink, command).await
    }

    pub async fn control_roll_down(&self, sink: &dyn PacketSink, pressed: bool) -> Result<(), ChairError> {
        if self
            .leave_auto_on_activation(sink, pressed, "ROLL_DOWN_PUSH")
            .await?
        {
            return Ok(());
        }
        let command = if pressed { "ROLL_DOWN_PUSH" } else { "ROLL_DOWN_RELEASE" };
        self.send(sink, command).await
    }

    pub async fn control_kneading(&self, sink: &dyn PacketSink, on: bool) -> Result<(), ChairError> {
        if self.leave_auto_on_activation(sink, on, "KNEADING_PUSH").await? {
            return Ok(());
        }
        let command = if on { "KNEADING_PUSH" } else { "KNEADING_RELEASE" };
        self.send(sink, command).await
    }

    pub async fn control_percussion(&self, sink: &dyn PacketSink, on: bool) -> Result<(), ChairError> {
        if self
            .leave_auto_on_activation(sink, on, "PERCUSSION_PUSH")
            .await?
        {
            return Ok(());
        }
        let command = if on { "PERCUSSION_PUSH" } else { "PERCUSSION_RELEASE" };
        self.send(sink, command).await
    }

    pub async fn request_status(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.send(sink, "STATUS_REQUEST").await
    }

    /// Tell the chair the session is ending. Tearing down the link is the
    /// connection's job.
    pub async fn send_disconnect(&self, sink: &dyn PacketSink) -> Result<(), ChairError> {
        self.send(sink, "DISCONNECT").await
    }

    pub async fn send_heartbeat(&self, sink: &dyn PacketSink, start: bool) -> Result<(), ChairError> {
        let command = if start { "HEARTBEAT_START" } else { "HEARTBEAT_STOP" };
        self.send(sink, command).await
    }

    pub async fn run_intent(&self, sink: &dyn PacketSink, intent: Intent) -> Result<(), ChairError> {
        match intent {
            Intent::SetAutoMode(enabled) => self.set_auto_mode(sink, enabled).await,
            Intent::Axis { axis, pressed } => self.control_axis(sink, axis, pressed).await,
            Intent::RollUp(pressed) => self.control_roll_up(sink, pressed).await,
            Intent::RollDown(pressed) => self.control_roll_down(sink, pressed).await,
            Intent::ManualKneading(on) => self.control_kneading(sink, on).await,
            Intent::ManualPercussion(on) => self.control_percussion(sink, on).await,
            Intent::RollSpot(RollSpot::Roll) => self.enable_roll(sink).await,
            Intent::RollSpot(RollSpot::Spot) => self.enable_spot(sink).await,
            Intent::RollSpot(RollSpot::Off) => self.disable_roll(sink).await,
            Intent::Technique { technique, on } => self.set_technique(sink, technique, on).await,
            Intent::Intensity(level) => self.set_intensity(sink, level).await,
            Intent::RequestStatus => self.request_status(sink).await,
            Intent::Disconnect => self.send_disconnect(sink).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state::{StoreEvents, SystemStore};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Packet>>,
    }

    impl RecordingSink {
        fn names(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(CommandTable::identify)
                .collect()
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send_packet(&self, packet: Packet) -> Result<(), ChairError> {
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<SystemStore>,
        dispatcher: CommandDispatcher,
        sink: RecordingSink,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn fixture(mode: SystemMode) -> Fixture {
        let store = Arc::new(SystemStore::new());
        store.apply(&AppEvent::AutoModeChanged(mode.is_auto_mode));
        store.apply(&AppEvent::TechniqueChanged(mode.technique));
        let (tx, events) = mpsc::unbounded_channel();
        let dispatcher = CommandDispatcher::new(
            store.subscribe(),
            Arc::new(StoreEvents::new(store.clone(), tx)),
        );
        Fixture {
            store,
            dispatcher,
            sink: RecordingSink::default(),
            events,
        }
    }

    fn manual() -> SystemMode {
        SystemMode::default()
    }

    fn auto(technique: MassageTechnique) -> SystemMode {
        SystemMode {
            is_auto_mode: true,
            technique,
        }
    }

    #[tokio::test]
    async fn test_technique_in_manual_is_rejected_without_sending() {
        let f = fixture(manual());
        let result = f
            .dispatcher
            .set_technique(&f.sink, MassageTechnique::Kneading, true)
            .await;
        assert!(matches!(result, Err(ChairError::InvalidMode { command: "KNEADING_ON" })));
        assert_eq!(f.sink.count(), 0);
    }

    #[tokio::test]
    async fn test_roll_and_spot_require_auto() {
        let f = fixture(manual());
        assert!(f.dispatcher.enable_roll(&f.sink).await.is_err());
        assert!(f.dispatcher.enable_spot(&f.sink).await.is_err());
        assert_eq!(f.sink.count(), 0);

        let f = fixture(auto(MassageTechnique::None));
        f.dispatcher.enable_roll(&f.sink).await.unwrap();
        assert_eq!(f.sink.names(), vec!["ROLL_ON"]);
    }

    #[tokio::test]
    async fn test_enable_auto_releases_manual_motors_first() {
        let mut f = fixture(manual());
        f.dispatcher.enable_auto_mode(&f.sink).await.unwrap();
        assert_eq!(
            f.sink.names(),
            vec!["KNEADING_RELEASE", "PERCUSSION_RELEASE", "AUTO_ON"]
        );
        assert!(f.store.current().is_auto_mode);
        assert!(matches!(
            f.events.try_recv(),
            Ok(AppEvent::AutoModeChanged(true))
        ));
    }

    #[tokio::test]
    async fn test_roll_up_press_in_auto_only_leaves_auto() {
        let f = fixture(auto(MassageTechnique::Kneading));
        f.dispatcher.control_roll_up(&f.sink, true).await.unwrap();
        assert_eq!(f.sink.names(), vec!["AUTO_OFF"]);
        assert_eq!(f.store.current(), SystemMode::default());

        // Second press moves the motor.
        f.dispatcher.control_roll_up(&f.sink, true).await.unwrap();
        f.dispatcher.control_roll_up(&f.sink, false).await.unwrap();
        assert_eq!(
            f.sink.names(),
            vec!["AUTO_OFF", "ROLL_UP_PUSH", "ROLL_UP_RELEASE"]
        );
    }

    #[tokio::test]
    async fn test_release_in_auto_is_not_suppressed() {
        let f = fixture(auto(MassageTechnique::None));
        f.dispatcher.control_roll_down(&f.sink, false).await.unwrap();
        f.dispatcher.control_kneading(&f.sink, false).await.unwrap();
        assert_eq!(f.sink.names(), vec!["ROLL_DOWN_RELEASE", "KNEADING_RELEASE"]);
        assert!(f.store.current().is_auto_mode);
    }

    #[tokio::test]
    async fn test_manual_toggles_in_auto_and_manual() {
        let f = fixture(auto(MassageTechnique::None));
        f.dispatcher.control_percussion(&f.sink, true).await.unwrap();
        assert_eq!(f.sink.names(), vec!["AUTO_OFF"]);

        f.dispatcher.control_percussion(&f.sink, true).await.unwrap();
        f.dispatcher.control_kneading(&f.sink, true).await.unwrap();
        assert_eq!(
            f.sink.names(),
            vec!["AUTO_OFF", "PERCUSSION_PUSH", "KNEADING_PUSH"]
        );
    }

    #[tokio::test]
    async fn test_axis_push_and_release_ignore_mode() {
        for mode in [manual(), auto(MassageTechnique::Combine)] {
            let f = fixture(mode);
            f.dispatcher.control_recline(&f.sink, true).await.unwrap();
            f.dispatcher.control_recline(&f.sink, false).await.unwrap();
            f.dispatcher.control_backward(&f.sink, true).await.unwrap();
            assert_eq!(
                f.sink.names(),
                vec!["RECLINE_PUSH", "RECLINE_RELEASE", "BACKWARD_PUSH"]
            );
            assert_eq!(f.store.current(), mode);
        }
    }

    #[tokio::test]
    async fn test_intensity_requires_supported_technique() {
        let f = fixture(auto(MassageTechnique::Kneading));
        assert!(matches!(
            f.dispatcher.set_intensity(&f.sink, 1).await,
            Err(ChairError::UnsupportedMode {
                technique: MassageTechnique::Kneading
            })
        ));
        assert_eq!(f.sink.count(), 0);

        let f = fixture(auto(MassageTechnique::Percussion));
        f.dispatcher.set_intensity(&f.sink, 1).await.unwrap();
        f.dispatcher.set_intensity(&f.sink, 2).await.unwrap();
        let sent = f.sink.sent.lock().unwrap().clone();
        assert_eq!(sent[0], sent[1]);
        assert_eq!(sent[0].payload(), [0x70, 0x73, 0x70, 0x00, 0x00, 0x50]);
    }

    #[tokio::test]
    async fn test_invalid_intensity_level() {
        let f = fixture(auto(MassageTechnique::Compression));
        assert!(matches!(
            f.dispatcher.set_intensity(&f.sink, 3).await,
            Err(ChairError::InvalidIntensity(3))
        ));
        assert_eq!(f.sink.count(), 0);
    }

    #[tokio::test]
    async fn test_technique_selection_and_stop() {
        let f = fixture(auto(MassageTechnique::None));
        f.dispatcher
            .set_technique(&f.sink, MassageTechnique::Compression, true)
            .await
            .unwrap();
        assert_eq!(f.store.current().technique, MassageTechnique::Compression);

        f.dispatcher
            .set_technique(&f.sink, MassageTechnique::Compression, false)
            .await
            .unwrap();
        assert_eq!(f.store.current().technique, MassageTechnique::None);
        assert_eq!(f.sink.names(), vec!["COMPRESSION_ON", "ROLL_OFF"]);
    }

    #[tokio::test]
    async fn test_disable_auto_clears_technique() {
        let f = fixture(auto(MassageTechnique::Percussion));
        f.dispatcher.disable_auto_mode(&f.sink).await.unwrap();
        assert_eq!(f.store.current(), SystemMode::default());
        assert_eq!(f.sink.names(), vec!["AUTO_OFF"]);
    }

    #[tokio::test]
    async fn test_run_intent_routes_to_operations() {
        let f = fixture(manual());
        for intent in ["MODE:AUTO", "ROLLSPOT:SPOT", "INTENSITY:1", "STATUS"] {
            let intent: Intent = intent.parse().unwrap();
            let _ = f.dispatcher.run_intent(&f.sink, intent).await;
        }
        // SPOT_ON is byte-identical to ROLL_OFF. INTENSITY fails: no technique selected.
        assert_eq!(
            f.sink.names(),
            vec![
                "KNEADING_RELEASE",
                "PERCUSSION_RELEASE",
                "AUTO_ON",
                "ROLL_OFF",
                "STATUS_REQUEST"
            ]
        );
    }

    #[tokio::test]
    async fn test_send_failure_skips_mode_write_back() {
        struct FailingSink;

        #[async_trait]
        impl PacketSink for FailingSink {
            async fn send_packet(&self, _packet: Packet) -> Result<(), ChairError> {
                Err(ChairError::NotConnected)
            }
        }

        let f = fixture(manual());
        assert!(f.dispatcher.enable_auto_mode(&FailingSink).await.is_err());
        assert!(!f.store.current().is_auto_mode);
    }
}

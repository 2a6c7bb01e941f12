//! Operating mode shared between the dispatcher and the state store.
//!
//! The store owns [`SystemMode`]; the dispatcher only reads it through
//! [`SystemStateReader`] and requests transitions by emitting events.

use crate::domain::models::{AppEvent, EventSink};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MassageTechnique {
    #[default]
    None,
    Kneading,
    Combine,
    Percussion,
    Compression,
}

impl MassageTechnique {
    /// Techniques whose strength can be adjusted.
    pub fn supports_intensity(&self) -> bool {
        matches!(self, Self::Percussion | Self::Compression | Self::Combine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SystemMode {
    pub is_auto_mode: bool,
    pub technique: MassageTechnique,
}

impl SystemMode {
    /// Fold an emitted event into the mode. Returns true when it changed.
    pub fn apply(&mut self, event: &AppEvent) -> bool {
        let before = *self;
        match event {
            AppEvent::AutoModeChanged(true) => self.is_auto_mode = true,
            // Leaving AUTO clears the running technique as well.
            AppEvent::AutoModeChanged(false) | AppEvent::AutoTimeout { .. } => {
                *self = SystemMode::default();
            }
            AppEvent::TechniqueChanged(technique) => self.technique = *technique,
            AppEvent::SessionReset => *self = SystemMode::default(),
            _ => {}
        }
        before != *self
    }
}

/// Read-only view of the current mode.
pub trait SystemStateReader: Send + Sync {
    fn system_mode(&self) -> SystemMode;
}

impl SystemStateReader for watch::Receiver<SystemMode> {
    fn system_mode(&self) -> SystemMode {
        *self.borrow()
    }
}

impl SystemStateReader for SystemMode {
    fn system_mode(&self) -> SystemMode {
        *self
    }
}

/// Minimal state store: applies events and publishes the mode on a watch channel.
pub struct SystemStore {
    sender: watch::Sender<SystemMode>,
}

impl SystemStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SystemMode::default());
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemMode> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> SystemMode {
        *self.sender.borrow()
    }

    pub fn apply(&self, event: &AppEvent) {
        self.sender.send_if_modified(|mode| mode.apply(event));
    }
}

impl Default for SystemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Event sink that folds mode events into the store before forwarding,
/// so the next dispatched command already sees the new mode.
pub struct StoreEvents {
    store: Arc<SystemStore>,
    forward: mpsc::UnboundedSender<AppEvent>,
}

impl StoreEvents {
    pub fn new(store: Arc<SystemStore>, forward: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { store, forward }
    }
}

impl EventSink for StoreEvents {
    fn emit(&self, event: AppEvent) {
        self.store.apply(&event);
        let _ = self.forward.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_off_resets_technique() {
        let mut mode = SystemMode {
            is_auto_mode: true,
            technique: MassageTechnique::Kneading,
        };
        assert!(mode.apply(&AppEvent::AutoModeChanged(false)));
        assert_eq!(mode, SystemMode::default());
    }

    #[test]
    fn test_auto_timeout_forces_manual() {
        let mut mode = SystemMode {
            is_auto_mode: true,
            technique: MassageTechnique::Combine,
        };
        mode.apply(&AppEvent::AutoTimeout { message: None });
        assert!(!mode.is_auto_mode);
        assert_eq!(mode.technique, MassageTechnique::None);
    }

    #[test]
    fn test_unrelated_event_is_ignored() {
        let mut mode = SystemMode::default();
        assert!(!mode.apply(&AppEvent::TimerExpired));
    }

    #[test]
    fn test_store_publishes_to_readers() {
        let store = SystemStore::new();
        let reader = store.subscribe();
        store.apply(&AppEvent::AutoModeChanged(true));
        store.apply(&AppEvent::TechniqueChanged(MassageTechnique::Percussion));
        let mode = reader.system_mode();
        assert!(mode.is_auto_mode);
        assert_eq!(mode.technique, MassageTechnique::Percussion);
    }

    #[test]
    fn test_store_events_apply_before_forwarding() {
        let store = Arc::new(SystemStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = StoreEvents::new(store.clone(), tx);
        sink.emit(AppEvent::AutoModeChanged(true));
        assert!(store.current().is_auto_mode);
        assert!(matches!(rx.try_recv(), Ok(AppEvent::AutoModeChanged(true))));
    }

    #[test]
    fn test_intensity_support() {
        assert!(MassageTechnique::Combine.supports_intensity());
        assert!(!MassageTechnique::Kneading.supports_intensity());
        assert!(!MassageTechnique::None.supports_intensity());
    }
}

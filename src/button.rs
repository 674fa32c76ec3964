//! Button press classification.
//!
//! The device has a single button; intent is encoded in hold duration. A
//! short press restarts the countdown, a medium hold requests a soft reset
//! (drop WiFi, keep identity and cache), and a long hold requests a factory
//! reset. The GPIO edge handling lives in the platform layer; this module
//! turns a measured hold duration into the right event.

use crate::config::Settings;
use crate::events::{Event, EventBus};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// What a completed press means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    /// Short press: restart the countdown.
    Tap,
    /// Hold past the soft-reset threshold.
    SoftReset,
    /// Hold past the factory-reset threshold.
    FactoryReset,
    /// Too long for a tap, too short for a reset; deliberately dead space
    /// so a slow tap cannot trigger a reset.
    Ignored,
}

/// Maps hold durations to press kinds and publishes the matching event.
pub struct PressClassifier {
    tap_max: Duration,
    soft_reset_hold: Duration,
    factory_reset_hold: Duration,
    bus: Arc<EventBus>,
}

impl PressClassifier {
    pub fn new(settings: &Settings, bus: Arc<EventBus>) -> Self {
        Self {
            tap_max: settings.tap_max,
            soft_reset_hold: settings.soft_reset_hold,
            factory_reset_hold: settings.factory_reset_hold,
            bus,
        }
    }

    /// Classify a hold duration. Thresholds are checked longest-first so
    /// the factory window wins over the soft window it contains.
    pub fn classify(&self, held: Duration) -> PressKind {
        if held >= self.factory_reset_hold {
            PressKind::FactoryReset
        } else if held >= self.soft_reset_hold {
            PressKind::SoftReset
        } else if held < self.tap_max {
            PressKind::Tap
        } else {
            PressKind::Ignored
        }
    }

    /// Handle a button release after `held` time pressed.
    ///
    /// Publishes the event matching the press kind; called from the GPIO
    /// interrupt path, so it does nothing heavier than a publish.
    pub fn on_release(&self, held: Duration) -> PressKind {
        let kind = self.classify(held);
        match kind {
            PressKind::Tap => {
                debug!("Button tap ({:?})", held);
                self.publish(Event::ButtonTapped);
            }
            PressKind::SoftReset => {
                info!("Soft reset requested ({:?} hold)", held);
                self.publish(Event::SoftResetRequested);
            }
            PressKind::FactoryReset => {
                info!("Factory reset requested ({:?} hold)", held);
                self.publish(Event::FactoryResetRequested);
            }
            PressKind::Ignored => debug!("Ignoring {:?} press", held),
        }
        kind
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(&event) {
            warn!("Event delivery aborted: {}", e);
        }
    }
}

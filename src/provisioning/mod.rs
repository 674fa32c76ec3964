//! Credential provisioning.
//!
//! Two transports deliver WiFi credentials to an unconfigured device: a BLE
//! GATT session with chunked writes and a physical-button confirmation, and
//! a SoftAP captive portal where submitting the form is the confirmation.
//! Both funnel into the same connect-test path: try the credentials, persist
//! them only on success, and report the outcome.
//!
//! # Components
//!
//! - [`protocol`] - chunk assembly, payload format, status tokens
//! - [`confirm`] - button-tap confirmation gate
//! - [`channel`] - transport-agnostic BLE session state machine
//! - [`softap`] - captive portal (HTTP form + DNS hijack)
//! - [`dns`] - DNS answer construction
//! - [`ble`] - ESP32 GATT server adapter (ESP32 only)

pub mod channel;
pub mod confirm;
pub mod dns;
pub mod protocol;
pub mod softap;

#[cfg(feature = "esp32")]
pub mod ble;

pub use channel::CredentialChannel;
pub use confirm::ConfirmationGate;
pub use protocol::{ChunkAssembler, PayloadError, Status, StatusSink};
pub use softap::{CaptivePortal, FormSubmission, PortalOutcome};

use crate::config::Settings;
use crate::engine::TimerCache;
use crate::events::{Event, EventBus};
use crate::identity::DeviceIdentity;
use crate::wifi::{ConnectionManager, Credentials, WifiError};
use log::{info, warn};
use std::io;
use std::sync::Arc;

/// Access-point radio control for the SoftAP transport, implemented by the
/// ESP-IDF driver on device and by fakes in tests.
pub trait AccessPoint: Send {
    /// Bring up an open access point with the given SSID.
    fn start(&mut self, ssid: &str) -> Result<(), WifiError>;
    /// Tear the access point down.
    fn stop(&mut self);
}

/// Status sink for transports with no status channel (the portal shows
/// result pages instead).
pub struct NullSink;

impl StatusSink for NullSink {
    fn notify(&mut self, _status: Status) {}
}

/// Shared provisioning flow behind both transports.
pub struct Provisioner {
    settings: Settings,
    bus: Arc<EventBus>,
    manager: ConnectionManager,
    cache: TimerCache,
}

impl Provisioner {
    pub fn new(
        settings: Settings,
        bus: Arc<EventBus>,
        manager: ConnectionManager,
        cache: TimerCache,
    ) -> Self {
        Self {
            settings,
            bus,
            manager,
            cache,
        }
    }

    /// SSID advertised by the SoftAP transport.
    pub fn session_ssid(&self, identity: &DeviceIdentity) -> String {
        format!("{}_Setup_{}", self.settings.device_name_prefix, identity.short())
    }

    /// Test a credential pair and persist it on success.
    ///
    /// The common tail of both transports: notifies `CONNECTING`, runs the
    /// full bounded-retry connect, then `CONNECTED` (and saves) or `FAILED`.
    pub fn handle_credentials(&self, credentials: Credentials, sink: &mut dyn StatusSink) -> bool {
        sink.notify(Status::Connecting);
        if self.manager.connect(Some(credentials)) {
            sink.notify(Status::Connected);
            if !self.manager.save_credentials() {
                warn!("Connected but failed to persist credentials");
            }
            true
        } else {
            sink.notify(Status::Failed);
            false
        }
    }

    /// Record the portal's pairing code, linking the device to its remote
    /// timer. An empty code is ignored (the field is optional and not yet
    /// verified against anything).
    pub fn record_setup_code(&self, setup_code: &str) {
        if setup_code.is_empty() {
            return;
        }
        if let Err(e) = self.cache.record_short_code(setup_code) {
            warn!("Failed to record setup code: {}", e);
        }
    }

    /// Run one SoftAP provisioning session to completion.
    ///
    /// Publishes the provisioning lifecycle events, brings the access point
    /// up around the captive portal, and tears everything down
    /// unconditionally on the way out. Returns whether a connection was
    /// established.
    pub fn run_softap(
        &self,
        ap: &mut dyn AccessPoint,
        identity: &DeviceIdentity,
    ) -> io::Result<bool> {
        self.publish(Event::EnteringProvisioning);

        let ssid = self.session_ssid(identity);
        info!("Starting SoftAP provisioning as '{}'", ssid);
        let result = match ap.start(&ssid) {
            Ok(()) => self.serve_portal(),
            Err(e) => {
                warn!("Failed to start access point: {}", e);
                Ok(false)
            }
        };

        ap.stop();
        self.publish(Event::ExitingProvisioning);
        result
    }

    fn serve_portal(&self) -> io::Result<bool> {
        let mut portal = CaptivePortal::bind(
            self.settings.softap_gateway,
            self.settings.portal_http_port,
            self.settings.portal_dns_port,
        )?;

        let outcome = portal.run(|submission| {
            let credentials = match Credentials::new(submission.ssid, submission.password) {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!("Rejecting portal submission: {}", e);
                    return false;
                }
            };
            let connected = self.handle_credentials(credentials, &mut NullSink);
            if connected {
                self.record_setup_code(&submission.setup_code);
            }
            connected
        })?;

        Ok(outcome == PortalOutcome::Connected)
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(&event) {
            warn!("Event delivery aborted: {}", e);
        }
    }
}

//! Button-tap confirmation gate.
//!
//! A received credential payload is never acted on directly: it is parked
//! here and a physical button tap within the confirmation window (10 seconds
//! by default) is required before any connection attempt. A tap outside the
//! window, or with nothing pending, does nothing. The raw payload is kept
//! unparsed until confirmation so the gate owns exactly what arrived on the
//! wire.
//!
//! Expiry is lazy: the window is checked when a tap arrives and by the
//! session loop's periodic `poll_timeout` call, not by a dedicated timer.

use crate::provisioning::protocol::{self, Status, StatusSink};
use crate::wifi::Credentials;
use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Pending {
    raw_payload: Vec<u8>,
    received_at: Instant,
}

/// Holds at most one credential payload awaiting physical confirmation.
pub struct ConfirmationGate {
    window: Duration,
    sink: Mutex<Box<dyn StatusSink>>,
    pending: Mutex<Option<Pending>>,
}

impl ConfirmationGate {
    pub fn new(window: Duration, sink: Box<dyn StatusSink>) -> Self {
        Self {
            window,
            sink: Mutex::new(sink),
            pending: Mutex::new(None),
        }
    }

    /// Park a payload and open a fresh confirmation window.
    ///
    /// A payload already pending is silently replaced; the newest submission
    /// always wins. Notifies `WAITING_CONFIRMATION`.
    pub fn submit(&self, raw_payload: Vec<u8>) {
        info!("Credentials received, waiting for button confirmation");
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                debug!("Replacing previously pending payload");
            }
            *pending = Some(Pending {
                raw_payload,
                received_at: Instant::now(),
            });
        }
        self.notify(Status::WaitingConfirmation);
    }

    /// Handle a button tap.
    ///
    /// With nothing pending this is a no-op returning `false`. If the window
    /// has expired, notifies `TIMEOUT`, discards the payload, and returns
    /// `false`. Otherwise the payload is consumed, parsed as
    /// `ssid|password`, and handed to `connect`, whose result is returned.
    /// The connect callback runs without any gate lock held, so it may take
    /// as long as a full retry budget.
    pub fn confirm(&self, connect: impl FnOnce(Credentials) -> bool) -> bool {
        let taken = {
            let mut pending = self.pending.lock().unwrap();
            match pending.take() {
                Some(p) if p.received_at.elapsed() <= self.window => p,
                Some(_) => {
                    drop(pending);
                    warn!("Confirmation window expired, credentials rejected");
                    self.notify(Status::Timeout);
                    return false;
                }
                None => {
                    debug!("Button tap with no pending credentials");
                    return false;
                }
            }
        };

        let credentials = match protocol::parse_payload(&taken.raw_payload) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("Pending payload failed to parse: {}", e);
                self.notify(Status::InvalidFormat);
                return false;
            }
        };

        info!("Button confirmed, attempting connection to '{}'", credentials.ssid);
        connect(credentials)
    }

    /// Expire a pending payload whose window has lapsed.
    ///
    /// Called periodically by the session loop. Notifies `TIMEOUT` exactly
    /// once per expired submission.
    pub fn poll_timeout(&self) {
        let expired = {
            let mut pending = self.pending.lock().unwrap();
            match pending.as_ref() {
                Some(p) if p.received_at.elapsed() > self.window => {
                    *pending = None;
                    true
                }
                _ => false,
            }
        };
        if expired {
            warn!("Confirmation window expired, credentials discarded");
            self.notify(Status::Timeout);
        }
    }

    /// Whether a payload is pending and still inside its window.
    pub fn is_waiting(&self) -> bool {
        let pending = self.pending.lock().unwrap();
        matches!(pending.as_ref(), Some(p) if p.received_at.elapsed() <= self.window)
    }

    /// Discard any pending payload without notifying (session teardown).
    pub fn cancel(&self) {
        *self.pending.lock().unwrap() = None;
    }

    fn notify(&self, status: Status) {
        self.sink.lock().unwrap().notify(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::protocol::test_support::RecordingSink;

    fn gate(window_ms: u64) -> (ConfirmationGate, RecordingSink) {
        let sink = RecordingSink::new();
        let gate = ConfirmationGate::new(Duration::from_millis(window_ms), Box::new(sink.clone()));
        (gate, sink)
    }

    #[test]
    fn test_submit_notifies_waiting() {
        let (gate, sink) = gate(10_000);
        gate.submit(b"MyNetwork|hunter22".to_vec());
        assert!(gate.is_waiting());
        assert_eq!(sink.recorded(), vec![Status::WaitingConfirmation]);
    }

    #[test]
    fn test_confirm_within_window_parses_and_connects() {
        let (gate, _sink) = gate(10_000);
        gate.submit(b"MyNetwork|hunter22".to_vec());

        let result = gate.confirm(|c| {
            assert_eq!(c.ssid, "MyNetwork");
            assert_eq!(c.password, "hunter22");
            true
        });
        assert!(result);
        assert!(!gate.is_waiting());
    }

    #[test]
    fn test_confirm_propagates_connect_failure() {
        let (gate, _sink) = gate(10_000);
        gate.submit(b"MyNetwork|hunter22".to_vec());
        assert!(!gate.confirm(|_| false));
    }

    #[test]
    fn test_tap_without_pending_is_noop() {
        let (gate, sink) = gate(10_000);
        let ran = std::cell::Cell::new(false);
        assert!(!gate.confirm(|_| {
            ran.set(true);
            true
        }));
        assert!(!ran.get());
        assert!(sink.recorded().is_empty());
    }

    #[test]
    fn test_tap_after_window_times_out() {
        let (gate, sink) = gate(10);
        gate.submit(b"MyNetwork|hunter22".to_vec());
        std::thread::sleep(Duration::from_millis(30));

        let ran = std::cell::Cell::new(false);
        assert!(!gate.confirm(|_| {
            ran.set(true);
            true
        }));
        assert!(!ran.get());
        assert_eq!(
            sink.recorded(),
            vec![Status::WaitingConfirmation, Status::Timeout]
        );
        // The window can be reopened by a fresh submission.
        gate.submit(b"MyNetwork|hunter22".to_vec());
        assert!(gate.is_waiting());
    }

    #[test]
    fn test_poll_timeout_expires_once() {
        let (gate, sink) = gate(10);
        gate.submit(b"MyNetwork|hunter22".to_vec());
        std::thread::sleep(Duration::from_millis(30));

        gate.poll_timeout();
        gate.poll_timeout();
        assert_eq!(
            sink.recorded(),
            vec![Status::WaitingConfirmation, Status::Timeout]
        );
        assert!(!gate.is_waiting());
    }

    #[test]
    fn test_malformed_pending_payload_reports_invalid_format() {
        let (gate, sink) = gate(10_000);
        gate.submit(b"no-separator-here".to_vec());

        let ran = std::cell::Cell::new(false);
        assert!(!gate.confirm(|_| {
            ran.set(true);
            true
        }));
        assert!(!ran.get());
        assert_eq!(
            sink.recorded(),
            vec![Status::WaitingConfirmation, Status::InvalidFormat]
        );
    }

    #[test]
    fn test_resubmission_replaces_pending() {
        let (gate, sink) = gate(10_000);
        gate.submit(b"First|aaaaaaaa".to_vec());
        gate.submit(b"Second|bbbbbbbb".to_vec());

        let mut seen = None;
        gate.confirm(|c| {
            seen = Some(c.ssid.clone());
            true
        });
        assert_eq!(seen.as_deref(), Some("Second"));
        assert_eq!(
            sink.recorded(),
            vec![Status::WaitingConfirmation, Status::WaitingConfirmation]
        );
    }

    #[test]
    fn test_cancel_is_silent() {
        let (gate, sink) = gate(10_000);
        gate.submit(b"MyNetwork|hunter22".to_vec());
        gate.cancel();
        assert!(!gate.is_waiting());
        assert_eq!(sink.recorded(), vec![Status::WaitingConfirmation]);
    }
}

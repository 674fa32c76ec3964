//! BLE credential channel state machine.
//!
//! Everything the BLE transport does between radio callbacks lives here,
//! independent of the radio itself: chunk reassembly, format validation,
//! and the hand-off to the confirmation gate. The ESP32 GATT server is a
//! thin adapter over this type; tests drive it directly.

use crate::provisioning::confirm::ConfirmationGate;
use crate::provisioning::protocol::{self, ChunkAssembler, Status, StatusSink};
use crate::wifi::Credentials;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Forwards to a shared sink, so the gate and the channel can both notify
/// the same peer.
struct SharedSink(Arc<Mutex<Box<dyn StatusSink>>>);

impl StatusSink for SharedSink {
    fn notify(&mut self, status: Status) {
        self.0.lock().unwrap().notify(status);
    }
}

/// One BLE provisioning session: receive buffer plus confirmation gate.
///
/// Radio callbacks call `on_*` from the radio's event context; the methods
/// only touch mutex-guarded state and never block on I/O.
pub struct CredentialChannel {
    assembler: Mutex<ChunkAssembler>,
    gate: ConfirmationGate,
    sink: Arc<Mutex<Box<dyn StatusSink>>>,
}

impl CredentialChannel {
    pub fn new(confirmation_window: Duration, sink: Box<dyn StatusSink>) -> Self {
        let sink = Arc::new(Mutex::new(sink));
        Self {
            assembler: Mutex::new(ChunkAssembler::new()),
            gate: ConfirmationGate::new(confirmation_window, Box::new(SharedSink(sink.clone()))),
            sink,
        }
    }

    /// A peer connected; any stale partial transfer is dropped.
    pub fn on_connect(&self) {
        debug!("BLE peer connected");
        self.assembler.lock().unwrap().reset();
    }

    /// A chunk was written to the credential characteristic.
    ///
    /// On the `END` sentinel the assembled payload is format-checked: a
    /// malformed payload is reported as `INVALID_FORMAT` and discarded with
    /// the session kept open for a retry; a valid one is parked in the
    /// confirmation gate.
    pub fn on_write(&self, chunk: &[u8]) {
        let payload = {
            let mut assembler = self.assembler.lock().unwrap();
            match assembler.push(chunk) {
                Some(payload) => payload,
                None => {
                    debug!("Chunk received, {} bytes buffered", assembler.len());
                    return;
                }
            }
        };

        match protocol::parse_payload(&payload) {
            Ok(_) => self.gate.submit(payload),
            Err(e) => {
                warn!("Rejecting credential payload: {}", e);
                self.sink.lock().unwrap().notify(Status::InvalidFormat);
            }
        }
    }

    /// The peer disconnected: discard the partial transfer and any
    /// unconfirmed pending payload. The transport resumes advertising.
    pub fn on_disconnect(&self) {
        debug!("BLE peer disconnected, discarding session state");
        self.assembler.lock().unwrap().reset();
        self.gate.cancel();
    }

    /// A physical button tap; forwards to the confirmation gate.
    pub fn on_button_tap(&self, connect: impl FnOnce(Credentials) -> bool) -> bool {
        self.gate.confirm(connect)
    }

    /// Expire a lapsed confirmation window; called from the session loop.
    pub fn poll_timeout(&self) {
        self.gate.poll_timeout();
    }

    /// Whether a payload is awaiting confirmation.
    pub fn is_waiting(&self) -> bool {
        self.gate.is_waiting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::protocol::test_support::RecordingSink;

    fn channel(window_ms: u64) -> (CredentialChannel, RecordingSink) {
        let sink = RecordingSink::new();
        let channel = CredentialChannel::new(
            Duration::from_millis(window_ms),
            Box::new(sink.clone()),
        );
        (channel, sink)
    }

    #[test]
    fn test_valid_payload_reaches_gate() {
        let (channel, sink) = channel(10_000);
        channel.on_connect();
        channel.on_write(b"MyWifi|sec");
        channel.on_write(b"ret123");
        assert!(!channel.is_waiting());
        channel.on_write(b"END");

        assert!(channel.is_waiting());
        assert_eq!(sink.recorded(), vec![Status::WaitingConfirmation]);
    }

    #[test]
    fn test_malformed_payload_keeps_session_open() {
        let (channel, sink) = channel(10_000);
        channel.on_connect();
        channel.on_write(b"no-separator");
        channel.on_write(b"END");

        assert!(!channel.is_waiting());
        assert_eq!(sink.recorded(), vec![Status::InvalidFormat]);

        // The peer can retry on the same session.
        channel.on_write(b"MyWifi|secret123");
        channel.on_write(b"END");
        assert!(channel.is_waiting());
    }

    #[test]
    fn test_disconnect_discards_pending_confirmation() {
        let (channel, _sink) = channel(10_000);
        channel.on_connect();
        channel.on_write(b"MyWifi|secret123");
        channel.on_write(b"END");
        assert!(channel.is_waiting());

        channel.on_disconnect();
        assert!(!channel.is_waiting());
        assert!(!channel.on_button_tap(|_| true));
    }

    #[test]
    fn test_reconnect_drops_partial_transfer() {
        let (channel, _sink) = channel(10_000);
        channel.on_connect();
        channel.on_write(b"half-a-payload");
        channel.on_connect();
        channel.on_write(b"MyWifi|secret123");
        channel.on_write(b"END");

        let mut seen = None;
        channel.on_button_tap(|c| {
            seen = Some(c.ssid.clone());
            true
        });
        assert_eq!(seen.as_deref(), Some("MyWifi"));
    }
}

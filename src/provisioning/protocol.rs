//! Credential transfer wire protocol.
//!
//! Credentials arrive over BLE as a sequence of raw chunk writes to a single
//! characteristic, terminated by a literal `END` chunk. The assembled payload
//! is UTF-8 text in the form `ssid|password`. Transport status is reported
//! back to the phone as short ASCII tokens on a notify characteristic.
//!
//! # Chunk Stream
//!
//! ```text
//! write: "MyNetw"
//! write: "ork|hunte"
//! write: "r22"
//! write: "END"        <- sentinel, assembled payload is "MyNetwork|hunter22"
//! ```
//!
//! A chunk that is exactly the bytes `END` is always the sentinel; there is
//! no escaping. This matches the phone app's writer, which never emits a
//! bare `END` chunk as data.

use crate::wifi::{CredentialError, Credentials};
use std::fmt;

/// The chunk that terminates a credential transfer.
pub const END_SENTINEL: &[u8] = b"END";

/// Separator between SSID and password in the assembled payload.
pub const FIELD_SEPARATOR: char = '|';

/// Transport status tokens notified to the provisioning client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Credentials received, waiting for the physical button tap.
    WaitingConfirmation,
    /// Connection attempt in progress.
    Connecting,
    /// Connection test succeeded; credentials persisted.
    Connected,
    /// Connection test failed.
    Failed,
    /// Confirmation window expired before the button was tapped.
    Timeout,
    /// Payload was not valid `ssid|password` text.
    InvalidFormat,
}

impl Status {
    /// The exact ASCII token written to the status characteristic.
    pub fn token(&self) -> &'static [u8] {
        match self {
            Self::WaitingConfirmation => b"WAITING_CONFIRMATION",
            Self::Connecting => b"CONNECTING",
            Self::Connected => b"CONNECTED",
            Self::Failed => b"FAILED",
            Self::Timeout => b"TIMEOUT",
            Self::InvalidFormat => b"INVALID_FORMAT",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are ASCII by construction.
        f.write_str(std::str::from_utf8(self.token()).unwrap_or("?"))
    }
}

/// Channel for reporting transfer status back to the provisioning client.
///
/// The BLE transport notifies its status characteristic; tests capture the
/// sequence. Delivery is best-effort and must not fail the state machine.
pub trait StatusSink: Send {
    fn notify(&mut self, status: Status);
}

/// Errors from decoding an assembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Payload bytes are not valid UTF-8.
    NotUtf8,
    /// Payload did not split into exactly two `|`-separated fields.
    FieldCount(usize),
    /// Fields decoded but failed credential validation.
    Invalid(CredentialError),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotUtf8 => write!(f, "payload is not valid UTF-8"),
            Self::FieldCount(n) => {
                write!(f, "expected 2 fields separated by '|', got {}", n)
            }
            Self::Invalid(e) => write!(f, "invalid credentials: {}", e),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<CredentialError> for PayloadError {
    fn from(e: CredentialError) -> Self {
        Self::Invalid(e)
    }
}

/// Decode an assembled payload into a credential pair.
///
/// The payload must split on `|` into exactly two fields; a password
/// containing `|` is therefore rejected, matching the phone app's encoder.
pub fn parse_payload(payload: &[u8]) -> Result<Credentials, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
    if fields.len() != 2 {
        return Err(PayloadError::FieldCount(fields.len()));
    }
    Ok(Credentials::new(fields[0], fields[1])?)
}

/// Accumulates credential chunks until the `END` sentinel arrives.
///
/// One assembler exists per BLE connection; a new connection starts with an
/// empty buffer.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffer: Vec<u8>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the assembled payload when the chunk is the
    /// `END` sentinel, leaving the buffer empty for the next transfer.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if chunk == END_SENTINEL {
            return Some(std::mem::take(&mut self.buffer));
        }
        self.buffer.extend_from_slice(chunk);
        None
    }

    /// Discard any partial transfer (client disconnected mid-stream).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

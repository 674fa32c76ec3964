//! Local timer cache and offline press queue.
//!
//! The cached timer snapshot is the device's fallback when the remote
//! service is unreachable; the offline press queue records button presses
//! made while offline so they can be replayed later. Both are small JSON
//! files with absence-is-no-data semantics.

use crate::storage;
use chrono::NaiveDateTime;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use std::path::PathBuf;

/// One timer snapshot as served by the remote API and cached locally.
///
/// Unknown fields are carried through `extra` so a cache write never strips
/// data a newer server version added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TimerRecord {
    /// Countdown deadline, ISO-8601 (`2026-03-01T09:30:00`). Absent on a
    /// registration-only record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Human-entered code linking this device to a remote timer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TimerRecord {
    /// Parse `end_time` into a unix timestamp (UTC).
    ///
    /// Only the first 19 characters are considered, so fractional seconds
    /// and zone suffixes are tolerated; a space separator is accepted as
    /// well as `T`.
    pub fn end_timestamp(&self) -> Option<i64> {
        let text = self.end_time.as_deref()?;
        // This string comes straight off the wire; byte indexing must never
        // panic on it, so slice through `get` and treat any value that is
        // too short or splits a multibyte character as unparseable.
        let (date, time) = match (text.get(..10), text.get(11..19)) {
            (Some(date), Some(time)) => (date, time),
            _ => {
                warn!("Unparseable end_time '{}': bad date-time shape", text);
                return None;
            }
        };
        let head = format!("{}T{}", date, time);
        match NaiveDateTime::parse_from_str(&head, "%Y-%m-%dT%H:%M:%S") {
            Ok(naive) => Some(naive.and_utc().timestamp()),
            Err(e) => {
                warn!("Unparseable end_time '{}': {}", text, e);
                None
            }
        }
    }
}

/// File-backed cache for the current timer snapshot.
#[derive(Debug, Clone)]
pub struct TimerCache {
    path: PathBuf,
}

impl TimerCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The cached snapshot, `None` if absent or unreadable.
    pub fn load(&self) -> Option<TimerRecord> {
        storage::load_json(&self.path)
    }

    /// Overwrite the cache, preserving a previously cached `short_code`
    /// that the new record omits. A write must never silently lose the
    /// device's link to its remote timer.
    pub fn save_merged(&self, mut record: TimerRecord) -> io::Result<()> {
        if record.short_code.is_none() {
            if let Some(existing) = self.load() {
                record.short_code = existing.short_code;
            }
        }
        storage::save_json(&self.path, &record)
    }

    /// Record a registration: write `{short_code}` verbatim, discarding any
    /// previous snapshot. Registration re-links the device, so stale timer
    /// state must not survive.
    pub fn record_short_code(&self, short_code: &str) -> io::Result<()> {
        let record = TimerRecord {
            short_code: Some(short_code.to_string()),
            ..TimerRecord::default()
        };
        storage::save_json(&self.path, &record)?;
        info!("Registered short code {}", short_code);
        Ok(())
    }

    pub fn clear(&self) -> io::Result<()> {
        storage::remove(&self.path)
    }
}

/// Ordered press timestamps accumulated while offline.
///
/// Append-only until a successful bulk replay clears the whole file; a
/// failed replay leaves every entry in place.
#[derive(Debug, Clone)]
pub struct OfflinePressQueue {
    path: PathBuf,
}

impl OfflinePressQueue {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one press timestamp (unix seconds).
    pub fn append(&self, timestamp: i64) -> io::Result<()> {
        let mut entries = self.entries();
        entries.push(timestamp);
        storage::save_json(&self.path, &entries)?;
        info!("Stored offline press at {} ({} queued)", timestamp, entries.len());
        Ok(())
    }

    /// All queued presses in original order.
    pub fn entries(&self) -> Vec<i64> {
        storage::load_json(&self.path).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop the whole queue. Called only after every entry synced.
    pub fn clear(&self) -> io::Result<()> {
        storage::remove(&self.path)
    }
}

//! Remote timer API client.
//!
//! Talks to the timer service over plain HTTP GETs. Every fetch is gated on
//! a successful clock sync: without correct wall-clock time the deadline
//! arithmetic downstream is meaningless, so an unsynced clock fails closed
//! as "no data" rather than guessing. Connectivity failures never propagate
//! as errors; the caller falls back to the local cache.

use crate::engine::cache::{OfflinePressQueue, TimerCache, TimerRecord};
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Mutex;

/// Transport-level HTTP failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError(pub String);

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http error: {}", self.0)
    }
}

impl std::error::Error for HttpError {}

/// A completed HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Blocking HTTP GET transport, implemented over the ESP-IDF HTTP client on
/// device and by fakes in tests.
pub trait HttpTransport: Send {
    fn get(&mut self, url: &str) -> Result<HttpResponse, HttpError>;
}

/// Wall-clock synchronization (SNTP on device). `sync` reports whether the
/// clock is trustworthy; it doubles as the connectivity probe.
pub trait ClockSync: Send {
    fn sync(&mut self) -> bool;
}

/// Client for the remote timer service.
pub struct ApiClient {
    base_url: String,
    http: Mutex<Box<dyn HttpTransport>>,
    clock: Mutex<Box<dyn ClockSync>>,
    cache: TimerCache,
    presses: OfflinePressQueue,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        http: Box<dyn HttpTransport>,
        clock: Box<dyn ClockSync>,
        cache: TimerCache,
        presses: OfflinePressQueue,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            http: Mutex::new(http),
            clock: Mutex::new(clock),
            cache,
            presses,
        }
    }

    /// Link this device to a remote timer by short code.
    ///
    /// The code is recorded verbatim as the new cache content; any stale
    /// snapshot from a previous registration is discarded.
    pub fn register_device(&self, short_code: &str) -> bool {
        match self.cache.record_short_code(short_code) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to record short code: {}", e);
                false
            }
        }
    }

    /// The locally cached snapshot, if any.
    pub fn cached_timer(&self) -> Option<TimerRecord> {
        self.cache.load()
    }

    /// Fetch the current timer from the service.
    ///
    /// Requires a successful clock sync; replays any queued offline presses
    /// first. HTTP 200 decodes the snapshot and overwrites the cache under
    /// the merge rule; 404 means "no timer provisioned yet"; any other
    /// status or transport failure is treated identically to absence.
    pub fn fetch_timer(&self, device_id: &str, short_code: &str) -> Option<TimerRecord> {
        if !self.sync_clock() {
            warn!("Clock not synced, skipping timer fetch");
            return None;
        }

        self.replay_offline_presses(short_code);

        let url = format!(
            "{}/api/device/{}?device_id={}",
            self.base_url,
            short_code.to_uppercase(),
            device_id
        );
        debug!("Fetching timer: {}", url);
        let response = match self.http.lock().unwrap().get(&url) {
            Ok(response) => response,
            Err(e) => {
                warn!("Timer fetch failed: {}", e);
                return None;
            }
        };

        match response.status {
            200 => match serde_json::from_slice::<TimerRecord>(&response.body) {
                Ok(record) => {
                    if let Err(e) = self.cache.save_merged(record.clone()) {
                        warn!("Failed to cache timer: {}", e);
                    }
                    // Reload so the caller sees the merged snapshot.
                    self.cache.load().or(Some(record))
                }
                Err(e) => {
                    warn!("Malformed timer response: {}", e);
                    None
                }
            },
            404 => {
                debug!("No timer provisioned for {}", short_code);
                None
            }
            status => {
                warn!("Timer fetch returned status {}", status);
                None
            }
        }
    }

    /// Record a physical press against the remote timer.
    ///
    /// When unreachable, the press timestamp is queued for later replay and
    /// the cached snapshot's `start_time` is advanced locally so the
    /// display restarts immediately.
    pub fn timer_pressed(&self, short_code: &str) {
        let now = Utc::now().timestamp();
        if !self.sync_clock() {
            info!("Offline, queueing press for later sync");
            if let Err(e) = self.presses.append(now) {
                warn!("Failed to queue offline press: {}", e);
            }
            let mut record = self.cache.load().unwrap_or_default();
            record
                .extra
                .insert("start_time".to_string(), serde_json::json!(now));
            if let Err(e) = self.cache.save_merged(record) {
                warn!("Failed to update cached start time: {}", e);
            }
            return;
        }

        let url = format!(
            "{}/api/device/restart/{}",
            self.base_url,
            short_code.to_uppercase()
        );
        match self.http.lock().unwrap().get(&url) {
            Ok(response) if response.status == 200 => {
                info!("Press recorded for {}", short_code);
            }
            Ok(response) => warn!("Press endpoint returned status {}", response.status),
            Err(e) => warn!("Failed to record press: {}", e),
        }
    }

    /// Replay queued offline presses in original order.
    ///
    /// The queue is cleared only after every entry succeeds; the first
    /// failure aborts the remaining replay and leaves the whole queue
    /// intact for the next opportunity.
    pub fn replay_offline_presses(&self, short_code: &str) -> bool {
        let entries = self.presses.entries();
        if entries.is_empty() {
            return true;
        }
        info!("Replaying {} offline presses", entries.len());

        for timestamp in &entries {
            let url = format!(
                "{}/api/device/restart/{}?time={}",
                self.base_url,
                short_code.to_uppercase(),
                timestamp
            );
            match self.http.lock().unwrap().get(&url) {
                Ok(response) if response.status == 200 => {}
                Ok(response) => {
                    warn!(
                        "Offline press replay got status {}, keeping queue",
                        response.status
                    );
                    return false;
                }
                Err(e) => {
                    warn!("Offline press replay failed: {}, keeping queue", e);
                    return false;
                }
            }
        }

        if let Err(e) = self.presses.clear() {
            warn!("Failed to clear synced press queue: {}", e);
            return false;
        }
        info!("Offline press queue synced and cleared");
        true
    }

    fn sync_clock(&self) -> bool {
        self.clock.lock().unwrap().sync()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Scripted HTTP transport: pops one canned result per request and
    /// records every URL.
    #[derive(Clone, Default)]
    pub struct FakeHttp {
        pub responses: Arc<Mutex<VecDeque<Result<HttpResponse, HttpError>>>>,
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl FakeHttp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_status(&self, status: u16, body: &str) {
            self.responses.lock().unwrap().push_back(Ok(HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }));
        }

        pub fn push_error(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(HttpError(message.to_string())));
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl HttpTransport for FakeHttp {
        fn get(&mut self, url: &str) -> Result<HttpResponse, HttpError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(HttpError("no scripted response".into())))
        }
    }

    /// Clock whose sync outcome is switchable at runtime.
    #[derive(Clone)]
    pub struct FakeClock {
        pub synced: Arc<Mutex<bool>>,
    }

    impl FakeClock {
        pub fn new(synced: bool) -> Self {
            Self {
                synced: Arc::new(Mutex::new(synced)),
            }
        }

        pub fn set(&self, synced: bool) {
            *self.synced.lock().unwrap() = synced;
        }
    }

    impl ClockSync for FakeClock {
        fn sync(&mut self) -> bool {
            *self.synced.lock().unwrap()
        }
    }
}

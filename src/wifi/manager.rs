//! WiFi connection management.
//!
//! Owns the single active network association. Connecting is a bounded-retry
//! association poll (not a blocking wait), reconnection after a lost link is
//! handled by a background supervisor, and `reset` is the one teardown path
//! that invalidates everything downstream.

use crate::events::{Event, EventBus};
use crate::storage::CredentialStore;
use crate::wifi::Credentials;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Slice length for interruptible supervisor sleeps.
const SUPERVISOR_POLL_SLICE: Duration = Duration::from_millis(250);

/// State of the radio association. Transitions through this enum are the
/// only legal mutations of the underlying station interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Errors from the station driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiError {
    /// SSID or password rejected by the driver.
    InvalidCredentials,
    /// Underlying radio/driver failure.
    Driver(String),
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "invalid credentials"),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for WifiError {}

/// Station-mode radio control, implemented by the ESP-IDF driver on device
/// and by fakes in tests.
pub trait StationDriver: Send {
    /// Bring up the station interface.
    fn activate(&mut self) -> Result<(), WifiError>;
    /// Issue a single connect request for the given credentials.
    fn request_connect(&mut self, credentials: &Credentials) -> Result<(), WifiError>;
    /// Whether the interface is currently associated.
    fn is_associated(&mut self) -> bool;
    /// Drop the current association, if any.
    fn disconnect(&mut self);
}

/// Bounded retry-with-interval poll.
///
/// Calls `check` up to `attempts` times, sleeping `interval` between calls.
/// Yields control at every interval so background work stays serviceable;
/// this deliberately preserves the exact retry-count and interval semantics
/// of a poll loop for test reproducibility.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn poll(&self, mut check: impl FnMut() -> bool) -> bool {
        for attempt in 1..=self.attempts {
            if check() {
                return true;
            }
            debug!("Association poll {}/{} negative", attempt, self.attempts);
            // No sleep after the final check; the budget is exhausted.
            if attempt < self.attempts {
                thread::sleep(self.interval);
            }
        }
        false
    }
}

struct Inner {
    driver: Mutex<Box<dyn StationDriver>>,
    state: Mutex<ConnectionState>,
    credentials: Mutex<Option<Credentials>>,
    // Serializes foreground connects with the supervisor: a new connect is
    // never issued while one is in flight.
    connect_guard: Mutex<()>,
    store: CredentialStore,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    supervisor_interval: Duration,
    supervisor_stop: AtomicBool,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
}

/// WiFi connection manager. Cheap to clone; all clones share one radio.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        driver: Box<dyn StationDriver>,
        store: CredentialStore,
        bus: Arc<EventBus>,
        retry: RetryPolicy,
        supervisor_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver: Mutex::new(driver),
                state: Mutex::new(ConnectionState::Disconnected),
                credentials: Mutex::new(None),
                connect_guard: Mutex::new(()),
                store,
                bus,
                retry,
                supervisor_interval,
                supervisor_stop: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Current association state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Whether a confirmed association is held.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to WiFi.
    ///
    /// Supplied credentials replace any in-memory pair. With no pair held,
    /// fails immediately without touching the radio. When already connected,
    /// succeeds without reconnecting. Otherwise issues one connect request
    /// and polls for association within the retry budget; exhausting it
    /// clears the in-memory pair (the persisted file is untouched) and
    /// reports failure. A confirmed association publishes `WifiConnected`.
    pub fn connect(&self, credentials: Option<Credentials>) -> bool {
        let _guard = self.inner.connect_guard.lock().unwrap();

        if let Some(supplied) = credentials {
            *self.inner.credentials.lock().unwrap() = Some(supplied);
        }

        if *self.inner.state.lock().unwrap() == ConnectionState::Connected {
            debug!("Already connected, connect is a no-op");
            return true;
        }

        let Some(current) = self.inner.credentials.lock().unwrap().clone() else {
            warn!("Connect requested with no credentials held");
            return false;
        };

        info!("Connecting to WiFi: {}", current.ssid);
        *self.inner.state.lock().unwrap() = ConnectionState::Connecting;

        let request = {
            let mut driver = self.inner.driver.lock().unwrap();
            driver.activate().and_then(|()| driver.request_connect(&current))
        };
        if let Err(e) = request {
            warn!("Connect request failed: {}", e);
            *self.inner.state.lock().unwrap() = ConnectionState::Disconnected;
            *self.inner.credentials.lock().unwrap() = None;
            return false;
        }

        let associated = self
            .inner
            .retry
            .poll(|| self.inner.driver.lock().unwrap().is_associated());

        if associated {
            info!("Connected to WiFi: {}", current.ssid);
            *self.inner.state.lock().unwrap() = ConnectionState::Connected;
            self.publish(Event::WifiConnected);
            true
        } else {
            warn!("Failed to connect to WiFi: retry budget exhausted");
            *self.inner.state.lock().unwrap() = ConnectionState::Disconnected;
            *self.inner.credentials.lock().unwrap() = None;
            false
        }
    }

    /// Persist the in-memory pair. Call after a successful connection test.
    pub fn save_credentials(&self) -> bool {
        let credentials = self.inner.credentials.lock().unwrap();
        let Some(credentials) = credentials.as_ref() else {
            warn!("No credentials to save");
            return false;
        };
        match self.inner.store.save(credentials) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save credentials: {}", e);
                false
            }
        }
    }

    /// Restore the persisted pair into memory. Returns whether a pair was
    /// loaded.
    pub fn load_credentials(&self) -> bool {
        match self.inner.store.load() {
            Some(credentials) => {
                *self.inner.credentials.lock().unwrap() = Some(credentials);
                true
            }
            None => false,
        }
    }

    /// Existence check for the persisted pair; decodes nothing.
    pub fn has_saved_credentials(&self) -> bool {
        self.inner.store.exists()
    }

    /// Load persisted credentials, connect, and start the background
    /// reconnection supervisor. Returns the foreground connect result.
    pub fn connect_and_monitor(&self) -> bool {
        self.load_credentials();
        let connected = self.connect(None);
        self.start_supervisor();
        connected
    }

    /// Tear down the association, clear in-memory and persisted
    /// credentials, and publish `WifiReset`. The sole trigger that
    /// invalidates everything downstream.
    pub fn reset(&self) {
        info!("WiFi reset requested");
        {
            let _guard = self.inner.connect_guard.lock().unwrap();
            self.inner.driver.lock().unwrap().disconnect();
            *self.inner.state.lock().unwrap() = ConnectionState::Disconnected;
            *self.inner.credentials.lock().unwrap() = None;
        }
        if let Err(e) = self.inner.store.clear() {
            warn!("Failed to delete persisted credentials: {}", e);
        }
        self.publish(Event::WifiReset);
    }

    /// Start the periodic reconnection supervisor, if not already running.
    ///
    /// Whenever the link is found down while credentials are still held, it
    /// attempts exactly one reconnect per interval. It never raises; a
    /// failed attempt just waits for the next tick.
    pub fn start_supervisor(&self) {
        let mut slot = self.inner.supervisor.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.inner.supervisor_stop.store(false, Ordering::Release);

        let manager = self.clone();
        let handle = thread::spawn(move || manager.supervise());
        *slot = Some(handle);
    }

    /// Whether the reconnection supervisor thread is running.
    pub fn supervisor_running(&self) -> bool {
        self.inner.supervisor.lock().unwrap().is_some()
    }

    /// Stop the supervisor and wait for it to exit.
    pub fn stop_supervisor(&self) {
        self.inner.supervisor_stop.store(true, Ordering::Release);
        let handle = self.inner.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn supervise(&self) {
        info!(
            "Reconnection supervisor running (interval {:?})",
            self.inner.supervisor_interval
        );
        loop {
            if !self.sleep_interruptibly(self.inner.supervisor_interval) {
                break;
            }

            let link_up = self.inner.driver.lock().unwrap().is_associated();
            if link_up {
                continue;
            }

            if *self.inner.state.lock().unwrap() == ConnectionState::Connected {
                warn!("WiFi link lost");
                *self.inner.state.lock().unwrap() = ConnectionState::Disconnected;
            }

            if self.inner.credentials.lock().unwrap().is_none() {
                continue;
            }

            debug!("Supervisor attempting reconnect");
            if !self.connect(None) {
                // connect() clears the in-memory pair on exhausted retries;
                // reload so the next tick can try again.
                self.load_credentials();
            }
        }
        info!("Reconnection supervisor stopped");
    }

    /// Sleep in slices, returning `false` if a stop was requested.
    fn sleep_interruptibly(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.inner.supervisor_stop.load(Ordering::Acquire) {
                return false;
            }
            let slice = remaining.min(SUPERVISOR_POLL_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.inner.supervisor_stop.load(Ordering::Acquire)
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.inner.bus.publish(&event) {
            warn!("Event delivery aborted: {}", e);
        }
    }
}

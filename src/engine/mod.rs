//! Countdown engine.
//!
//! Drives the device's single countdown: seeds from the local cache, fetches
//! the authoritative deadline from the remote service, and publishes a
//! per-second tick breakdown on the event bus. The remote service is
//! API-first with cache fallback; losing the network mid-countdown just
//! means ticking on from the last known deadline with the local clock.
//!
//! # Components
//!
//! - [`cache`] - cached timer snapshot and offline press queue
//! - [`api`] - remote timer service client

pub mod api;
pub mod cache;

pub use api::{ApiClient, ClockSync, HttpError, HttpResponse, HttpTransport};
pub use cache::{OfflinePressQueue, TimerCache, TimerRecord};

use crate::config::Settings;
use crate::events::{Event, EventBus, TickBreakdown, TickDirection, Topic};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Slice length for interruptible engine sleeps.
const ENGINE_POLL_SLICE: Duration = Duration::from_millis(100);

/// Timing knobs for the engine loop, injectable for tests.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Interval between published ticks.
    pub tick_interval: Duration,
    /// Backoff while no timer is provisioned for this device.
    pub no_timer_retry: Duration,
    /// How often to refetch an already-held deadline, in case the remote
    /// timer was edited after the device started.
    pub resync_interval: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            no_timer_retry: settings.no_timer_retry,
            resync_interval: settings.resync_interval,
        }
    }
}

/// Split the signed distance to a deadline into calendar-free units.
pub fn breakdown(end_timestamp: i64, now_timestamp: i64) -> TickBreakdown {
    let delta = end_timestamp - now_timestamp;
    let direction = if delta >= 0 {
        TickDirection::Until
    } else {
        TickDirection::Since
    };
    let magnitude = delta.abs();
    TickBreakdown {
        days: magnitude / 86400,
        hours: (magnitude % 86400) / 3600,
        minutes: (magnitude % 3600) / 60,
        seconds: magnitude % 60,
        direction,
    }
}

struct Inner {
    device_id: String,
    api: ApiClient,
    bus: Arc<EventBus>,
    config: EngineConfig,
    timer: Mutex<Option<TimerRecord>>,
    last_fetch: Mutex<Option<Instant>>,
    abort: AtomicBool,
    subscriptions: Mutex<Vec<(Topic, crate::events::SubscriptionId)>>,
}

impl Inner {
    /// The short code linking this device to its remote timer, from the
    /// in-memory snapshot or, failing that, the cache.
    fn short_code(&self) -> Option<String> {
        if let Some(code) = self
            .timer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|t| t.short_code.clone())
        {
            return Some(code);
        }
        self.api.cached_timer().and_then(|t| t.short_code)
    }

    fn handle_press(&self) {
        match self.short_code() {
            Some(code) => self.api.timer_pressed(&code),
            None => debug!("Press ignored, no short code registered"),
        }
    }
}

/// State machine over one persistent timer snapshot.
pub struct CountdownEngine {
    inner: Arc<Inner>,
}

impl CountdownEngine {
    /// Build the engine and register its event subscriptions: `WifiReset`
    /// aborts the tick loop, `ButtonTapped` records a press.
    pub fn new(
        device_id: impl Into<String>,
        api: ApiClient,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            device_id: device_id.into(),
            api,
            bus: bus.clone(),
            config,
            timer: Mutex::new(None),
            last_fetch: Mutex::new(None),
            abort: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });

        let engine = Self { inner };
        engine.subscribe_handlers();
        engine
    }

    fn subscribe_handlers(&self) {
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        if !subscriptions.is_empty() {
            return;
        }

        let for_reset = self.inner.clone();
        let reset_id = self.inner.bus.subscribe(
            Topic::WifiReset,
            Box::new(move |_| {
                info!("WiFi reset, aborting countdown");
                for_reset.abort.store(true, Ordering::Release);
                Ok(())
            }),
        );
        let for_press = self.inner.clone();
        let press_id = self.inner.bus.subscribe(
            Topic::ButtonTapped,
            Box::new(move |_| {
                for_press.handle_press();
                Ok(())
            }),
        );
        subscriptions.extend([(Topic::WifiReset, reset_id), (Topic::ButtonTapped, press_id)]);
    }

    /// Request a cooperative stop; observed at the next loop boundary.
    pub fn stop(&self) {
        self.inner.abort.store(true, Ordering::Release);
    }

    /// Run the countdown loop until aborted.
    ///
    /// Seeds from the cache, fetches immediately, then once per tick:
    /// fetch-or-backoff while no deadline is held, periodic resync, and a
    /// published tick breakdown. Exiting removes all event subscriptions;
    /// a later `run` re-registers them, so the engine survives a full
    /// reset-and-reprovision cycle.
    pub fn run(&self) {
        info!("Countdown engine starting for device {}", self.inner.device_id);
        self.inner.abort.store(false, Ordering::Release);
        self.subscribe_handlers();
        *self.inner.timer.lock().unwrap() = self.inner.api.cached_timer();
        self.refetch();

        loop {
            if self.inner.abort.load(Ordering::Acquire) {
                break;
            }

            let end_timestamp = self
                .inner
                .timer
                .lock()
                .unwrap()
                .as_ref()
                .and_then(TimerRecord::end_timestamp);

            let Some(end_timestamp) = end_timestamp else {
                self.refetch();
                let still_absent = self
                    .inner
                    .timer
                    .lock()
                    .unwrap()
                    .as_ref()
                    .and_then(TimerRecord::end_timestamp)
                    .is_none();
                if still_absent {
                    debug!("No timer provisioned, backing off");
                    self.sleep_interruptibly(self.inner.config.no_timer_retry);
                }
                continue;
            };

            if self.resync_due() {
                self.refetch();
            }

            let tick = breakdown(end_timestamp, Utc::now().timestamp());
            if let Err(e) = self.inner.bus.publish(&Event::TickChanged(tick)) {
                warn!("Tick delivery aborted: {}", e);
            }
            self.sleep_interruptibly(self.inner.config.tick_interval);
        }

        info!("Countdown engine stopped");
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock().unwrap());
        for (topic, id) in subscriptions {
            self.inner.bus.unsubscribe(topic, id);
        }
    }

    /// Attempt a remote fetch, falling back to the cache when the service
    /// is unreachable and nothing is held yet.
    fn refetch(&self) {
        *self.inner.last_fetch.lock().unwrap() = Some(Instant::now());

        let Some(code) = self.inner.short_code() else {
            debug!("No short code known, skipping fetch");
            return;
        };

        match self.inner.api.fetch_timer(&self.inner.device_id, &code) {
            Some(record) => {
                debug!("Timer refreshed from service");
                *self.inner.timer.lock().unwrap() = Some(record);
            }
            None => {
                let mut timer = self.inner.timer.lock().unwrap();
                if timer.is_none() {
                    *timer = self.inner.api.cached_timer();
                    if timer.is_some() {
                        info!("Service unreachable, using cached timer");
                    }
                }
                // An already-held deadline keeps ticking on the local clock.
            }
        }
    }

    fn resync_due(&self) -> bool {
        let last_fetch = self.inner.last_fetch.lock().unwrap();
        match *last_fetch {
            Some(at) => at.elapsed() >= self.inner.config.resync_interval,
            None => true,
        }
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.inner.abort.load(Ordering::Acquire) {
                return;
            }
            let slice = remaining.min(ENGINE_POLL_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::api::test_support::{FakeClock, FakeHttp};
    use super::*;
    use crate::storage::test_paths;
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn test_breakdown_until() {
        let tick = breakdown(90061 + 1000, 1000);
        assert_eq!(tick.days, 1);
        assert_eq!(tick.hours, 1);
        assert_eq!(tick.minutes, 1);
        assert_eq!(tick.seconds, 1);
        assert_eq!(tick.direction, TickDirection::Until);
    }

    #[test]
    fn test_breakdown_since() {
        let tick = breakdown(1000, 1000 + 3725);
        assert_eq!(tick.days, 0);
        assert_eq!(tick.hours, 1);
        assert_eq!(tick.minutes, 2);
        assert_eq!(tick.seconds, 5);
        assert_eq!(tick.direction, TickDirection::Since);
    }

    #[test]
    fn test_breakdown_zero_is_until() {
        let tick = breakdown(500, 500);
        assert_eq!(tick.seconds, 0);
        assert_eq!(tick.direction, TickDirection::Until);
    }

    struct Fixture {
        engine: CountdownEngine,
        bus: Arc<EventBus>,
        http: FakeHttp,
        clock: FakeClock,
        paths: (PathBuf, PathBuf),
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.engine.stop();
            let _ = fs::remove_file(&self.paths.0);
            let _ = fs::remove_file(&self.paths.1);
        }
    }

    fn fixture(name: &str, cached: Option<&str>) -> Fixture {
        let cache_path = test_paths::unique(&format!("{}-timer.json", name));
        let press_path = test_paths::unique(&format!("{}-presses.json", name));
        if let Some(raw) = cached {
            fs::write(&cache_path, raw).unwrap();
        }

        let bus = EventBus::new();
        let http = FakeHttp::new();
        let clock = FakeClock::new(true);
        let api = ApiClient::new(
            "https://timer.example.net",
            Box::new(http.clone()),
            Box::new(clock.clone()),
            TimerCache::new(cache_path.clone()),
            OfflinePressQueue::new(press_path.clone()),
        );
        let config = EngineConfig {
            tick_interval: Duration::from_millis(10),
            no_timer_retry: Duration::from_millis(30),
            resync_interval: Duration::from_secs(3600),
        };
        let engine = CountdownEngine::new("dev-1", api, bus.clone(), config);
        Fixture {
            engine,
            bus,
            http,
            clock,
            paths: (cache_path, press_path),
        }
    }

    fn collect_ticks(bus: &EventBus) -> Arc<Mutex<Vec<TickBreakdown>>> {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let ticks_clone = ticks.clone();
        bus.subscribe(
            Topic::TickChanged,
            Box::new(move |event| {
                if let Event::TickChanged(tick) = event {
                    ticks_clone.lock().unwrap().push(*tick);
                }
                Ok(())
            }),
        );
        ticks
    }

    fn run_for(engine: &CountdownEngine, duration: Duration) {
        thread::scope(|scope| {
            scope.spawn(|| engine.run());
            thread::sleep(duration);
            engine.stop();
        });
    }

    #[test]
    fn test_unknown_code_falls_back_to_cache() {
        // Scenario: the service answers 404 but a snapshot is cached.
        let cached = r#"{"end_time":"2030-01-01T00:00:00","short_code":"AB12"}"#;
        let f = fixture("e1", Some(cached));
        let ticks = collect_ticks(&f.bus);
        for _ in 0..50 {
            f.http.push_status(404, "");
        }

        run_for(&f.engine, Duration::from_millis(200));

        let ticks = ticks.lock().unwrap();
        assert!(!ticks.is_empty(), "engine should tick from the cached deadline");
        assert!(ticks.iter().all(|t| t.direction == TickDirection::Until));
    }

    #[test]
    fn test_no_timer_anywhere_backs_off() {
        let cached = r#"{"short_code":"AB12"}"#;
        let f = fixture("e2", Some(cached));
        let ticks = collect_ticks(&f.bus);
        for _ in 0..50 {
            f.http.push_status(404, "");
        }

        run_for(&f.engine, Duration::from_millis(200));

        assert!(ticks.lock().unwrap().is_empty());
        // Backoff means a handful of fetch attempts, not one per tick.
        let fetches = f.http.requests().len();
        assert!(fetches >= 2, "expected repeated retries, got {}", fetches);
        assert!(fetches <= 10, "expected backoff between retries, got {}", fetches);
    }

    #[test]
    fn test_network_drop_mid_countdown_keeps_ticking() {
        let cached = r#"{"short_code":"AB12"}"#;
        let f = fixture("e3", Some(cached));
        let ticks = collect_ticks(&f.bus);
        // First fetch succeeds, then the network goes away entirely.
        f.http
            .push_status(200, r#"{"end_time":"2030-01-01T00:00:00"}"#);

        thread::scope(|scope| {
            scope.spawn(|| f.engine.run());
            thread::sleep(Duration::from_millis(100));
            f.clock.set(false);
            thread::sleep(Duration::from_millis(100));
            f.engine.stop();
        });

        let ticks = ticks.lock().unwrap();
        assert!(
            ticks.len() >= 5,
            "countdown should keep ticking offline, got {} ticks",
            ticks.len()
        );
    }

    #[test]
    fn test_wifi_reset_aborts_and_unsubscribes() {
        let cached = r#"{"end_time":"2030-01-01T00:00:00","short_code":"AB12"}"#;
        let f = fixture("e4", Some(cached));
        f.http
            .push_status(200, r#"{"end_time":"2030-01-01T00:00:00"}"#);

        thread::scope(|scope| {
            let handle = scope.spawn(|| f.engine.run());
            thread::sleep(Duration::from_millis(50));
            f.bus.publish(&Event::WifiReset).unwrap();
            handle.join().unwrap();
        });

        assert_eq!(f.bus.subscriber_count(Topic::WifiReset), 0);
        assert_eq!(f.bus.subscriber_count(Topic::ButtonTapped), 0);
    }

    #[test]
    fn test_button_tap_records_press() {
        let cached = r#"{"end_time":"2030-01-01T00:00:00","short_code":"AB12"}"#;
        let f = fixture("e5", Some(cached));
        f.http.push_status(200, "ok");

        f.bus.publish(&Event::ButtonTapped).unwrap();
        assert_eq!(
            f.http.requests(),
            vec!["https://timer.example.net/api/device/restart/AB12"]
        );
    }
}

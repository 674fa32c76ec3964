//! Application assembly and top-level loop.
//!
//! Owns every component and the boot decision: saved credentials mean
//! "reconnect and count down," no credentials mean "enter provisioning."
//! A reset event tears the countdown down and sends the device back around
//! the loop, so the whole lifecycle is one cycle of provisioning,
//! connecting, and counting.

use crate::button::PressClassifier;
use crate::config::{ProvisioningMode, Settings};
use crate::engine::{
    ApiClient, ClockSync, CountdownEngine, EngineConfig, HttpTransport, OfflinePressQueue,
    TimerCache,
};
use crate::events::{EventBus, Topic};
use crate::identity::DeviceIdentity;
use crate::provisioning::{AccessPoint, Provisioner};
use crate::storage::CredentialStore;
use crate::wifi::{ConnectionManager, RetryPolicy, StationDriver};
use log::{info, warn};
use std::io;
use std::sync::{Arc, Mutex};

/// Hardware-backed pieces the application cannot construct itself. On
/// device these wrap ESP-IDF drivers; tests and the host build pass fakes.
pub struct Platform {
    pub station: Box<dyn StationDriver>,
    pub access_point: Box<dyn AccessPoint>,
    pub http: Box<dyn HttpTransport>,
    pub clock: Box<dyn ClockSync>,
    /// Platform-unique bytes seeding first-boot identity generation.
    pub hardware_seed: Vec<u8>,
}

pub struct Application {
    settings: Settings,
    bus: Arc<EventBus>,
    identity: DeviceIdentity,
    manager: ConnectionManager,
    provisioner: Provisioner,
    engine: CountdownEngine,
    classifier: Arc<PressClassifier>,
    access_point: Mutex<Box<dyn AccessPoint>>,
}

impl Application {
    /// Wire every component together and register the reset handlers.
    pub fn new(settings: Settings, platform: Platform) -> io::Result<Self> {
        let bus = EventBus::new();
        let identity = DeviceIdentity::load_or_create(
            &settings.file(Settings::DEVICE_ID_FILE),
            &platform.hardware_seed,
        )?;
        info!("Device identity: {}", identity.id());

        let store = CredentialStore::new(settings.file(Settings::CREDENTIALS_FILE));
        let manager = ConnectionManager::new(
            platform.station,
            store,
            bus.clone(),
            RetryPolicy {
                attempts: settings.wifi_retry_count,
                interval: settings.wifi_retry_interval,
            },
            settings.supervisor_interval,
        );

        let cache = TimerCache::new(settings.file(Settings::TIMER_FILE));
        let presses = OfflinePressQueue::new(settings.file(Settings::OFFLINE_PRESSES_FILE));
        let api = ApiClient::new(
            settings.api_base_url.clone(),
            platform.http,
            platform.clock,
            cache.clone(),
            presses.clone(),
        );
        let engine = CountdownEngine::new(
            identity.id(),
            api,
            bus.clone(),
            EngineConfig::from_settings(&settings),
        );
        let provisioner = Provisioner::new(
            settings.clone(),
            bus.clone(),
            manager.clone(),
            cache.clone(),
        );
        let classifier = Arc::new(PressClassifier::new(&settings, bus.clone()));

        // Soft reset drops WiFi only; factory reset also clears the timer
        // cache and press queue. The identity survives both.
        let soft_manager = manager.clone();
        bus.subscribe(
            Topic::SoftResetRequested,
            Box::new(move |_| {
                soft_manager.reset();
                Ok(())
            }),
        );
        let factory_manager = manager.clone();
        bus.subscribe(
            Topic::FactoryResetRequested,
            Box::new(move |_| {
                factory_manager.reset();
                if let Err(e) = cache.clear() {
                    warn!("Failed to clear timer cache: {}", e);
                }
                if let Err(e) = presses.clear() {
                    warn!("Failed to clear press queue: {}", e);
                }
                Ok(())
            }),
        );

        Ok(Self {
            settings,
            bus,
            identity,
            manager,
            provisioner,
            engine,
            classifier,
            access_point: Mutex::new(platform.access_point),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The press classifier, for the platform's GPIO interrupt to call.
    pub fn classifier(&self) -> Arc<PressClassifier> {
        self.classifier.clone()
    }

    /// Whether boot should enter provisioning instead of reconnecting.
    pub fn needs_provisioning(&self) -> bool {
        !self.manager.has_saved_credentials()
    }

    /// Run the device lifecycle forever.
    pub fn run(&self) -> io::Result<()> {
        loop {
            self.run_cycle()?;
        }
    }

    /// One pass of the lifecycle: provision or reconnect, then count down
    /// until a reset aborts the engine.
    pub fn run_cycle(&self) -> io::Result<()> {
        let ready = if self.needs_provisioning() {
            info!("No saved credentials, entering provisioning");
            self.provision()?
        } else if self.manager.connect_and_monitor() {
            true
        } else {
            warn!("Reconnect with saved credentials failed, re-entering provisioning");
            self.provision()?
        };
        if !ready {
            return Ok(());
        }

        self.count_down();
        Ok(())
    }

    /// Run the countdown with the reconnection supervisor watching the
    /// link. The provisioning path arrives here without one running;
    /// starting it is idempotent on the reconnect path.
    fn count_down(&self) {
        self.manager.start_supervisor();
        self.engine.run();
        self.manager.stop_supervisor();
    }

    fn provision(&self) -> io::Result<bool> {
        match self.settings.provisioning_mode {
            ProvisioningMode::SoftAp => {
                let mut ap = self.access_point.lock().unwrap();
                self.provisioner.run_softap(ap.as_mut(), &self.identity)
            }
            ProvisioningMode::Ble => self.provision_ble(),
        }
    }

    #[cfg(feature = "esp32")]
    fn provision_ble(&self) -> io::Result<bool> {
        crate::provisioning::ble::run_session(
            &self.settings,
            &self.bus,
            &self.provisioner,
            &self.identity,
        )
    }

    #[cfg(not(feature = "esp32"))]
    fn provision_ble(&self) -> io::Result<bool> {
        // No BLE stack on the host build; the portal covers provisioning.
        warn!("BLE provisioning unavailable on this build, using SoftAP");
        let mut ap = self.access_point.lock().unwrap();
        self.provisioner.run_softap(ap.as_mut(), &self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::api::test_support::{FakeClock, FakeHttp};
    use crate::storage::test_paths;
    use crate::wifi::manager::test_support::FakeStation;
    use crate::wifi::{Credentials, WifiError};
    use std::fs;
    use std::path::PathBuf;

    struct IdleAp;

    impl AccessPoint for IdleAp {
        fn start(&mut self, _ssid: &str) -> Result<(), WifiError> {
            Err(WifiError::Driver("no radio in tests".into()))
        }

        fn stop(&mut self) {}
    }

    struct Fixture {
        app: Application,
        data_dir: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.data_dir);
        }
    }

    fn fixture(name: &str, station: FakeStation) -> Fixture {
        let data_dir = test_paths::unique(name);
        let settings = Settings {
            data_dir: data_dir.clone(),
            ..Settings::default()
        };
        let platform = Platform {
            station: Box::new(station),
            access_point: Box::new(IdleAp),
            http: Box::new(FakeHttp::new()),
            clock: Box::new(FakeClock::new(false)),
            hardware_seed: b"test-seed".to_vec(),
        };
        let app = Application::new(settings, platform).unwrap();
        Fixture { app, data_dir }
    }

    #[test]
    fn test_boot_decision_follows_saved_credentials() {
        let f = fixture("app1", FakeStation::new(Some(0)));
        assert!(f.app.needs_provisioning());

        let store = CredentialStore::new(f.data_dir.join(Settings::CREDENTIALS_FILE));
        store
            .save(&Credentials::new("MyWifi", "secret123").unwrap())
            .unwrap();
        assert!(!f.app.needs_provisioning());
    }

    #[test]
    fn test_identity_survives_factory_reset() {
        let f = fixture("app2", FakeStation::new(Some(0)));
        let id_before = f.app.identity().id().to_string();

        // Populate everything a factory reset should clear.
        let store = CredentialStore::new(f.data_dir.join(Settings::CREDENTIALS_FILE));
        store
            .save(&Credentials::new("MyWifi", "secret123").unwrap())
            .unwrap();
        let cache = TimerCache::new(f.data_dir.join(Settings::TIMER_FILE));
        cache.record_short_code("AB12").unwrap();
        let presses = OfflinePressQueue::new(f.data_dir.join(Settings::OFFLINE_PRESSES_FILE));
        presses.append(1234).unwrap();

        f.app
            .classifier()
            .on_release(std::time::Duration::from_secs(7));

        assert!(!store.exists());
        assert!(cache.load().is_none());
        assert!(presses.is_empty());
        // Identity is the one thing a factory reset keeps.
        assert!(f.data_dir.join(Settings::DEVICE_ID_FILE).exists());
        assert_eq!(f.app.identity().id(), id_before);
    }

    // The countdown must run under the supervisor on the provisioning
    // path too, where no connect_and_monitor ever started one.
    #[test]
    fn test_countdown_runs_under_supervisor() {
        use crate::engine::TimerRecord;
        use crate::events::Event;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::{Duration, Instant};

        let f = fixture("app4", FakeStation::new(Some(0)));

        // Seed a deadline so the engine ticks right away.
        let cache = TimerCache::new(f.data_dir.join(Settings::TIMER_FILE));
        cache
            .save_merged(TimerRecord {
                end_time: Some("2030-01-01T00:00:00".into()),
                ..TimerRecord::default()
            })
            .unwrap();

        let ticked = Arc::new(AtomicBool::new(false));
        let ticked_flag = ticked.clone();
        f.app.bus().subscribe(
            crate::events::Topic::TickChanged,
            Box::new(move |_| {
                ticked_flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );

        std::thread::scope(|scope| {
            scope.spawn(|| f.app.count_down());

            let deadline = Instant::now() + Duration::from_secs(2);
            while !ticked.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            assert!(ticked.load(Ordering::SeqCst), "engine never ticked");
            assert!(f.app.manager.supervisor_running());

            f.app.bus().publish(&Event::WifiReset).unwrap();
        });

        assert!(!f.app.manager.supervisor_running());
    }

    #[test]
    fn test_soft_reset_clears_only_credentials() {
        let f = fixture("app3", FakeStation::new(Some(0)));

        let store = CredentialStore::new(f.data_dir.join(Settings::CREDENTIALS_FILE));
        store
            .save(&Credentials::new("MyWifi", "secret123").unwrap())
            .unwrap();
        let cache = TimerCache::new(f.data_dir.join(Settings::TIMER_FILE));
        cache.record_short_code("AB12").unwrap();

        f.app
            .classifier()
            .on_release(std::time::Duration::from_secs(4));

        assert!(!store.exists());
        assert_eq!(cache.load().unwrap().short_code.as_deref(), Some("AB12"));
    }
}

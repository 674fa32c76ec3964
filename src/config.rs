//! Device settings and design constants.
//!
//! All tunables live in one explicitly constructed [`Settings`] value that is
//! passed to components at creation. Nothing in this crate reads global
//! mutable configuration.

use std::path::PathBuf;
use std::time::Duration;

/// How credentials are delivered during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// BLE GATT chunked transfer with physical-button confirmation.
    Ble,
    /// SoftAP captive portal; form submission is the confirmation.
    SoftAp,
}

/// Device configuration, passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the remote timer service.
    pub api_base_url: String,
    /// Directory holding every persisted JSON document.
    pub data_dir: PathBuf,

    /// Association poll attempts before a connect is declared failed.
    pub wifi_retry_count: u32,
    /// Delay between association polls.
    pub wifi_retry_interval: Duration,
    /// Reconnection supervisor wake-up interval.
    pub supervisor_interval: Duration,

    /// Advertised name prefix for both BLE and the SoftAP SSID.
    pub device_name_prefix: String,
    /// Window in which a button tap must confirm pending credentials.
    pub confirmation_window: Duration,

    /// SoftAP gateway address, also the captive-portal redirect target.
    pub softap_gateway: [u8; 4],
    /// TCP port for the portal form server.
    pub portal_http_port: u16,
    /// UDP port for the DNS responder.
    pub portal_dns_port: u16,

    /// How often the engine refetches an already-known timer.
    pub resync_interval: Duration,
    /// Backoff while no timer has ever been obtained.
    pub no_timer_retry: Duration,

    /// Press shorter than this is a tap.
    pub tap_max: Duration,
    /// Press at least this long requests a soft reset.
    pub soft_reset_hold: Duration,
    /// Press at least this long requests a factory reset.
    pub factory_reset_hold: Duration,

    /// Which credential transport provisioning uses.
    pub provisioning_mode: ProvisioningMode,
}

impl Settings {
    /// File name for persisted WiFi credentials.
    pub const CREDENTIALS_FILE: &'static str = "wifi_credentials.json";
    /// File name for the device identity.
    pub const DEVICE_ID_FILE: &'static str = "dev_id.json";
    /// File name for the cached timer snapshot.
    pub const TIMER_FILE: &'static str = "timer.json";
    /// File name for the offline press queue.
    pub const OFFLINE_PRESSES_FILE: &'static str = "offline_presses.json";

    /// Path of a persisted document inside the data directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "https://timer.christopher-richards.net".to_string(),
            data_dir: default_data_dir(),
            wifi_retry_count: 10,
            wifi_retry_interval: Duration::from_secs(1),
            supervisor_interval: Duration::from_secs(30),
            device_name_prefix: "ESP32_Device".to_string(),
            confirmation_window: Duration::from_secs(10),
            softap_gateway: [192, 168, 4, 1],
            portal_http_port: 80,
            portal_dns_port: 53,
            resync_interval: Duration::from_secs(300),
            no_timer_retry: Duration::from_secs(60),
            tap_max: Duration::from_millis(1000),
            soft_reset_hold: Duration::from_millis(3000),
            factory_reset_hold: Duration::from_millis(6000),
            provisioning_mode: ProvisioningMode::SoftAp,
        }
    }
}

/// Default data directory: `~/.countdown-esp32` on host, VFS root on device.
fn default_data_dir() -> PathBuf {
    #[cfg(feature = "esp32")]
    {
        PathBuf::from("/spiffs")
    }
    #[cfg(not(feature = "esp32"))]
    {
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".countdown-esp32"),
            Err(_) => PathBuf::from(".countdown-esp32"),
        }
    }
}

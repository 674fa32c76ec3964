//! WiFi credentials and connection management.
//!
//! # Components
//!
//! - [`credentials`] - platform-independent credential pair with validation
//! - [`manager`] - connection state machine, bounded-retry connect, and
//!   background reconnection supervisor
//! - [`station`] - ESP-IDF station driver (ESP32 only)

pub mod credentials;
pub mod manager;

#[cfg(feature = "esp32")]
pub mod station;

pub use credentials::{CredentialError, Credentials, MAX_PASSWORD_LEN, MAX_SSID_LEN};
pub use manager::{ConnectionManager, ConnectionState, RetryPolicy, StationDriver, WifiError};

#[cfg(feature = "esp32")]
pub use station::{EspAccessPoint, EspRadio, EspStation};

//! Countdown device firmware library.
//!
//! This library contains platform-independent components that can be tested
//! on the host machine without ESP32 hardware. The `esp32` feature gates
//! the ESP-IDF radio, HTTP, and clock adapters.

pub mod app;
pub mod button;
pub mod config;
pub mod engine;
pub mod events;
pub mod identity;
#[cfg(feature = "esp32")]
pub mod platform;
pub mod provisioning;
pub mod storage;
pub mod wifi;

// Re-export commonly used items
pub use app::{Application, Platform};
pub use config::{ProvisioningMode, Settings};
pub use engine::{ApiClient, CountdownEngine, TimerCache, TimerRecord};
pub use events::{Event, EventBus, Topic};
pub use identity::DeviceIdentity;
pub use provisioning::{CredentialChannel, Provisioner, Status};
pub use wifi::{ConnectionManager, Credentials, WifiError};

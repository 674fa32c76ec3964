//! ESP-IDF implementations of the hardware-facing traits.
//!
//! Everything the [`crate::app::Platform`] struct needs on device: the HTTP
//! transport over the ESP-IDF client, SNTP-backed clock sync, and the
//! factory MAC as the identity seed. The WiFi radio adapters live in
//! [`crate::wifi::station`].

use crate::button::PressClassifier;
use crate::engine::{ClockSync, HttpError, HttpResponse, HttpTransport};
use embedded_svc::http::client::Client;
use embedded_svc::http::Method;
use embedded_svc::io::Read;
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver};
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use log::warn;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Blocking GET over the ESP-IDF HTTP client, one connection per request.
pub struct EspHttp {
    timeout: Duration,
}

impl EspHttp {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for EspHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for EspHttp {
    fn get(&mut self, url: &str) -> Result<HttpResponse, HttpError> {
        let config = HttpConfiguration {
            timeout: Some(self.timeout),
            buffer_size: Some(2048),
            // Certificate bundle so the https API endpoint verifies.
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };

        let connection = EspHttpConnection::new(&config)
            .map_err(|e| HttpError(format!("connect: {:?}", e)))?;
        let mut client = Client::wrap(connection);

        let request = client
            .request(Method::Get, url, &[])
            .map_err(|e| HttpError(format!("request: {:?}", e)))?;
        let mut response = request
            .submit()
            .map_err(|e| HttpError(format!("submit: {:?}", e)))?;
        let status = response.status();

        let mut body = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let read = response
                .read(&mut buf)
                .map_err(|e| HttpError(format!("read: {:?}", e)))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&buf[..read]);
        }

        Ok(HttpResponse { status, body })
    }
}

/// How long one sync attempt waits for SNTP to complete.
const SNTP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SNTP_POLL_ATTEMPTS: u32 = 30;

/// SNTP-backed clock sync; the service is started lazily on the first call
/// and kept alive for the rest of the process.
pub struct EspClock {
    sntp: Option<EspSntp<'static>>,
}

impl EspClock {
    pub fn new() -> Self {
        Self { sntp: None }
    }
}

impl Default for EspClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync for EspClock {
    fn sync(&mut self) -> bool {
        if self.sntp.is_none() {
            match EspSntp::new_default() {
                Ok(sntp) => self.sntp = Some(sntp),
                Err(e) => {
                    warn!("Failed to start SNTP: {:?}", e);
                    return false;
                }
            }
        }
        let Some(sntp) = self.sntp.as_ref() else {
            return false;
        };

        for _ in 0..SNTP_POLL_ATTEMPTS {
            if sntp.get_sync_status() == SyncStatus::Completed {
                return true;
            }
            thread::sleep(SNTP_POLL_INTERVAL);
        }
        warn!("SNTP sync did not complete");
        false
    }
}

/// Poll period for the button watcher; doubles as the debounce window.
const BUTTON_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Watch an active-low button pin and feed hold durations to the classifier.
///
/// Polling instead of edge interrupts keeps the classifier call out of ISR
/// context; 20ms resolution is far below the 1s tap threshold.
pub fn spawn_button_watcher(
    button: PinDriver<'static, AnyIOPin, Input>,
    classifier: Arc<PressClassifier>,
) {
    thread::spawn(move || {
        let mut pressed_at: Option<Instant> = None;
        loop {
            match (button.is_low(), pressed_at) {
                (true, None) => pressed_at = Some(Instant::now()),
                (false, Some(start)) => {
                    classifier.on_release(start.elapsed());
                    pressed_at = None;
                }
                _ => {}
            }
            thread::sleep(BUTTON_POLL_INTERVAL);
        }
    });
}

/// Factory MAC address, the stable per-chip seed for identity generation.
pub fn hardware_seed() -> Vec<u8> {
    let mut mac = [0u8; 6];
    let result = unsafe { esp_idf_sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if result != esp_idf_sys::ESP_OK {
        warn!("Failed to read factory MAC: {}", result);
    }
    mac.to_vec()
}

//! ESP-IDF WiFi radio adapter.
//!
//! The ESP32 has one radio that serves both roles this crate needs: the
//! station interface the connection manager drives and the open access
//! point the captive portal advertises. [`EspRadio`] owns the driver and
//! the current role mix; [`EspStation`] and [`EspAccessPoint`] are thin
//! handles over it that implement the crate's traits, so the two roles can
//! be wired into different components while sharing the hardware.
//!
//! While the access point is up the driver runs in mixed AP+STA mode, so a
//! portal-driven connect test can associate the station without dropping
//! the portal client. Stopping the access point only sheds the AP half;
//! the association made through the portal stays up.

use crate::provisioning::AccessPoint;
use crate::wifi::{Credentials, StationDriver, WifiError};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, BlockingWifi, ClientConfiguration, Configuration,
    EspWifi,
};
use esp_idf_sys::EspError;
use log::{info, warn};
use std::sync::{Arc, Mutex};

/// Exclusive owner of the ESP-IDF WiFi driver and the active role mix.
pub struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
    client: ClientConfiguration,
    access_point: Option<AccessPointConfiguration>,
}

impl EspRadio {
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Arc<Mutex<Self>>, EspError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Arc::new(Mutex::new(Self {
            wifi,
            client: ClientConfiguration::default(),
            access_point: None,
        })))
    }

    /// Handles for the two roles the radio plays.
    pub fn split(radio: &Arc<Mutex<Self>>) -> (EspStation, EspAccessPoint) {
        (
            EspStation(radio.clone()),
            EspAccessPoint(radio.clone()),
        )
    }

    /// Push the current role mix down to the driver: mixed AP+STA while an
    /// access point is active, station-only otherwise.
    fn apply_configuration(&mut self) -> Result<(), EspError> {
        let config = match &self.access_point {
            Some(ap) => Configuration::Mixed(self.client.clone(), ap.clone()),
            None => Configuration::Client(self.client.clone()),
        };
        self.wifi.set_configuration(&config)
    }
}

fn driver_error(e: EspError) -> WifiError {
    WifiError::Driver(format!("{:?}", e))
}

/// Station-mode handle; the connection manager's driver on device.
pub struct EspStation(Arc<Mutex<EspRadio>>);

impl StationDriver for EspStation {
    fn activate(&mut self) -> Result<(), WifiError> {
        let mut radio = self.0.lock().unwrap();
        // The driver refuses to start without a configuration; connect
        // requests replace the placeholder client half with the real one.
        radio.apply_configuration().map_err(driver_error)?;
        if !radio.wifi.is_started().unwrap_or(false) {
            radio.wifi.start().map_err(driver_error)?;
        }
        Ok(())
    }

    fn request_connect(&mut self, credentials: &Credentials) -> Result<(), WifiError> {
        let auth_method = if credentials.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| WifiError::InvalidCredentials)?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| WifiError::InvalidCredentials)?,
            auth_method,
            ..Default::default()
        };

        let mut radio = self.0.lock().unwrap();
        radio.client = client;
        radio.apply_configuration().map_err(driver_error)?;
        radio.wifi.connect().map_err(driver_error)?;
        radio.wifi.wait_netif_up().map_err(driver_error)?;

        if let Ok(ip_info) = radio.wifi.wifi().sta_netif().get_ip_info() {
            info!("Station up, IP: {}", ip_info.ip);
        }
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.0.lock().unwrap().wifi.is_connected().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        let mut radio = self.0.lock().unwrap();
        if let Err(e) = radio.wifi.disconnect() {
            warn!("WiFi disconnect failed: {:?}", e);
        }
        // Leave the driver running while an access point is active.
        if radio.access_point.is_none() {
            if let Err(e) = radio.wifi.stop() {
                warn!("WiFi stop failed: {:?}", e);
            }
        }
    }
}

/// Access-point handle for the captive portal session.
///
/// ESP-IDF assigns the AP netif 192.168.4.1 by default, matching the portal
/// gateway in [`crate::config::Settings`].
pub struct EspAccessPoint(Arc<Mutex<EspRadio>>);

impl AccessPoint for EspAccessPoint {
    fn start(&mut self, ssid: &str) -> Result<(), WifiError> {
        let ap = AccessPointConfiguration {
            ssid: ssid.try_into().map_err(|_| WifiError::InvalidCredentials)?,
            auth_method: AuthMethod::None,
            ..Default::default()
        };

        let mut radio = self.0.lock().unwrap();
        radio.access_point = Some(ap);
        radio.apply_configuration().map_err(driver_error)?;
        // No wait_netif_up here: in mixed mode it would also wait for a
        // station association that does not exist yet. The AP netif comes
        // up with the driver.
        if !radio.wifi.is_started().unwrap_or(false) {
            radio.wifi.start().map_err(driver_error)?;
        }
        info!("Access point '{}' up", ssid);
        Ok(())
    }

    fn stop(&mut self) {
        let mut radio = self.0.lock().unwrap();
        radio.access_point = None;
        // Shed only the AP half; an association made through the portal
        // must survive the teardown.
        if let Err(e) = radio.apply_configuration() {
            warn!("Access point stop failed: {:?}", e);
        }
    }
}

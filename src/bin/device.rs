//! Countdown device firmware binary.

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = run() {
        log::error!("Device failed: {}", e);
    }

    // Returning from main reboots the chip; park instead so the failure
    // stays on the console.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

#[cfg(feature = "esp32")]
fn run() -> Result<(), Box<dyn std::error::Error>> {
    use countdown_esp32::app::{Application, Platform};
    use countdown_esp32::config::Settings;
    use countdown_esp32::platform::{hardware_seed, spawn_button_watcher, EspClock, EspHttp};
    use countdown_esp32::wifi::EspRadio;
    use esp_idf_hal::gpio::{IOPin, PinDriver, Pull};
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;

    mount_storage()?;

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    let radio = EspRadio::new(peripherals.modem, sysloop)?;
    let (station, access_point) = EspRadio::split(&radio);

    let settings = Settings::default();
    let platform = Platform {
        station: Box::new(station),
        access_point: Box::new(access_point),
        http: Box::new(EspHttp::new()),
        clock: Box::new(EspClock::new()),
        hardware_seed: hardware_seed(),
    };
    let app = Application::new(settings, platform)?;

    // The BOOT button doubles as the user button.
    let mut button = PinDriver::input(peripherals.pins.gpio0.downgrade())?;
    button.set_pull(Pull::Up)?;
    spawn_button_watcher(button, app.classifier());

    app.run()?;
    Ok(())
}

/// Mount the SPIFFS data partition backing every persisted document.
#[cfg(feature = "esp32")]
fn mount_storage() -> Result<(), esp_idf_sys::EspError> {
    let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: std::ptr::null(),
        max_files: 5,
        format_if_mount_failed: true,
    };
    esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) })?;
    log::info!("SPIFFS mounted at /spiffs");
    Ok(())
}

#[cfg(not(feature = "esp32"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("This binary requires the 'esp32' feature.");
    log::info!("Use 'cargo test' for host testing.");
}

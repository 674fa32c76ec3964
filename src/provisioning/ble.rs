//! ESP32 GATT server for BLE provisioning.
//!
//! Thin radio adapter over [`CredentialChannel`]: NimBLE callbacks feed the
//! channel, the channel's status updates flow back out over the notify
//! characteristic, and a button tap confirms the pending payload.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: Provisioning
//! ├── Credentials (Write) - chunked payload, terminated by END
//! ├── Status (Read, Notify) - session status tokens
//! └── Device ID (Read) - full device identity
//! ```

use crate::config::Settings;
use crate::events::{Event, EventBus, Topic};
use crate::identity::DeviceIdentity;
use crate::provisioning::{CredentialChannel, Provisioner, Status, StatusSink};
use esp32_nimble::utilities::mutex::Mutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLECharacteristic, BLEDevice, NimbleProperties};
use log::{info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Bluetooth SIG 16-bit IDs, so stock scanner apps resolve the service
// without a custom UUID table.
const SERVICE_UUID: BleUuid = BleUuid::Uuid16(0x180F);
const CREDENTIALS_CHAR_UUID: BleUuid = BleUuid::Uuid16(0x2A1A);
const STATUS_CHAR_UUID: BleUuid = BleUuid::Uuid16(0x2A1B);
const DEVICE_ID_CHAR_UUID: BleUuid = BleUuid::Uuid16(0x2A1C);

/// How often the session loop expires timeouts and checks for a tap.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Writes status tokens to the notify characteristic.
#[derive(Clone)]
struct NotifySink {
    characteristic: Arc<Mutex<BLECharacteristic>>,
}

impl StatusSink for NotifySink {
    fn notify(&mut self, status: Status) {
        let mut characteristic = self.characteristic.lock();
        characteristic.set_value(status.token());
        characteristic.notify();
    }
}

fn ble_io(context: &str, e: impl std::fmt::Debug) -> io::Error {
    io::Error::other(format!("{}: {:?}", context, e))
}

/// Run one BLE provisioning session until credentials are confirmed and a
/// connection is established.
///
/// Advertises as `<prefix>_<short id>`, serves the GATT service, and loops
/// on the confirmation gate. A peer can retry after `INVALID_FORMAT`,
/// `TIMEOUT`, or `FAILED` without reconnecting, so the loop only exits on
/// success.
pub fn run_session(
    settings: &Settings,
    bus: &Arc<EventBus>,
    provisioner: &Provisioner,
    identity: &DeviceIdentity,
) -> io::Result<bool> {
    publish(bus, Event::EnteringProvisioning);

    let device = BLEDevice::take();
    let server = device.get_server();
    let service = server.create_service(SERVICE_UUID);

    let status_char = service.lock().create_characteristic(
        STATUS_CHAR_UUID,
        NimbleProperties::READ | NimbleProperties::NOTIFY,
    );
    let sink = NotifySink {
        characteristic: status_char,
    };

    let channel = Arc::new(CredentialChannel::new(
        settings.confirmation_window,
        Box::new(sink.clone()),
    ));

    let credentials_char = service
        .lock()
        .create_characteristic(CREDENTIALS_CHAR_UUID, NimbleProperties::WRITE);
    let write_channel = channel.clone();
    credentials_char.lock().on_write(move |args| {
        write_channel.on_write(args.recv_data());
    });

    let id_char = service
        .lock()
        .create_characteristic(DEVICE_ID_CHAR_UUID, NimbleProperties::READ);
    id_char.lock().set_value(identity.id().as_bytes());

    let connect_channel = channel.clone();
    server.on_connect(move |_server, _desc| {
        connect_channel.on_connect();
    });
    let disconnect_channel = channel.clone();
    let advertising = device.get_advertising();
    server.on_disconnect(move |_desc, _reason| {
        disconnect_channel.on_disconnect();
        // Advertising stops when a peer connects; resume for the next one.
        if let Err(e) = advertising.lock().start() {
            warn!("Failed to resume BLE advertising: {:?}", e);
        }
    });

    let name = format!("{}_{}", settings.device_name_prefix, identity.short());
    let advertising = device.get_advertising();
    advertising
        .lock()
        .set_data(
            BLEAdvertisementData::new()
                .name(&name)
                .add_service_uuid(SERVICE_UUID),
        )
        .map_err(|e| ble_io("BLE advertisement data", e))?;
    advertising
        .lock()
        .start()
        .map_err(|e| ble_io("BLE advertising start", e))?;
    info!("BLE provisioning session advertising as '{}'", name);

    // The GPIO path publishes taps on the bus; the loop polls this flag so
    // the connect test runs here rather than in the interrupt path.
    let tapped = Arc::new(AtomicBool::new(false));
    let tap_flag = tapped.clone();
    let subscription = bus.subscribe(
        Topic::ButtonTapped,
        Box::new(move |_| {
            tap_flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
    );

    loop {
        thread::sleep(POLL_INTERVAL);
        channel.poll_timeout();

        if tapped.swap(false, Ordering::SeqCst) {
            let mut sink = sink.clone();
            let connected =
                channel.on_button_tap(|credentials| {
                    provisioner.handle_credentials(credentials, &mut sink)
                });
            if connected {
                break;
            }
        }
    }

    bus.unsubscribe(Topic::ButtonTapped, subscription);
    if let Err(e) = advertising.lock().stop() {
        warn!("Failed to stop BLE advertising: {:?}", e);
    }
    if let Err(e) = BLEDevice::deinit() {
        warn!("Failed to deinit BLE stack: {:?}", e);
    }

    publish(bus, Event::ExitingProvisioning);
    Ok(true)
}

fn publish(bus: &Arc<EventBus>, event: Event) {
    if let Err(e) = bus.publish(&event) {
        warn!("Event delivery aborted: {}", e);
    }
}

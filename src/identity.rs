//! Device identity.
//!
//! A device ID is generated once from hardware-unique bytes plus the current
//! time and a random salt, then persisted for the device's lifetime. It is
//! the API device identifier and part of the BLE/SoftAP session name, and it
//! is never regenerated — factory reset clears credentials and caches but
//! leaves the identity untouched.

use crate::storage;
use log::info;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct IdentityRecord {
    device_id: String,
}

/// Persistent device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// The full identifier string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short form used in advertised session names.
    pub fn short(&self) -> &str {
        &self.id[..self.id.len().min(6)]
    }

    /// Load the persisted identity, or generate and persist a new one.
    ///
    /// `hardware_seed` is a platform-unique byte string (the base MAC on
    /// ESP32). On first boot it is digested together with the wall clock and
    /// a random salt; the hex digest becomes the immutable device ID.
    pub fn load_or_create(path: &Path, hardware_seed: &[u8]) -> io::Result<Self> {
        if let Some(record) = storage::load_json::<IdentityRecord>(path) {
            return Ok(Self {
                id: record.device_id,
            });
        }

        let id = generate_id(hardware_seed);
        storage::save_json(path, &IdentityRecord { device_id: id.clone() })?;
        info!("Generated new device identity: {}", id);
        Ok(Self { id })
    }
}

fn generate_id(hardware_seed: &[u8]) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let now_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(hardware_seed);
    hasher.update(now_nanos.to_le_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();

    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

//! Persisted JSON documents.
//!
//! Every record this device keeps (WiFi credentials, device identity, cached
//! timer snapshot, offline press queue) is a small JSON file that is
//! independently readable and writable. A missing or corrupt file is "no
//! data", never a fatal error; write failures are logged and surfaced as
//! ordinary `io::Error`s that callers treat as "nothing cached".

use crate::wifi::Credentials;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Load a JSON document, returning `None` for a missing or unreadable file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No document at {:?}", path);
            return None;
        }
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            return None;
        }
    };

    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Corrupt document at {:?}: {}", path, e);
            None
        }
    }
}

/// Write a JSON document, creating the parent directory if needed.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, text)
}

/// Delete a document. Deleting a missing file is a no-op.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// File-backed store for the WiFi credential pair.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Persist credentials. Called only after a successful connection test.
    pub fn save(&self, credentials: &Credentials) -> io::Result<()> {
        save_json(&self.path, credentials)?;
        info!("WiFi credentials saved for SSID: {}", credentials.ssid);
        Ok(())
    }

    /// Load the persisted pair, `None` if absent or unreadable.
    pub fn load(&self) -> Option<Credentials> {
        load_json(&self.path)
    }

    /// Pure existence check: no decode, so a corrupt file still means
    /// "saved credentials exist" for the provisioning-vs-reconnect decision.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the persisted pair.
    pub fn clear(&self) -> io::Result<()> {
        remove(&self.path)?;
        info!("WiFi credentials cleared");
        Ok(())
    }
}

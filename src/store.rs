use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use kiosk_model::{Credentials, DeviceIdentity, SetupConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const SETUP_FILE: &str = "setup.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const DEVICE_FILE: &str = "device.json";

/// Reads and writes the JSON documents in the config directory.
///
/// Writers overwrite in place; the sync scripts write the same files from
/// outside the process, so nothing here assumes exclusive access.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

/// Whether bootstrap found a document or had to create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Existing,
    Created,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn setup_path(&self) -> PathBuf {
        self.dir.join(SETUP_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    pub fn device_path(&self) -> PathBuf {
        self.dir.join(DEVICE_FILE)
    }

    pub fn load_setup(&self) -> Result<SetupConfig> {
        read_json(&self.setup_path())
    }

    /// Raw `setup.json`, unknown fields and all, for clients that render it.
    pub fn load_setup_raw(&self) -> Result<serde_json::Value> {
        read_json(&self.setup_path())
    }

    pub fn load_credentials(&self) -> Result<Credentials> {
        read_json(&self.credentials_path())
    }

    pub fn load_device(&self) -> Result<DeviceIdentity> {
        let path = self.device_path();
        let identity: DeviceIdentity = read_json(&path)?;
        identity.validate().map_err(|err| Error::ConfigInvalid {
            path,
            source: err.into(),
        })?;
        Ok(identity)
    }

    /// Creates the config directory and an empty `credentials.json` if absent.
    ///
    /// An existing file is left alone even when it does not parse; the sync
    /// scripts report that on their next run.
    pub fn ensure_credentials(&self) -> Result<Provisioned> {
        fs::create_dir_all(&self.dir)?;
        let path = self.credentials_path();
        if path.exists() {
            debug!(path = %path.display(), "credentials file present");
            return Ok(Provisioned::Existing);
        }
        fs::write(&path, "{}\n")?;
        info!(path = %path.display(), "created empty credentials file");
        Ok(Provisioned::Created)
    }

    /// Startup provisioning of `credentials.json` and `device.json`.
    ///
    /// Only a config directory that cannot be written is fatal. An existing
    /// `device.json` that does not load is logged and left in place; `None`
    /// is returned and `/api/device` reports it until it is repaired.
    pub fn bootstrap(&self, hostname: &str) -> Result<Option<DeviceIdentity>> {
        self.ensure_credentials()?;
        match self.ensure_device_identity(hostname) {
            Ok((identity, _)) => Ok(Some(identity)),
            Err(err @ Error::ConfigInvalid { .. }) => {
                warn!(error = %err, "device identity unusable; continuing without it");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes `device.json` on first startup; later calls only read it back.
    pub fn ensure_device_identity(&self, hostname: &str) -> Result<(DeviceIdentity, Provisioned)> {
        fs::create_dir_all(&self.dir)?;
        let path = self.device_path();
        if path.exists() {
            let identity = self.load_device()?;
            debug!(device_id = %identity.device_id, "device identity present");
            return Ok((identity, Provisioned::Existing));
        }
        let identity = DeviceIdentity::generate(hostname);
        write_json(&path, &identity)?;
        info!(
            device_id = %identity.device_id,
            hostname = %identity.hostname,
            "generated device identity"
        );
        Ok((identity, Provisioned::Created))
    }
}

/// Hostname reported by the OS, or `"unknown"` when it cannot be read.
pub fn system_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy().trim().to_string();
            if name.is_empty() {
                "unknown".to_string()
            } else {
                name
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to read hostname");
            "unknown".to_string()
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::ConfigMissing(path.to_path_buf()));
        }
        Err(err) => {
            return Err(Error::ConfigInvalid {
                path: path.to_path_buf(),
                source: err.into(),
            });
        }
    };
    serde_json::from_str(&raw).map_err(|err| Error::ConfigInvalid {
        path: path.to_path_buf(),
        source: err.into(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    body.push('\n');
    fs::write(path, body)?;
    Ok(())
}

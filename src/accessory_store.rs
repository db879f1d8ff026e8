use serde_derive::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

const ACCESSORY_FILE: &str = "accessory.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access accessory store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("accessory store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity of the exposed accessory, as shown to controllers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessoryInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
}

impl AccessoryInfo {
    pub fn new(name: &str, serial_number: &str) -> Self {
        Self {
            name: name.to_string(),
            manufacturer: "Solarman".to_string(),
            model: "Inverter".to_string(),
            serial_number: serial_number.to_string(),
        }
    }
}

/// On-disk store for the accessory identity.
/// Once an identity is written it is kept across restarts, so controllers see a stable accessory.
pub struct AccessoryStore {
    dir: PathBuf,
}

impl AccessoryStore {
    /// Opens the store, creating its directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn file(&self) -> PathBuf {
        self.dir.join(ACCESSORY_FILE)
    }

    pub fn load(&self) -> Result<Option<AccessoryInfo>, StoreError> {
        let path = self.file();
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    pub fn save(&self, info: &AccessoryInfo) -> Result<(), StoreError> {
        let path = self.file();
        let contents = serde_json::to_vec_pretty(info).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, contents).map_err(|source| StoreError::Io { path, source })
    }

    /// Returns the stored identity, or stores and returns `default` on first start.
    /// A stored identity for a different serial number is replaced.
    pub fn load_or_create(&self, default: AccessoryInfo) -> Result<AccessoryInfo, StoreError> {
        match self.load()? {
            Some(info) if info.serial_number == default.serial_number => Ok(info),
            _ => {
                info!(
                    name = %default.name,
                    serial_number = %default.serial_number,
                    "storing new accessory identity"
                );
                self.save(&default)?;
                Ok(default)
            }
        }
    }
}

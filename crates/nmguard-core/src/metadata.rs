//! Connection Metadata
//!
//! Two small records survive between runs:
//!
//! | Record            | Used for                                 |
//! |-------------------|------------------------------------------|
//! | current           | status display of the live connection    |
//! | last connection   | reconnecting to the same server later    |
//!
//! The backend is picked from config: JSON files on disk, or an
//! in-memory store for tests and throwaway sessions.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const CONNECTION_FILE: &str = "connection_metadata.json";
const LAST_CONNECTION_FILE: &str = "last_connection_metadata.json";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed metadata: {0}")]
    Parse(String),

    #[error("No server IP recorded for the last connection")]
    MissingServerIp,
}

/// The live connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_server: Option<String>,
    /// Unix seconds, as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_server_ip: Option<String>,
}

/// What the next reconnect needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastConnectionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connect_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_server_ip: Option<String>,
}

/// Which store to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum MetadataBackend {
    JsonFiles {
        #[serde(default = "default_metadata_dir")]
        dir: PathBuf,
    },
    Memory,
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("/var/lib/nmguard")
}

impl Default for MetadataBackend {
    fn default() -> Self {
        MetadataBackend::JsonFiles {
            dir: default_metadata_dir(),
        }
    }
}

impl MetadataBackend {
    pub fn open(&self) -> Arc<dyn MetadataStore> {
        match self {
            MetadataBackend::JsonFiles { dir } => {
                info!("Using JSON metadata store in {}", dir.display());
                Arc::new(JsonFileStore::new(dir))
            }
            MetadataBackend::Memory => {
                info!("Using in-memory metadata store");
                Arc::new(MemoryStore::default())
            }
        }
    }
}

/// Persistence of the two metadata records.
///
/// Backends only load and store whole records; the `save_*` helpers are
/// shared.
pub trait MetadataStore: Send + Sync {
    fn current_connection(&self) -> Result<ConnectionMetadata, MetadataError>;

    fn last_connection(&self) -> Result<LastConnectionMetadata, MetadataError>;

    fn store_current(&self, metadata: &ConnectionMetadata) -> Result<(), MetadataError>;

    fn store_last(&self, metadata: &LastConnectionMetadata) -> Result<(), MetadataError>;

    /// Forget both records
    fn clear(&self) -> Result<(), MetadataError>;

    /// Recorded in both records
    fn save_servername(&self, servername: &str) -> Result<(), MetadataError> {
        info!("Saving servername \"{}\"", servername);
        let mut current = self.current_connection()?;
        let mut last = self.last_connection()?;
        current.connected_server = Some(servername.to_string());
        last.connected_server = Some(servername.to_string());
        self.store_current(&current)?;
        self.store_last(&last)
    }

    /// Recorded in both records
    fn save_protocol(&self, protocol: &str) -> Result<(), MetadataError> {
        info!("Saving protocol \"{}\"", protocol);
        let mut current = self.current_connection()?;
        let mut last = self.last_connection()?;
        current.connected_protocol = Some(protocol.to_string());
        last.connected_protocol = Some(protocol.to_string());
        self.store_current(&current)?;
        self.store_last(&last)
    }

    /// Exit IP shown to the user
    fn save_display_server_ip(&self, ip: &str) -> Result<(), MetadataError> {
        info!("Saving exit server IP \"{}\"", ip);
        let mut current = self.current_connection()?;
        current.display_server_ip = Some(ip.to_string());
        self.store_current(&current)?;

        let mut last = self.last_connection()?;
        last.display_server_ip = Some(ip.to_string());
        self.store_last(&last)
    }

    /// Entry IP the tunnel connects to
    fn save_server_ip(&self, ip: &str) -> Result<(), MetadataError> {
        info!("Saving server IP \"{}\"", ip);
        let mut last = self.last_connection()?;
        last.last_connect_ip = Some(ip.to_string());
        self.store_last(&last)
    }

    fn save_connect_time(&self) -> Result<(), MetadataError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut current = self.current_connection()?;
        current.connected_time = Some(now.to_string());
        self.store_current(&current)?;
        debug!(now, "Saved connected time");
        Ok(())
    }

    /// Entry IP of the last connection
    fn server_ip(&self) -> Result<Ipv4Addr, MetadataError> {
        let ip = self
            .last_connection()?
            .last_connect_ip
            .ok_or(MetadataError::MissingServerIp)?;
        ip.parse()
            .map_err(|_| MetadataError::Parse(format!("invalid server IP {:?}", ip)))
    }
}

/// One JSON file per record under a directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn read<T>(&self, file: &str) -> Result<T, MetadataError>
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        let path = self.path(file);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| MetadataError::Parse(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write<T: Serialize>(&self, file: &str, value: &T) -> Result<(), MetadataError> {
        fs::create_dir_all(&self.dir)?;
        let content =
            serde_json::to_string(value).map_err(|e| MetadataError::Parse(e.to_string()))?;
        fs::write(self.path(file), content)?;
        debug!("Saved metadata to {}", file);
        Ok(())
    }

    fn remove(&self, file: &str) -> Result<(), MetadataError> {
        match fs::remove_file(self.path(file)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl MetadataStore for JsonFileStore {
    fn current_connection(&self) -> Result<ConnectionMetadata, MetadataError> {
        self.read(CONNECTION_FILE)
    }

    fn last_connection(&self) -> Result<LastConnectionMetadata, MetadataError> {
        self.read(LAST_CONNECTION_FILE)
    }

    fn store_current(&self, metadata: &ConnectionMetadata) -> Result<(), MetadataError> {
        self.write(CONNECTION_FILE, metadata)
    }

    fn store_last(&self, metadata: &LastConnectionMetadata) -> Result<(), MetadataError> {
        self.write(LAST_CONNECTION_FILE, metadata)
    }

    fn clear(&self) -> Result<(), MetadataError> {
        info!("Removing connection metadata");
        self.remove(CONNECTION_FILE)?;
        self.remove(LAST_CONNECTION_FILE)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<(ConnectionMetadata, LastConnectionMetadata)>,
}

impl MemoryStore {
    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, (ConnectionMetadata, LastConnectionMetadata)> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetadataStore for MemoryStore {
    fn current_connection(&self) -> Result<ConnectionMetadata, MetadataError> {
        Ok(self.lock().0.clone())
    }

    fn last_connection(&self) -> Result<LastConnectionMetadata, MetadataError> {
        Ok(self.lock().1.clone())
    }

    fn store_current(&self, metadata: &ConnectionMetadata) -> Result<(), MetadataError> {
        self.lock().0 = metadata.clone();
        Ok(())
    }

    fn store_last(&self, metadata: &LastConnectionMetadata) -> Result<(), MetadataError> {
        self.lock().1 = metadata.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), MetadataError> {
        *self.lock() = Default::default();
        Ok(())
    }
}

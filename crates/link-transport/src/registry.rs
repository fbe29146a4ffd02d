use crate::{Result, TransportError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

/// The port the transport currently holds open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub path: String,
    pub baud_rate: u32,
    pub driver: String,
    /// RFC 3339 UTC.
    pub opened_at: String,
}

impl PortRecord {
    pub fn now(path: &str, baud_rate: u32, driver: &str) -> Self {
        let opened_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        Self {
            path: path.to_string(),
            baud_rate,
            driver: driver.to_string(),
            opened_at,
        }
    }
}

/// Where the transport records which port is active, so other processes
/// (and a restarted daemon) can see it.
pub trait PortRegistry: Send + Sync {
    fn set_active(&self, record: &PortRecord) -> Result<()>;
    fn clear_active(&self) -> Result<()>;
    fn active(&self) -> Option<PortRecord>;
}

#[derive(Default)]
pub struct MemoryPortRegistry {
    active: RwLock<Option<PortRecord>>,
}

impl MemoryPortRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortRegistry for MemoryPortRegistry {
    fn set_active(&self, record: &PortRecord) -> Result<()> {
        *self.active.write() = Some(record.clone());
        Ok(())
    }

    fn clear_active(&self) -> Result<()> {
        *self.active.write() = None;
        Ok(())
    }

    fn active(&self) -> Option<PortRecord> {
        self.active.read().clone()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryFile {
    active: Option<PortRecord>,
}

/// JSON file registry, rewritten atomically on each change.
pub struct FilePortRegistry {
    path: PathBuf,
    cached: RwLock<Option<PortRecord>>,
}

impl FilePortRegistry {
    /// Open (or lazily create) the registry file. A record left by a
    /// previous process is loaded but treated as stale information only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cached = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<RegistryFile>(&text)
                .map_err(|e| TransportError::Registry(format!("{}: {e}", path.display())))?
                .active,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(TransportError::Registry(e.to_string())),
        };
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    fn write(&self, active: Option<PortRecord>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| TransportError::Registry(e.to_string()))?;
            }
        }
        let body = serde_json::to_string_pretty(&RegistryFile {
            active: active.clone(),
        })
        .map_err(|e| TransportError::Registry(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| TransportError::Registry(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| TransportError::Registry(e.to_string()))?;
        debug!(path = %self.path.display(), "port registry updated");
        *self.cached.write() = active;
        Ok(())
    }
}

impl PortRegistry for FilePortRegistry {
    fn set_active(&self, record: &PortRecord) -> Result<()> {
        self.write(Some(record.clone()))
    }

    fn clear_active(&self) -> Result<()> {
        self.write(None)
    }

    fn active(&self) -> Option<PortRecord> {
        self.cached.read().clone()
    }
}

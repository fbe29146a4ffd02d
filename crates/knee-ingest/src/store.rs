//! Persistence capability for readings and session summaries.
//!
//! The backend is chosen from configuration at startup; callers only see
//! `Arc<dyn ReadingStore>`.

use crate::{IngestError, Result, SessionState};
use async_trait::async_trait;
use knee_protocol::TelemetryFrame;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A persisted telemetry frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(flatten)]
    pub frame: TelemetryFrame,
}

impl StoredReading {
    pub fn new(frame: TelemetryFrame) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: OffsetDateTime::now_utc(),
            frame,
        }
    }
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn create_reading(&self, frame: &TelemetryFrame) -> Result<StoredReading>;

    /// Insert or replace the summary for `session.session_id`.
    async fn save_session(&self, session: &SessionState) -> Result<()>;

    async fn session(&self, session_id: &str) -> Result<Option<SessionState>>;

    /// All stored readings for one session, oldest first.
    async fn readings_by_session(&self, session_id: &str) -> Result<Vec<StoredReading>>;

    /// Up to `limit` most recent readings, newest first.
    async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory {
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
    },
    Jsonl {
        dir: PathBuf,
    },
}

fn default_memory_capacity() -> usize {
    10_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            capacity: default_memory_capacity(),
        }
    }
}

pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ReadingStore>> {
    match config {
        StoreConfig::Memory { capacity } => {
            info!(capacity, "using in-memory reading store");
            Ok(Arc::new(MemoryStore::new(*capacity)))
        }
        StoreConfig::Jsonl { dir } => {
            info!(dir = %dir.display(), "using JSON lines reading store");
            Ok(Arc::new(JsonlStore::open(dir).await?))
        }
    }
}

/// Bounded in-memory ring of readings; oldest readings are evicted first.
pub struct MemoryStore {
    capacity: usize,
    readings: RwLock<VecDeque<StoredReading>>,
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            readings: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.read().is_empty()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn create_reading(&self, frame: &TelemetryFrame) -> Result<StoredReading> {
        let reading = StoredReading::new(frame.clone());
        let mut readings = self.readings.write();
        readings.push_back(reading.clone());
        while readings.len() > self.capacity {
            readings.pop_front();
        }
        Ok(reading)
    }

    async fn save_session(&self, session: &SessionState) -> Result<()> {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionState>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn readings_by_session(&self, session_id: &str) -> Result<Vec<StoredReading>> {
        Ok(self
            .readings
            .read()
            .iter()
            .filter(|r| r.frame.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
        Ok(self.readings.read().iter().rev().take(limit).cloned().collect())
    }
}

const READINGS_FILE: &str = "readings.jsonl";
const SESSIONS_FILE: &str = "sessions.jsonl";

/// Append-only JSON lines files under one directory. Session summaries are
/// appended on every save; the last record for an id wins on read.
pub struct JsonlStore {
    dir: PathBuf,
    readings: tokio::sync::Mutex<tokio::fs::File>,
    sessions: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IngestError::Store(format!("{}: {e}", dir.display())))?;
        let readings = open_append(&dir.join(READINGS_FILE)).await?;
        let sessions = open_append(&dir.join(SESSIONS_FILE)).await?;
        Ok(Self {
            dir,
            readings: tokio::sync::Mutex::new(readings),
            sessions: tokio::sync::Mutex::new(sessions),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IngestError::Store(format!("{}: {e}", path.display()))),
        };
        let mut out = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(v) => out.push(v),
                // A torn final write must not make the whole file unreadable.
                Err(e) => warn!(file, line = idx + 1, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| IngestError::Store(format!("{}: {e}", path.display())))
}

async fn append_line<T: Serialize>(file: &tokio::sync::Mutex<tokio::fs::File>, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value).map_err(|e| IngestError::Store(e.to_string()))?;
    line.push(b'\n');
    let mut f = file.lock().await;
    f.write_all(&line)
        .await
        .map_err(|e| IngestError::Store(e.to_string()))?;
    f.flush().await.map_err(|e| IngestError::Store(e.to_string()))
}

#[async_trait]
impl ReadingStore for JsonlStore {
    async fn create_reading(&self, frame: &TelemetryFrame) -> Result<StoredReading> {
        let reading = StoredReading::new(frame.clone());
        append_line(&self.readings, &reading).await?;
        Ok(reading)
    }

    async fn save_session(&self, session: &SessionState) -> Result<()> {
        append_line(&self.sessions, session).await?;
        debug!(session = %session.session_id, "session summary saved");
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionState>> {
        let all: Vec<SessionState> = self.load(SESSIONS_FILE).await?;
        Ok(all.into_iter().rev().find(|s| s.session_id == session_id))
    }

    async fn readings_by_session(&self, session_id: &str) -> Result<Vec<StoredReading>> {
        let all: Vec<StoredReading> = self.load(READINGS_FILE).await?;
        Ok(all
            .into_iter()
            .filter(|r| r.frame.session_id == session_id)
            .collect())
    }

    async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
        let all: Vec<StoredReading> = self.load(READINGS_FILE).await?;
        Ok(all.into_iter().rev().take(limit).collect())
    }
}

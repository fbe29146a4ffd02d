use crate::StoreConfig;
use anyhow::Context;
use link_transport::LinkConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: crate::hub::DEFAULT_HUB_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Forwarding is disabled when no endpoint is configured.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    /// Forward every Nth accepted frame as `sensor_data`; 0 disables.
    pub sensor_data_every: u64,
    /// Readings between recommendation requests; 0 disables.
    pub recommendation_every: u64,
    pub recent_window: usize,
    pub queue_capacity: usize,
    pub health_interval_s: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5_000,
            sensor_data_every: 1,
            recommendation_every: 50,
            recent_window: 20,
            queue_capacity: 256,
            health_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub link: LinkConfig,
    pub hub: HubConfig,
    pub store: StoreConfig,
    pub analytics: AnalyticsConfig,
    /// Readings and summaries waiting to be written.
    pub persist_queue: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            hub: HubConfig::default(),
            store: StoreConfig::default(),
            analytics: AnalyticsConfig::default(),
            persist_queue: 4096,
        }
    }
}

impl IngestConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("decoding ingest config")
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<IngestConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    IngestConfig::from_yaml_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))
}

//! knee-ingest: host side of the knee sensor system
//!
//! Takes lines from a [`link_transport::LinkTransport`], classifies them, and
//! fans each valid frame out to live subscribers, the session coordinator,
//! persistence and the analytics endpoint. None of the downstreams can stall
//! ingestion.

mod error;
pub use error::{IngestError, Result};

mod events;
pub use events::{ErrorEvent, ErrorKind, LinkStatus, LiveEvent, StatusReport};

pub mod hub;
pub use hub::{LiveHub, Subscription};

mod session;
pub use session::{SessionCoordinator, SessionState};

mod store;
pub use store::{open_store, JsonlStore, MemoryStore, ReadingStore, StoreConfig, StoredReading};

mod analytics;
pub use analytics::{AnalyticsRequest, AnalyticsSink, HttpAnalytics, Recommendation};

pub mod metrics;
pub use metrics::MetricsHub;

mod config;
pub use config::{load_config, AnalyticsConfig, HubConfig, IngestConfig};

mod pipeline;
pub use pipeline::{validate_mode, validate_session_id, Pipeline, PipelineDeps, MAX_SESSION_ID_LEN};

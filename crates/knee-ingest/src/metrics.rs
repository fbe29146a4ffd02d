use crate::{IngestError, Result};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct IngestMetrics {
    pub frames_received: IntCounter,
    pub parse_errors: IntCounter,
    pub persist_dropped: IntCounter,
    pub analytics_dropped: IntCounter,
    pub analytics_failures: IntCounter,
    pub sessions_started: IntCounter,
    pub link_connected: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub ingest: IngestMetrics,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::new(name, help).map_err(|e| IngestError::Metrics(e.to_string()))
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let ingest = IngestMetrics {
            frames_received: counter("kt_frames_received", "Valid telemetry frames dispatched")?,
            parse_errors: counter("kt_parse_errors", "Device lines rejected by the parser")?,
            persist_dropped: counter(
                "kt_persist_dropped",
                "Readings dropped because the persistence queue was full",
            )?,
            analytics_dropped: counter(
                "kt_analytics_dropped",
                "Analytics requests dropped because the queue was full",
            )?,
            analytics_failures: counter(
                "kt_analytics_failures",
                "Analytics requests that failed or timed out",
            )?,
            sessions_started: counter("kt_sessions_started", "Sessions opened")?,
            link_connected: IntGauge::new("kt_link_connected", "1 while the sensor link is open")
                .map_err(|e| IngestError::Metrics(e.to_string()))?,
        };
        let m = &ingest;
        for c in [
            &m.frames_received,
            &m.parse_errors,
            &m.persist_dropped,
            &m.analytics_dropped,
            &m.analytics_failures,
            &m.sessions_started,
        ] {
            let _ = registry.register(Box::new(c.clone()));
        }
        let _ = registry.register(Box::new(m.link_connected.clone()));
        Ok(Self { registry, ingest })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

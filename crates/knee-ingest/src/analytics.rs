//! Client side of the analytics endpoint contract.

use crate::{IngestError, Result, SessionState};
use async_trait::async_trait;
use imu_fusion::ExerciseMode;
use knee_protocol::TelemetryFrame;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

/// Body of one POST, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AnalyticsRequest {
    SensorData {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        data: TelemetryFrame,
    },
    RecommendationRequest {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        session_id: String,
        exercise_mode: ExerciseMode,
        recent_readings: Vec<TelemetryFrame>,
        reading_count: u64,
        max_angle: f32,
        mean_angle: f64,
    },
    SessionComplete {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        session: SessionState,
    },
    HealthCheck {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
}

impl AnalyticsRequest {
    pub fn sensor_data(frame: TelemetryFrame) -> Self {
        AnalyticsRequest::SensorData {
            timestamp: OffsetDateTime::now_utc(),
            data: frame,
        }
    }

    pub fn recommendation(session: &SessionState, recent: Vec<TelemetryFrame>) -> Self {
        AnalyticsRequest::RecommendationRequest {
            timestamp: OffsetDateTime::now_utc(),
            session_id: session.session_id.clone(),
            exercise_mode: session.exercise_mode,
            recent_readings: recent,
            reading_count: session.reading_count,
            max_angle: session.max_angle,
            mean_angle: session.mean_angle,
        }
    }

    pub fn session_complete(session: SessionState) -> Self {
        AnalyticsRequest::SessionComplete {
            timestamp: OffsetDateTime::now_utc(),
            session,
        }
    }

    pub fn health_check() -> Self {
        AnalyticsRequest::HealthCheck {
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnalyticsRequest::SensorData { .. } => "sensor_data",
            AnalyticsRequest::RecommendationRequest { .. } => "recommendation_request",
            AnalyticsRequest::SessionComplete { .. } => "session_complete",
            AnalyticsRequest::HealthCheck { .. } => "health_check",
        }
    }

    /// Session the request concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AnalyticsRequest::SensorData { data, .. } => Some(&data.session_id),
            AnalyticsRequest::RecommendationRequest { session_id, .. } => Some(session_id),
            AnalyticsRequest::SessionComplete { session, .. } => Some(&session.session_id),
            AnalyticsRequest::HealthCheck { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub status: String,
    pub priority: String,
}

#[derive(Debug, Default, Deserialize)]
struct AnalyticsResponse {
    #[serde(default)]
    recommendations: Option<Vec<Recommendation>>,
}

/// Where analytics requests go. Returns any recommendations in the reply.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn post(&self, request: &AnalyticsRequest) -> Result<Vec<Recommendation>>;
}

/// JSON over HTTP with a bounded per-request timeout.
pub struct HttpAnalytics {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAnalytics {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Analytics(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalytics {
    async fn post(&self, request: &AnalyticsRequest) -> Result<Vec<Recommendation>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| IngestError::Analytics(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IngestError::Analytics(format!("{status}: {text}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| IngestError::Analytics(e.to_string()))?;
        Ok(parse_recommendations(&body))
    }
}

/// A 2xx body without a usable `recommendations` array means "none".
fn parse_recommendations(body: &[u8]) -> Vec<Recommendation> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }
    match serde_json::from_slice::<AnalyticsResponse>(body) {
        Ok(r) => r.recommendations.unwrap_or_default(),
        Err(e) => {
            debug!(error = %e, "analytics reply carried no recommendations");
            Vec::new()
        }
    }
}

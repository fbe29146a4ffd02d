use crate::{IngestError, Result};
use imu_fusion::ExerciseMode;
use knee_protocol::TelemetryFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

/// One recording interval and its running aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub exercise_mode: ExerciseMode,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    pub reading_count: u64,
    pub max_angle: f32,
    pub mean_angle: f64,
    pub is_active: bool,
}

impl SessionState {
    fn open(session_id: &str, exercise_mode: ExerciseMode) -> Self {
        Self {
            session_id: session_id.to_string(),
            exercise_mode,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            reading_count: 0,
            max_angle: 0.0,
            mean_angle: 0.0,
            is_active: true,
        }
    }

    fn absorb(&mut self, angle: f32) {
        let n = self.reading_count as f64;
        self.mean_angle = (self.mean_angle * n + angle as f64) / (n + 1.0);
        if self.reading_count == 0 || angle > self.max_angle {
            self.max_angle = angle;
        }
        self.reading_count += 1;
    }
}

/// Holds the single active session, if any.
#[derive(Default)]
pub struct SessionCoordinator {
    active: Mutex<Option<SessionState>>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. Fails with `Conflict` while another is active and
    /// leaves that session untouched.
    pub fn start(&self, session_id: &str, mode: ExerciseMode) -> Result<SessionState> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(IngestError::Conflict {
                active: current.session_id.clone(),
            });
        }
        let state = SessionState::open(session_id, mode);
        info!(session = session_id, %mode, "session started");
        *active = Some(state.clone());
        Ok(state)
    }

    /// Fold one frame into the active session's aggregates. Frames for any
    /// other session id are ignored. Returns the new reading count.
    pub fn record_reading(&self, frame: &TelemetryFrame) -> Option<u64> {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(s) if s.session_id == frame.session_id => {
                s.absorb(frame.knee_angle);
                Some(s.reading_count)
            }
            _ => {
                debug!(session = %frame.session_id, "reading outside the active session");
                None
            }
        }
    }

    /// Close the active session and return its final summary.
    pub fn stop(&self) -> Option<SessionState> {
        let mut state = self.active.lock().take()?;
        state.end_time = Some(OffsetDateTime::now_utc());
        state.is_active = false;
        info!(
            session = %state.session_id,
            readings = state.reading_count,
            max = state.max_angle,
            mean = state.mean_angle,
            "session stopped"
        );
        Some(state)
    }

    /// Drop the active session without a summary, only if it is `session_id`.
    pub fn abort(&self, session_id: &str) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().map(|s| s.session_id == session_id) == Some(true) {
            *active = None;
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> Option<SessionState> {
        self.active.lock().clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|s| s.session_id.clone())
    }
}

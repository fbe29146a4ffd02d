use crate::{Result, SensorSource};
use imu_fusion::{
    ExerciseMode, FilterConfig, OrientationEstimator, RawSample, TempCalibration,
    DEFAULT_CALIBRATION_SAMPLES,
};
use knee_protocol::{Command, DeviceMessage, DeviceStatus, TelemetryFrame};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use knee_protocol::tags::CALIBRATION_FAILED;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed loop period.
    pub tick_ms: u64,
    pub calibration_samples: usize,
    pub alpha: f32,
    pub min_dt_s: f32,
    #[serde(default)]
    pub temperature: TempCalibration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES,
            alpha: imu_fusion::DEFAULT_ALPHA,
            min_dt_s: imu_fusion::DEFAULT_MIN_DT_S,
            temperature: TempCalibration::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording { session_id: String },
}

/// The firmware control loop with its state made explicit.
///
/// Commands are only observed between ticks (see [`DeviceEngine::step`]), so
/// a calibration blocks telemetry and command intake for its duration.
pub struct DeviceEngine<S> {
    sensor: S,
    estimator: OrientationEstimator,
    state: RecordingState,
    mode: ExerciseMode,
    last_tick_ms: Option<u64>,
    config: EngineConfig,
}

impl<S: SensorSource> DeviceEngine<S> {
    pub fn new(sensor: S, config: EngineConfig) -> Result<Self> {
        let filter = FilterConfig {
            alpha: config.alpha,
            min_dt_s: config.min_dt_s,
        };
        let estimator = OrientationEstimator::new(filter, config.temperature)?;
        Ok(Self {
            sensor,
            estimator,
            state: RecordingState::Idle,
            mode: ExerciseMode::default(),
            last_tick_ms: None,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &RecordingState {
        &self.state
    }

    pub fn mode(&self) -> ExerciseMode {
        self.mode
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecordingState::Recording { .. })
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            recording: self.is_recording(),
            session_id: match &self.state {
                RecordingState::Recording { session_id } => Some(session_id.clone()),
                RecordingState::Idle => None,
            },
            exercise_mode: self.mode,
        }
    }

    /// Power-on sequence: calibrate, then announce readiness.
    pub fn boot(&mut self) -> Vec<DeviceMessage> {
        let mut out = self.calibrate();
        out.push(DeviceMessage::SystemReady);
        out
    }

    /// One cooperative loop iteration: drain pending command lines, then tick.
    pub fn step<I>(&mut self, now_ms: u64, pending: I) -> Vec<DeviceMessage>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut out = Vec::new();
        for line in pending {
            out.extend(self.handle_line(line.as_ref()));
        }
        if let Some(frame) = self.tick(now_ms) {
            out.push(frame);
        }
        out
    }

    /// Parse and apply one host line. Unrecognised input is logged and ignored.
    pub fn handle_line(&mut self, line: &str) -> Vec<DeviceMessage> {
        match Command::parse(line) {
            Ok(cmd) => self.handle_command(cmd),
            Err(knee_protocol::ProtocolError::Empty) => Vec::new(),
            Err(e) => {
                warn!(line, error = %e, "ignoring command");
                Vec::new()
            }
        }
    }

    pub fn handle_command(&mut self, cmd: Command) -> Vec<DeviceMessage> {
        debug!(?cmd, "command");
        match cmd {
            Command::StartSession(session_id) => {
                info!(session = %session_id, mode = %self.mode, "recording started");
                self.state = RecordingState::Recording {
                    session_id: session_id.clone(),
                };
                vec![DeviceMessage::SessionStarted(session_id)]
            }
            Command::StopSession => {
                if let RecordingState::Recording { session_id } = &self.state {
                    info!(session = %session_id, "recording stopped");
                }
                self.state = RecordingState::Idle;
                vec![DeviceMessage::SessionStopped]
            }
            Command::SetExercise(code) => {
                match ExerciseMode::from_code(code) {
                    Some(mode) => {
                        self.mode = mode;
                        info!(%mode, "exercise mode set");
                    }
                    None => warn!(code, "ignoring unknown exercise mode"),
                }
                Vec::new()
            }
            Command::Calibrate => self.calibrate(),
            Command::GetStatus => vec![DeviceMessage::Status(self.status())],
        }
    }

    /// Run a blocking calibration capture. Session state is untouched.
    pub fn calibrate(&mut self) -> Vec<DeviceMessage> {
        let mut out = vec![DeviceMessage::Calibrating];
        let n = self.config.calibration_samples;
        let mut samples: Vec<RawSample> = Vec::with_capacity(n);
        for _ in 0..n {
            match self.sensor.read() {
                Ok(s) => samples.push(s),
                Err(e) => {
                    warn!(error = %e, "calibration aborted, keeping previous offsets");
                    out.push(DeviceMessage::Diagnostic(format!("{CALIBRATION_FAILED}{e}")));
                    return out;
                }
            }
        }
        match self.estimator.calibrate(samples) {
            Ok(_) => {
                // The capture took real time; do not integrate across it.
                self.last_tick_ms = None;
                out.push(DeviceMessage::CalibrationComplete);
            }
            Err(e) => {
                warn!(error = %e, "calibration rejected, keeping previous offsets");
                out.push(DeviceMessage::Diagnostic(format!("{CALIBRATION_FAILED}{e}")));
            }
        }
        out
    }

    /// Read, fuse, and emit one telemetry frame if recording.
    pub fn tick(&mut self, now_ms: u64) -> Option<DeviceMessage> {
        let sample = match self.sensor.read() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "sensor read failed");
                return None;
            }
        };
        let dt_s = match self.last_tick_ms {
            Some(prev) => now_ms.saturating_sub(prev) as f32 / 1000.0,
            None => self.config.tick_ms as f32 / 1000.0,
        };
        self.last_tick_ms = Some(now_ms);

        let estimate = self.estimator.tick(&sample, dt_s, self.mode.code());
        match &self.state {
            RecordingState::Recording { session_id } => {
                Some(DeviceMessage::Telemetry(TelemetryFrame::from_estimate(
                    session_id, now_ms, self.mode, &sample, &estimate,
                )))
            }
            RecordingState::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SensorError, SimulatedImu};
    use imu_fusion::Axes;

    struct FlakySensor {
        fail_after: usize,
        reads: usize,
    }

    impl SensorSource for FlakySensor {
        fn read(&mut self) -> std::result::Result<RawSample, SensorError> {
            self.reads += 1;
            if self.reads > self.fail_after {
                return Err(SensorError::NotResponding);
            }
            Ok(RawSample {
                accel: Axes::new(0.0, 0.0, 1.0),
                gyro: Axes::ZERO,
                temp_raw: 0,
            })
        }
    }

    fn engine() -> DeviceEngine<SimulatedImu> {
        let cfg = EngineConfig {
            calibration_samples: 20,
            ..Default::default()
        };
        DeviceEngine::new(SimulatedImu::stationary(7), cfg).unwrap()
    }

    #[test]
    fn test_boot_calibrates_then_ready() {
        let mut e = engine();
        let out = e.boot();
        assert_eq!(
            out,
            vec![
                DeviceMessage::Calibrating,
                DeviceMessage::CalibrationComplete,
                DeviceMessage::SystemReady
            ]
        );
    }

    #[test]
    fn test_idle_emits_nothing() {
        let mut e = engine();
        assert!(e.tick(50).is_none());
        assert!(e.step(100, Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_start_record_stop() {
        let mut e = engine();
        let out = e.step(0, ["START_SESSION:s1"]);
        assert_eq!(out[0], DeviceMessage::SessionStarted("s1".into()));
        assert!(matches!(out[1], DeviceMessage::Telemetry(_)));

        for t in 1..5u64 {
            match e.tick(t * 50) {
                Some(DeviceMessage::Telemetry(f)) => {
                    assert_eq!(f.session_id, "s1");
                    assert_eq!(f.timestamp, t * 50);
                    assert!(f.validate().is_ok());
                }
                other => panic!("expected telemetry, got {other:?}"),
            }
        }

        let out = e.step(300, ["STOP_SESSION"]);
        assert_eq!(out, vec![DeviceMessage::SessionStopped]);
        assert!(!e.is_recording());
    }

    #[test]
    fn test_stop_when_idle_still_acknowledges() {
        let mut e = engine();
        assert_eq!(
            e.handle_command(Command::StopSession),
            vec![DeviceMessage::SessionStopped]
        );
    }

    #[test]
    fn test_set_exercise_keeps_session() {
        let mut e = engine();
        e.handle_line("START_SESSION:abc");
        e.handle_line("SET_EXERCISE:2");
        assert_eq!(e.mode(), ExerciseMode::Lateral);
        assert!(e.is_recording());
        e.handle_line("SET_EXERCISE:9");
        assert_eq!(e.mode(), ExerciseMode::Lateral);
        match e.tick(10) {
            Some(DeviceMessage::Telemetry(f)) => assert_eq!(f.exercise_mode, 2),
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn test_status_reply() {
        let mut e = engine();
        e.handle_line("SET_EXERCISE:1");
        e.handle_line("START_SESSION:visit-3");
        let out = e.handle_line("GET_STATUS");
        assert_eq!(
            out,
            vec![DeviceMessage::Status(DeviceStatus {
                recording: true,
                session_id: Some("visit-3".into()),
                exercise_mode: ExerciseMode::Extension,
            })]
        );
    }

    #[test]
    fn test_unknown_command_ignored() {
        let mut e = engine();
        assert!(e.handle_line("REBOOT").is_empty());
        assert!(e.handle_line("").is_empty());
        assert!(!e.is_recording());
    }

    #[test]
    fn test_calibration_does_not_touch_session() {
        let mut e = engine();
        e.handle_line("START_SESSION:keep");
        let out = e.handle_line("CALIBRATE");
        assert_eq!(
            out,
            vec![DeviceMessage::Calibrating, DeviceMessage::CalibrationComplete]
        );
        assert_eq!(
            e.state(),
            &RecordingState::Recording {
                session_id: "keep".into()
            }
        );
    }

    #[test]
    fn test_calibration_failure_reports_diagnostic() {
        let cfg = EngineConfig {
            calibration_samples: 10,
            ..Default::default()
        };
        let mut e = DeviceEngine::new(
            FlakySensor {
                fail_after: 5,
                reads: 0,
            },
            cfg,
        )
        .unwrap();
        let out = e.calibrate();
        assert_eq!(out[0], DeviceMessage::Calibrating);
        match &out[1] {
            DeviceMessage::Diagnostic(text) => assert!(text.starts_with(CALIBRATION_FAILED)),
            other => panic!("expected diagnostic, got {other:?}"),
        }
    }

    #[test]
    fn test_moving_leg_produces_bounded_angles() {
        let cfg = EngineConfig {
            calibration_samples: 20,
            ..Default::default()
        };
        let imu = SimulatedImu::new(3, 0.05).with_still_samples(20);
        let mut e = DeviceEngine::new(imu, cfg).unwrap();
        e.boot();
        e.handle_line("SET_EXERCISE:1");
        e.handle_line("START_SESSION:walk");
        for i in 0..400u64 {
            if let Some(DeviceMessage::Telemetry(f)) = e.tick(i * 50) {
                assert!(f.validate().is_ok());
                assert!((0.0..=160.0).contains(&f.knee_angle));
                assert!((-180.0..=180.0).contains(&f.pitch));
            }
        }
    }
}

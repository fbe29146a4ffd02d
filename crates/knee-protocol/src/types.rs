use crate::{ProtocolError, Result};
use imu_fusion::{Estimate, ExerciseMode, RawSample};
use serde::{Deserialize, Serialize};

/// One telemetry record as it crosses every boundary in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub session_id: String,
    /// Device uptime in milliseconds.
    pub timestamp: u64,
    pub exercise_mode: u8,
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub knee_angle: f32,
    pub temperature: f32,
}

impl TelemetryFrame {
    pub fn from_estimate(
        session_id: &str,
        timestamp: u64,
        mode: ExerciseMode,
        sample: &RawSample,
        estimate: &Estimate,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp,
            exercise_mode: mode.code(),
            accel_x: sample.accel.x,
            accel_y: sample.accel.y,
            accel_z: sample.accel.z,
            gyro_x: sample.gyro.x,
            gyro_y: sample.gyro.y,
            gyro_z: sample.gyro.z,
            roll: estimate.orientation.roll,
            pitch: estimate.orientation.pitch,
            yaw: estimate.orientation.yaw,
            knee_angle: estimate.joint_angle,
            temperature: estimate.temperature_c,
        }
    }

    pub fn mode(&self) -> Option<ExerciseMode> {
        ExerciseMode::from_code(self.exercise_mode)
    }

    /// Enforce the parts of the schema serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if ExerciseMode::from_code(self.exercise_mode).is_none() {
            return Err(ProtocolError::Schema(format!(
                "exerciseMode {} not in {{0,1,2}}",
                self.exercise_mode
            )));
        }
        let fields = [
            ("accelX", self.accel_x),
            ("accelY", self.accel_y),
            ("accelZ", self.accel_z),
            ("gyroX", self.gyro_x),
            ("gyroY", self.gyro_y),
            ("gyroZ", self.gyro_z),
            ("roll", self.roll),
            ("pitch", self.pitch),
            ("yaw", self.yaw),
            ("kneeAngle", self.knee_angle),
            ("temperature", self.temperature),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(ProtocolError::Schema(format!("{name} is not finite")));
            }
        }
        Ok(())
    }
}

/// Reply to `GET_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub recording: bool,
    pub session_id: Option<String>,
    pub exercise_mode: ExerciseMode,
}

/// Host -> device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartSession(String),
    StopSession,
    SetExercise(u8),
    Calibrate,
    GetStatus,
}

/// Device -> host message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Telemetry(TelemetryFrame),
    SessionStarted(String),
    SessionStopped,
    Calibrating,
    CalibrationComplete,
    SystemReady,
    Status(DeviceStatus),
    /// Any line without a recognised tag, carried verbatim.
    Diagnostic(String),
}

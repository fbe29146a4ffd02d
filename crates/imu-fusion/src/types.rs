use core::fmt;
use core::ops::Sub;
use serde::{Deserialize, Serialize};

/// Three orthogonal axis readings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Axes {
    pub const ZERO: Axes = Axes {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Sub for Axes {
    type Output = Axes;

    fn sub(self, rhs: Axes) -> Axes {
        Axes {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

/// One instant of 6-axis data: acceleration in g, angular rate in deg/s,
/// plus the raw temperature register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub accel: Axes,
    pub gyro: Axes,
    pub temp_raw: i16,
}

/// Per-axis bias computed from a stationary capture.
///
/// Replaced wholesale on recalibration, never patched field by field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOffsets {
    /// Bias of the accelerometer-derived roll angle, degrees.
    pub accel_roll: f32,
    /// Bias of the accelerometer-derived pitch angle, degrees.
    pub accel_pitch: f32,
    /// Gyroscope zero-rate bias, deg/s.
    pub gyro: Axes,
}

/// Fused attitude in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrientationState {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    /// Yaw accumulated purely from gyroscope integration.
    pub gyro_yaw: f32,
}

impl OrientationState {
    pub fn is_finite(&self) -> bool {
        self.roll.is_finite()
            && self.pitch.is_finite()
            && self.yaw.is_finite()
            && self.gyro_yaw.is_finite()
    }
}

/// Exercise being performed; selects how the joint angle is derived.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseMode {
    #[default]
    Flexion,
    Extension,
    Lateral,
}

impl ExerciseMode {
    pub fn code(self) -> u8 {
        match self {
            ExerciseMode::Flexion => 0,
            ExerciseMode::Extension => 1,
            ExerciseMode::Lateral => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ExerciseMode::Flexion),
            1 => Some(ExerciseMode::Extension),
            2 => Some(ExerciseMode::Lateral),
            _ => None,
        }
    }

    /// Like [`ExerciseMode::from_code`], but unknown codes map to extension.
    pub fn from_code_lossy(code: u8) -> Self {
        Self::from_code(code).unwrap_or(ExerciseMode::Extension)
    }
}

impl fmt::Display for ExerciseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExerciseMode::Flexion => write!(f, "flexion"),
            ExerciseMode::Extension => write!(f, "extension"),
            ExerciseMode::Lateral => write!(f, "lateral"),
        }
    }
}

/// Linear conversion from the raw temperature register to degrees Celsius.
///
/// Defaults match the MPU-6050 datasheet (`raw / 340 + 36.53`).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TempCalibration {
    pub scale: f32,
    pub offset: f32,
}

impl Default for TempCalibration {
    fn default() -> Self {
        Self {
            scale: 1.0 / 340.0,
            offset: 36.53,
        }
    }
}

impl TempCalibration {
    pub fn celsius(&self, raw: i16) -> f32 {
        let c = f32::from(raw) * self.scale + self.offset;
        if c.is_finite() {
            c
        } else {
            0.0
        }
    }
}

//! imu-fusion: orientation estimation for a body-worn 6-axis IMU
//!
//! Raw accelerometer/gyroscope samples are bias-corrected, fused with a
//! complementary filter into roll/pitch/yaw, and reduced to a single joint
//! angle for the active exercise. Every value leaving this crate is finite.

mod types;
pub use types::{
    Axes, CalibrationOffsets, ExerciseMode, OrientationState, RawSample, TempCalibration,
};

mod error;
pub use error::{FusionError, Result};

mod calibration;
pub use calibration::{accel_angles, calibrate, DEFAULT_CALIBRATION_SAMPLES, MIN_DENOMINATOR};

mod filter;
pub use filter::{ComplementaryFilter, FilterConfig, DEFAULT_ALPHA, DEFAULT_MIN_DT_S};

mod joint;
pub use joint::{joint_angle, joint_angle_for_code, JOINT_ANGLE_MAX_DEG, JOINT_ANGLE_MIN_DEG};

mod estimator;
pub use estimator::{Estimate, OrientationEstimator};

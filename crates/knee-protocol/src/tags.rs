//! Literal wire tags. These strings only appear at the serialization boundary.

// device -> host
pub const KNEE_DATA: &str = "KNEE_DATA:";
pub const SESSION_STARTED: &str = "SESSION_STARTED:";
pub const SESSION_STOPPED: &str = "SESSION_STOPPED";
pub const CALIBRATING: &str = "CALIBRATING";
pub const CALIBRATION_COMPLETE: &str = "CALIBRATION_COMPLETE";
pub const SYSTEM_READY: &str = "SYSTEM_READY";
pub const STATUS: &str = "STATUS:";
/// Diagnostic prefix for a failed calibration capture; the reason follows.
pub const CALIBRATION_FAILED: &str = "CALIBRATION_FAILED:";

// host -> device
pub const START_SESSION: &str = "START_SESSION:";
pub const STOP_SESSION: &str = "STOP_SESSION";
pub const SET_EXERCISE: &str = "SET_EXERCISE:";
pub const CALIBRATE: &str = "CALIBRATE";
pub const GET_STATUS: &str = "GET_STATUS";

pub const STATUS_RECORDING: &str = "RECORDING";
pub const STATUS_IDLE: &str = "IDLE";

/// Line terminator for both directions.
pub const TERMINATOR: char = '\n';

//! device-engine: firmware-side protocol engine for the knee sensor
//!
//! Owns the Idle/Recording state machine, the exercise mode, and the
//! orientation estimator, and turns host commands plus periodic ticks into
//! device messages. The sensor itself sits behind [`SensorSource`]; the
//! default `sim` feature provides a synthetic IMU for hosts without hardware.

mod error;
pub use error::{EngineError, Result, SensorError};

mod sensor;
pub use sensor::SensorSource;
#[cfg(feature = "sim")]
pub use sensor::SimulatedImu;

mod engine;
pub use engine::{DeviceEngine, EngineConfig, RecordingState, CALIBRATION_FAILED};

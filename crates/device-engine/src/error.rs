use thiserror::Error;

pub type Result<T, E = EngineError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not responding")]
    NotResponding,
    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Fusion(#[from] imu_fusion::FusionError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
}

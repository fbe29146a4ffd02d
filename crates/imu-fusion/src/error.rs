use thiserror::Error;

pub type Result<T, E = FusionError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("no samples supplied for calibration")]
    NoSamples,
    #[error("calibration produced a non-finite offset")]
    NonFiniteOffset,
    #[error("invalid filter parameter: {0}")]
    InvalidParameter(&'static str),
}

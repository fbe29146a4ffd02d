use thiserror::Error;

pub type Result<T, E = ProtocolError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,
    #[error("telemetry schema violation: {0}")]
    Schema(String),
    #[error("invalid {tag} payload: {reason}")]
    InvalidPayload { tag: &'static str, reason: String },
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("field cannot be framed: {0}")]
    Unframeable(&'static str),
}

use thiserror::Error;

pub type Result<T, E = IngestError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("session {active} is already active")]
    Conflict { active: String },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("link error: {0}")]
    Transport(#[from] link_transport::TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] knee_protocol::ProtocolError),
    #[error("store error: {0}")]
    Store(String),
    #[error("analytics error: {0}")]
    Analytics(String),
    #[error("metrics init error: {0}")]
    Metrics(String),
}

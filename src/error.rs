use thiserror::Error;

use crate::types::{ParticipantId, RoomId, SessionId, UserId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("record not found")]
    NotFound,
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected the write: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} has already ended")]
    SessionEnded(SessionId),
    #[error("room {0} already has two active participants")]
    RoomFull(RoomId),
    #[error("participant {0} not found")]
    ParticipantNotFound(ParticipantId),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Credit(#[from] CreditError),
}

/// Raised when verified hours could not be credited after every retry.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("crediting {hours:.3}h to student {student_id} failed after {attempts} attempts: {last_error}")]
pub struct CreditError {
    pub student_id: UserId,
    pub hours: f64,
    pub attempts: u32,
    pub last_error: GatewayError,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single RTSP session attempt (open or frame read).
///
/// The supervisor never treats any of these as fatal; every kind maps to a
/// state transition. The kind is surfaced through the status API so an
/// operator can tell a credential problem from a dead network path.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("frame decode failed: {0}")]
    DecodeError(String),

    #[error("stream disconnected: {0}")]
    Disconnected(String),

    #[error("end of stream")]
    Eof,
}

/// Serializable discriminant of [`SessionError`], kept in stream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    Unreachable,
    AuthFailed,
    ProtocolError,
    Timeout,
    DecodeError,
    Disconnected,
    Eof,
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::Unreachable(_) => SessionErrorKind::Unreachable,
            SessionError::AuthFailed(_) => SessionErrorKind::AuthFailed,
            SessionError::ProtocolError(_) => SessionErrorKind::ProtocolError,
            SessionError::Timeout(_) => SessionErrorKind::Timeout,
            SessionError::DecodeError(_) => SessionErrorKind::DecodeError,
            SessionError::Disconnected(_) => SessionErrorKind::Disconnected,
            SessionError::Eof => SessionErrorKind::Eof,
        }
    }
}

impl SessionErrorKind {
    /// Rank used to pick the "most specific" failure out of a candidate
    /// sweep. A rejected credential beats a generic connection failure.
    pub fn specificity(self) -> u8 {
        match self {
            SessionErrorKind::AuthFailed => 6,
            SessionErrorKind::ProtocolError => 5,
            SessionErrorKind::DecodeError => 4,
            SessionErrorKind::Timeout => 3,
            SessionErrorKind::Disconnected => 2,
            SessionErrorKind::Eof => 1,
            SessionErrorKind::Unreachable => 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Camera {camera_id} not found")]
    NotFound { camera_id: i64 },

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn not_found(camera_id: i64) -> Self {
        Self::NotFound { camera_id }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

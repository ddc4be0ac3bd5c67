use devwatch_protocol::{ErrorCode, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevwatchError {
    #[error("session already exists: {0}")]
    SessionAlreadyExists(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("no free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to start process: {0}")]
    ProcessStartFailed(String),

    #[error("failed to stop process: {0}")]
    ProcessStopFailed(String),

    #[error("timed out after {timeout_ms}ms waiting for container {container_id} to become {target}")]
    StatusWaitTimeout {
        container_id: String,
        target: String,
        timeout_ms: u64,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("buffer overflow: {evicted} oldest entries evicted")]
    BufferOverflow { evicted: usize },

    #[error("log rotation failed for {path}: {reason}")]
    RotationFailure { path: String, reason: String },

    #[error("registry persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("container runtime error: {0}")]
    ContainerRuntime(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DevwatchError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            Self::SessionAlreadyExists(_) => (ErrorCode::SessionAlreadyExists, self.to_string()),
            Self::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            Self::PortInUse(_) | Self::NoFreePort { .. } => {
                (ErrorCode::PortInUse, self.to_string())
            }
            Self::ProcessStartFailed(_) => (ErrorCode::ProcessStartFailed, self.to_string()),
            Self::ProcessStopFailed(_) => (ErrorCode::ProcessStopFailed, self.to_string()),
            Self::StatusWaitTimeout { .. } => (ErrorCode::StatusWaitTimeout, self.to_string()),
            Self::ConnectionLost(_) => (ErrorCode::ConnectionLost, self.to_string()),
            Self::ContainerRuntime(_) => (ErrorCode::ContainerRuntime, self.to_string()),
            Self::InvalidRequest(_) => (ErrorCode::InvalidRequest, self.to_string()),
            Self::BufferOverflow { .. }
            | Self::RotationFailure { .. }
            | Self::PersistenceFailure(_) => (ErrorCode::ServerError, self.to_string()),
            Self::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}

pub type Result<T, E = DevwatchError> = std::result::Result<T, E>;

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdkError>;

/// Error taxonomy for the transport and query-handler core (spec §7).
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("claude binary not found")]
    CliNotFound,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("process exited with code {0}")]
    ProcessExit(i32),

    #[error("buffer overflow: frame exceeded {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("failed to decode JSON record: {0}")]
    DecodeError(String),

    #[error("control request timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl SdkError {
    pub fn timeout_for(subtype: impl Into<String>) -> Self {
        SdkError::Timeout(subtype.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        SdkError::Other(message.into())
    }

    pub fn closed() -> Self {
        SdkError::Other("QueryHandler is closed".to_string())
    }
}

/// Narrower error type for the process supervisor's spawn path; callers
/// convert it into `SdkError` at the transport boundary (§7).
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("claude binary not found")]
    MissingBinary,
    #[error("working directory does not exist: {0}")]
    MissingWorkingDir(PathBuf),
    #[error("failed to spawn process (binary={binary:?}): {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
}

impl From<SpawnError> for SdkError {
    fn from(value: SpawnError) -> Self {
        match value {
            SpawnError::MissingBinary => SdkError::CliNotFound,
            other => SdkError::ConnectionError(other.to_string()),
        }
    }
}

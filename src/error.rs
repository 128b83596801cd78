//! Error taxonomy shared by the store, the engine and the daemon.
//!
//! Each layer owns a `thiserror` enum; [`ServeError`] is what a session
//! reports and what gets mapped onto the wire [`ErrorCode`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::daemon::protocol::ErrorCode;

/// Failure to turn a file on disk into a [`crate::model::Model`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model file not found: {0}")]
    Missing(PathBuf),

    #[error("failed to read model {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("model {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("model {path} uses format version {found}, expected {expected}")]
    Incompatible {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

/// Lookups against the model store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("no model loaded")]
    Empty,

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Errors a session or the front end reports to a caller.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("model not found: {0}")]
    NotFound(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("session cancelled")]
    Cancelled,

    #[error("protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("failed to load model: {0}")]
    Load(#[from] LoadError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServeError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::ModelNotFound,
            Self::ModelUnavailable(_) => ErrorCode::ModelUnavailable,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            Self::Load(_) => ErrorCode::LoadFailed,
            Self::Transport(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a client may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted(_) | Self::DeadlineExceeded(_) | Self::Transport(_)
        )
    }
}

impl From<StoreError> for ServeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => ServeError::NotFound(name),
            StoreError::Empty => ServeError::ModelUnavailable("no model loaded".to_string()),
            StoreError::Load(e) => ServeError::Load(e),
        }
    }
}

//! Wire protocol for the prediction daemon.
//!
//! Every frame on the socket is a big-endian `u32` length followed by the
//! body (see [`super::frame`]). With encryption enabled the body is sealed
//! first (see [`super::transport`]). The plaintext body is a MessagePack
//! [`FramedMessage`].
//!
//! A connection may issue any number of [`ClientMessage::Health`] /
//! [`ClientMessage::Status`] probes, then at most one
//! [`ClientMessage::Open`]. After `Opened`, the client streams `Predict`
//! messages and finishes with `End`; the server answers each `Predict` with
//! a `Prediction` carrying the same `seq`, in order, and `End` with `Closed`.

use serde::{Deserialize, Serialize};

use crate::error::ServeError;
use crate::inference::{PredictionRequest, PredictionResult};

/// Protocol version; both ends must agree.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port, same as the original HTTP service.
pub const DEFAULT_PORT: u16 = 8000;

/// Messages sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Liveness probe.
    Health,

    /// Loaded models and counters.
    Status,

    /// Start a prediction session against `model` (default model if `None`).
    Open { model: Option<String> },

    /// Score one text.
    Predict(PredictionRequest),

    /// No more input; the server flushes and closes the session.
    End,
}

/// Messages sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Health(HealthStatus),

    Status(StatusResponse),

    /// Session accepted; describes the bound model.
    Opened(ModelInfo),

    /// Result for the request with the same `seq`.
    Prediction(PredictionResult),

    /// Session finished normally after `served` predictions.
    Closed { served: u64 },

    /// The call failed; the server closes the connection afterwards.
    Error(ErrorResponse),
}

/// Health status of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Daemon uptime in seconds.
    pub uptime_secs: u64,
    /// Protocol version.
    pub version: u32,
    /// Whether at least one model is loaded.
    pub ready: bool,
    /// Resident memory of the process in bytes (0 where unsupported).
    pub memory_bytes: u64,
}

/// Daemon status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub version: u32,
    pub models: Vec<ModelInfo>,
    pub active_sessions: u64,
    pub max_sessions: u64,
    pub total_sessions: u64,
    pub total_predictions: u64,
    pub memory_bytes: u64,
    /// Build timestamp and target triple, when the build script recorded them.
    pub build: Option<String>,
}

/// Information about a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub labels: Vec<String>,
    pub dim: usize,
    pub vocabulary: usize,
    pub buckets: u32,
    /// Approximate size of the weights in bytes.
    pub memory_bytes: u64,
    /// References held outside the store (open sessions, in-flight batches).
    pub handles: usize,
}

/// Error response from daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Whether the call can be retried.
    pub retryable: bool,
}

impl From<&ServeError> for ErrorResponse {
    fn from(e: &ServeError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// Error codes for daemon errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown or internal error.
    Internal,
    /// The named model is not loaded.
    ModelNotFound,
    /// No model could be bound to the session.
    ModelUnavailable,
    /// Bad `k`, `threshold` or message sequence.
    InvalidArgument,
    /// Message too large or too many sessions.
    ResourceExhausted,
    /// Per-request deadline elapsed.
    DeadlineExceeded,
    /// The server is shutting down.
    Cancelled,
    /// Protocol version mismatch.
    VersionMismatch,
    /// Model loading failed.
    LoadFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Internal => "internal",
            Self::ModelNotFound => "model_not_found",
            Self::ModelUnavailable => "model_unavailable",
            Self::InvalidArgument => "invalid_argument",
            Self::ResourceExhausted => "resource_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::VersionMismatch => "version_mismatch",
            Self::LoadFailed => "load_failed",
        };
        f.write_str(name)
    }
}

/// Envelope around every payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedMessage<T> {
    /// Protocol version.
    pub version: u32,
    /// Position of a `Predict` in its session; echoed on its `Prediction`.
    pub seq: u64,
    /// Payload.
    pub payload: T,
}

impl<T> FramedMessage<T> {
    pub fn new(seq: u64, payload: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            seq,
            payload,
        }
    }
}

/// Encode a message to MessagePack bytes (no length prefix).
pub fn encode_message<T: Serialize>(msg: &FramedMessage<T>) -> Result<Vec<u8>, EncodeError> {
    rmp_serde::to_vec(msg).map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message from MessagePack bytes (no length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<FramedMessage<T>, DecodeError> {
    rmp_serde::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("encode error: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, Clone, thiserror::Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

//! Error taxonomy for the worker core.
//!
//! Construction, channel and format failures are kept apart so callers can
//! decide what is fatal to a handle versus fatal to a single call.

use thiserror::Error;

/// Errors surfaced by worker construction, messaging and pooling.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker process failed to start or failed its startup handshake.
    /// Not retried automatically except for the pool's single recovery
    /// attempt after a failed configure.
    #[error("worker construction failed: {0}")]
    Construction(String),

    /// I/O failure on the message transport. Fatal to the handle; the
    /// worker is considered dead.
    #[error("channel failure: {0}")]
    Channel(String),

    /// A blocking wait was aborted on caller request. Not an operational
    /// failure.
    #[error("operation canceled")]
    Canceled,

    /// Malformed frame or column bytes. Fatal to the current call only,
    /// unless the channel itself is desynchronized.
    #[error("malformed payload: {0}")]
    Format(String),

    /// The worker reported a request-level failure (e.g. unknown variable).
    /// The handle stays usable.
    #[error("worker error: {0}")]
    Worker(String),

    /// Configuring a freshly dequeued worker failed and the single recovery
    /// attempt failed as well. Carries both errors.
    #[error("worker recovery failed: {original} (retry: {retry})")]
    RecoveryFailed {
        original: Box<WorkerError>,
        retry: Box<WorkerError>,
    },
}

impl WorkerError {
    /// Machine readable error code, mirrored into logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Construction(_) => "CONSTRUCTION_FAILED",
            Self::Channel(_) => "CHANNEL_FAILURE",
            Self::Canceled => "CANCELED",
            Self::Format(_) => "MALFORMED_PAYLOAD",
            Self::Worker(_) => "WORKER_ERROR",
            Self::RecoveryFailed { .. } => "RECOVERY_FAILED",
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        Self::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

//! Error types for flux-stream

use crate::backend::BackendError;
use thiserror::Error;

/// Errors surfaced by remote streams
#[derive(Error, Debug)]
pub enum StreamError {
    /// A backend primitive failed with a fatal error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A transient failure persisted past the retry budget
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// The block covering `offset` could not be fetched
    #[error("Data unavailable at offset {offset}: {source}")]
    BlockUnavailable {
        offset: u64,
        #[source]
        source: Box<StreamError>,
    },

    /// The upload session was aborted after a part failed
    #[error("Upload of {name} aborted: {source}{}", abort_suffix(.abort_error))]
    Aborted {
        name: String,
        #[source]
        source: Box<StreamError>,
        /// Failure of the `abort_upload` call itself, reported alongside the cause
        abort_error: Option<Box<StreamError>>,
    },

    /// Operation on a stream that was already closed or aborted
    #[error("Stream already closed: {name}")]
    Closed { name: String },

    /// The object size is needed but the backend cannot tell it yet
    #[error("Object size of {name} is unknown")]
    UnknownSize { name: String },

    /// Seek to a position before the start of the object
    #[error("Invalid seek: {0}")]
    InvalidSeek(String),

    /// Operation not supported by this kind of stream
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The upload would need more parts than the backend accepts
    #[error("Upload of {name} exceeds the backend limit of {max_parts} parts")]
    TooManyParts { name: String, max_parts: usize },

    /// Configuration-related error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// The task was cancelled before it started
    #[error("Task cancelled")]
    Cancelled,

    /// A pool job panicked
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn abort_suffix(abort_error: &Option<Box<StreamError>>) -> String {
    match abort_error {
        Some(err) => format!(" (abort also failed: {})", err),
        None => String::new(),
    }
}

impl StreamError {
    /// Returns true for errors caused by misuse of the stream rather than the backend
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            StreamError::Closed { .. }
                | StreamError::InvalidSeek(_)
                | StreamError::Unsupported(_)
                | StreamError::UnknownSize { .. }
        )
    }

    /// Returns true if the root cause is a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            StreamError::Backend(err) | StreamError::RetriesExhausted { source: err, .. } => {
                matches!(err, BackendError::NotFound(_))
            }
            StreamError::BlockUnavailable { source, .. } | StreamError::Aborted { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }
}

/// Result type for flux-stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(io_err) => io_err,
            other if other.is_logical() => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, other)
            }
            other if other.is_not_found() => {
                std::io::Error::new(std::io::ErrorKind::NotFound, other)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

//! Remote object capability interface
//!
//! The engine never talks to a concrete protocol. Each backend hands it a
//! [`RemoteObject`]: a handle to one object that can fetch byte ranges and
//! take part uploads. Readers and writers hold it as `Arc<dyn RemoteObject>`.

use bytes::Bytes;
use std::fmt::Debug;
use thiserror::Error;

pub mod cloud;
pub mod memory;

pub use cloud::{open_url, CloudPath, ObjectStoreObject};
pub use memory::MemoryObject;

/// Part-count ceiling of S3-compatible multipart uploads
pub const DEFAULT_MAX_PARTS: usize = 10_000;

/// Error codes that object stores use for throttling and overload
const THROTTLING_CODES: &[&str] = &[
    "429",
    "499",
    "SlowDown",
    "ServiceUnavailable",
    "InternalError",
    "ContextCanceled",
    "Timeout",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "ExceedAccountQPSLimit",
    "ExceedAccountRateLimit",
    "ExceedBucketQPSLimit",
    "ExceedBucketRateLimit",
    "DownloadTrafficRateLimitExceeded",
    "UploadTrafficRateLimitExceeded",
    "MetaOperationQpsLimitExceeded",
];

/// Whether a failed call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network or server condition that may clear up on its own
    Transient,
    /// Retrying cannot help
    Fatal,
}

/// Failure of a single backend primitive
#[derive(Error, Debug)]
pub enum BackendError {
    /// The object does not exist (any more)
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The requested offset lies at or past the end of the object
    #[error("Range not satisfiable at offset {offset}")]
    RangeNotSatisfiable { offset: u64 },

    /// The call did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The connection dropped mid-request
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// The server asked us to slow down
    #[error("Throttled by server: {code}")]
    Throttled { code: String },

    /// Server-side failure with an HTTP status
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    /// Credentials rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The server rejected the request itself
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Object store error
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Generic error for other cases
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Builds the error for a provider error code, e.g. `SlowDown` or `503`
    pub fn from_code(code: &str) -> Self {
        if let Ok(status) = code.parse::<u16>() {
            if (500..600).contains(&status) {
                return BackendError::Server { status };
            }
        }
        if THROTTLING_CODES.contains(&code) {
            return BackendError::Throttled {
                code: code.to_string(),
            };
        }
        match code {
            "NoSuchKey" | "NoSuchBucket" | "404" => BackendError::NotFound(code.to_string()),
            "AccessDenied" | "InvalidAccessKeyId" | "403" | "401" => {
                BackendError::Unauthorized(code.to_string())
            }
            "InvalidRange" | "416" => BackendError::RangeNotSatisfiable { offset: 0 },
            other => BackendError::InvalidRequest(other.to_string()),
        }
    }

    /// Classifies the error for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::Timeout(_)
            | BackendError::ConnectionReset(_)
            | BackendError::Throttled { .. } => ErrorClass::Transient,
            BackendError::Server { status } if *status >= 500 => ErrorClass::Transient,
            BackendError::ObjectStore(err) => match err {
                object_store::Error::Generic { .. } => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            _ => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == Transient`
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Receipt of one uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartToken {
    /// 1-based part index
    pub index: usize,
    /// Backend-specific identifier (ETag, content id, ...)
    pub id: String,
    /// Number of bytes in the part
    pub size: u64,
}

/// A remote, block-addressable object
///
/// Every method is a blocking network call. Implementations must be safe to
/// call from several worker threads at once.
pub trait RemoteObject: Send + Sync + Debug {
    /// Human-readable name used in logs and errors
    fn name(&self) -> String;

    /// Total size of the object, `None` while the backend cannot tell yet
    fn object_size(&self) -> Result<Option<u64>, BackendError>;

    /// Fetches up to `length` bytes starting at `offset`
    ///
    /// Returns fewer bytes only at the end of the object.
    fn fetch_range(&self, offset: u64, length: u64) -> Result<Bytes, BackendError>;

    /// Uploads part `index` (1-based)
    ///
    /// Calling it again with the same index and data must overwrite the earlier attempt.
    fn put_part(&self, index: usize, data: Bytes) -> Result<PartToken, BackendError>;

    /// Commits the uploaded parts, in the order given
    fn complete_upload(&self, tokens: Vec<PartToken>) -> Result<(), BackendError>;

    /// Discards every uploaded part
    fn abort_upload(&self) -> Result<(), BackendError>;

    /// Largest part index the backend accepts
    fn max_parts(&self) -> usize {
        DEFAULT_MAX_PARTS
    }
}

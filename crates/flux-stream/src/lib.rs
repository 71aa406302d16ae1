//! # flux-stream
//!
//! Concurrent chunked streams over remote objects. This crate provides synchronous `Read`,
//! `BufRead`, `Seek` and `Write` interfaces for objects that can only be accessed by byte range
//! and uploaded in parts, hiding network latency behind a shared worker pool.
//!
//! ## Architecture
//!
//! The main abstractions are:
//! - `RemoteObject`: the capability interface a backend implements (ranged fetch, size,
//!   part upload, complete/abort)
//! - `PrefetchReader`: a block-cached reader that prefetches ahead of the cursor
//! - `MultipartWriter`: a buffered writer that uploads parts concurrently
//! - `LimitedSeekableWriter`: a multipart writer that can seek back into its head or tail
//! - `RetryPolicy`: bounded exponential backoff around every backend call
//! - `WorkerPool`: a fixed set of threads shared by every open stream
//!
//! `StreamEngine` bundles a `StreamConfig` with a pool and opens streams.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
mod buffer;
mod cache;
pub mod config;
mod error;
pub mod pool;
pub mod reader;
pub mod retry;
mod runtime;
pub mod seekable;
pub mod writer;

pub use backend::{
    open_url, BackendError, CloudPath, ErrorClass, MemoryObject, ObjectStoreObject, PartToken,
    RemoteObject,
};
pub use config::{parse_quantity, StreamConfig};
pub use error::{Result, StreamError};
pub use pool::{PoolStats, TaskHandle, TaskSet, WorkerPool};
pub use reader::{PrefetchReader, ReaderOptions};
pub use retry::RetryPolicy;
pub use seekable::{LimitedSeekableWriter, SeekableWriterOptions};
pub use writer::{BlockSizePolicy, MultipartWriter, WriterOptions, WriterState};

use pool::DEFAULT_MAX_WORKERS;
use std::sync::Arc;

/// Opens readers and writers with one configuration and one worker pool
#[derive(Debug, Clone)]
pub struct StreamEngine {
    config: StreamConfig,
    pool: Arc<WorkerPool>,
}

impl StreamEngine {
    /// Create an engine
    ///
    /// Uses the process-wide pool when `max_workers` is the default,
    /// a dedicated pool otherwise.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let pool = if config.max_workers == DEFAULT_MAX_WORKERS {
            WorkerPool::global()?
        } else {
            Arc::new(WorkerPool::new("flux-stream-worker", config.max_workers)?)
        };
        Ok(Self { config, pool })
    }

    /// Create an engine that runs on `pool`
    pub fn with_pool(config: StreamConfig, pool: Arc<WorkerPool>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, pool })
    }

    /// Create an engine configured from `FLUX_STREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(StreamConfig::from_env()?)
    }

    /// The active configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The pool streams run their network calls on
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Open `object` for reading
    pub fn reader(&self, object: Arc<dyn RemoteObject>) -> Result<PrefetchReader> {
        PrefetchReader::new(object, self.pool.clone(), self.config.reader_options())
    }

    /// Open `object` for writing
    pub fn writer(&self, object: Arc<dyn RemoteObject>) -> Result<MultipartWriter> {
        MultipartWriter::new(object, self.pool.clone(), self.config.writer_options())
    }

    /// Open `object` for writing with a rewritable head and tail
    pub fn seekable_writer(&self, object: Arc<dyn RemoteObject>) -> Result<LimitedSeekableWriter> {
        LimitedSeekableWriter::new(
            object,
            self.pool.clone(),
            self.config.seekable_writer_options(),
        )
    }

    /// Open a cloud URL such as `s3://bucket/key` for reading
    pub fn open_reader(&self, url: &str) -> Result<PrefetchReader> {
        self.reader(open_url(url)?)
    }

    /// Open a cloud URL such as `s3://bucket/key` for writing
    pub fn open_writer(&self, url: &str) -> Result<MultipartWriter> {
        self.writer(open_url(url)?)
    }

    /// Open a cloud URL such as `s3://bucket/key` for seekable writing
    pub fn open_seekable_writer(&self, url: &str) -> Result<LimitedSeekableWriter> {
        self.seekable_writer(open_url(url)?)
    }
}

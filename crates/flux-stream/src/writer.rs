//! MultipartWriter - buffered, concurrent multipart uploads behind `Write`

use crate::backend::{PartToken, RemoteObject};
use crate::buffer::PartBuffer;
use crate::error::{Result, StreamError};
use crate::pool::{TaskSet, WorkerPool};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default part size (8MB)
pub const DEFAULT_WRITER_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
/// Default bound on buffered and in-flight bytes (128MB)
pub const DEFAULT_WRITER_MAX_BUFFER_SIZE: u64 = 128 * 1024 * 1024;

/// Part numbers at which an autoscaling writer doubles its part size
const AUTOSCALE_TIERS: [usize; 3] = [10, 100, 1_000];

/// First progress log threshold; each following one is 4x larger
const PROGRESS_LOG_INITIAL: u64 = 64 * 1024 * 1024;
const PROGRESS_LOG_FACTOR: u64 = 4;

/// How big each uploaded part is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizePolicy {
    /// Every part has the same size
    Fixed(u64),
    /// Start at `base` and double at part 10, 100 and 1000, never above `max`
    Autoscale {
        /// Size of the first parts
        base: u64,
        /// Upper bound on the part size
        max: u64,
    },
}

impl BlockSizePolicy {
    /// Autoscale from `base`, capped at `max` (and never below `base`)
    pub fn autoscale(base: u64, max: u64) -> Self {
        Self::Autoscale {
            base,
            max: max.max(base),
        }
    }

    /// Size of part number `part` (1-based)
    pub fn block_size_for(&self, part: usize) -> u64 {
        match *self {
            Self::Fixed(size) => size,
            Self::Autoscale { base, max } => {
                let doublings = AUTOSCALE_TIERS.iter().filter(|tier| part >= **tier).count();
                (base << doublings).min(max.max(base))
            }
        }
    }

    /// Largest object that fits in `max_parts` full parts
    pub fn max_object_size(&self, max_parts: usize) -> u64 {
        match *self {
            Self::Fixed(size) => size.saturating_mul(max_parts as u64),
            Self::Autoscale { .. } => {
                let mut total = 0u64;
                let mut start = 1;
                for end in AUTOSCALE_TIERS.iter().copied().chain([max_parts + 1]) {
                    let end = end.min(max_parts + 1);
                    if end > start {
                        let parts = (end - start) as u64;
                        let tier_bytes = self.block_size_for(start).saturating_mul(parts);
                        total = total.saturating_add(tier_bytes);
                        start = end;
                    }
                }
                total
            }
        }
    }

    fn base(&self) -> u64 {
        match *self {
            Self::Fixed(size) => size,
            Self::Autoscale { base, .. } => base,
        }
    }
}

/// Tuning for one writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// Part size policy
    pub block_size: BlockSizePolicy,
    /// Bound on bytes buffered plus bytes in flight
    pub max_buffer_size: u64,
    /// Retry policy for part uploads, completion and abort
    pub retry: RetryPolicy,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: BlockSizePolicy::autoscale(
                DEFAULT_WRITER_BLOCK_SIZE,
                DEFAULT_WRITER_MAX_BUFFER_SIZE,
            ),
            max_buffer_size: DEFAULT_WRITER_MAX_BUFFER_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting writes
    Open,
    /// `close` is draining parts
    Closing,
    /// Upload completed
    Closed,
    /// Upload aborted after a failure or an explicit `abort`
    Aborted,
}

/// A writer that uploads a remote object as concurrent multipart parts
///
/// Written bytes fill the current part; full parts are uploaded on the
/// worker pool while the caller keeps writing. `write` blocks only when the
/// parts not yet uploaded exceed `max_buffer_size`. Nothing becomes visible
/// until [`MultipartWriter::close`] succeeds.
#[derive(Debug)]
pub struct MultipartWriter {
    object: Arc<dyn RemoteObject>,
    name: String,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    policy: BlockSizePolicy,
    max_buffer_size: u64,
    max_parts: usize,
    buffer: PartBuffer,
    /// Number of the part being filled, starting at 1
    next_part: usize,
    in_flight: TaskSet<usize, PartToken>,
    /// Size of each dispatched part not uploaded yet
    in_flight_sizes: BTreeMap<usize, u64>,
    /// Sum of `in_flight_sizes`
    in_flight_bytes: u64,
    completed: BTreeMap<usize, PartToken>,
    bytes_written: u64,
    progress_mark: u64,
    state: WriterState,
}

impl MultipartWriter {
    /// Open `object` for writing
    pub fn new(
        object: Arc<dyn RemoteObject>,
        pool: Arc<WorkerPool>,
        options: WriterOptions,
    ) -> Result<Self> {
        if options.block_size.base() == 0 {
            return Err(StreamError::InvalidConfig(
                "writer block size must be greater than 0".to_string(),
            ));
        }

        let name = object.name();
        let max_parts = object.max_parts();
        debug!("open file: {}, mode: wb, block size: {:?}", name, options.block_size);

        Ok(Self {
            buffer: PartBuffer::new(options.block_size.block_size_for(1) as usize),
            object,
            name,
            pool,
            retry: options.retry,
            policy: options.block_size,
            max_buffer_size: options.max_buffer_size,
            max_parts,
            next_part: 1,
            in_flight: TaskSet::new(),
            in_flight_sizes: BTreeMap::new(),
            in_flight_bytes: 0,
            completed: BTreeMap::new(),
            bytes_written: 0,
            progress_mark: PROGRESS_LOG_INITIAL,
            state: WriterState::Open,
        })
    }

    /// Name of the underlying object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes accepted so far
    pub fn tell(&self) -> u64 {
        self.bytes_written
    }

    /// Session state
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Size of the part currently being filled
    pub fn next_block_size(&self) -> u64 {
        self.buffer.target() as u64
    }

    /// Parts dispatched so far
    pub fn parts_dispatched(&self) -> usize {
        self.next_part - 1
    }

    /// Bytes buffered locally plus bytes of parts still uploading
    pub fn buffered_bytes(&self) -> u64 {
        self.in_flight_bytes + self.buffer.len() as u64
    }

    /// Append `data`, uploading every part that fills up
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;

        let mut remaining = data;
        while !remaining.is_empty() {
            let n = self.buffer.write(remaining);
            remaining = &remaining[n..];
            self.bytes_written += n as u64;

            if self.buffer.is_full() {
                self.dispatch_part()?;
                self.wait_for_room()?;
            }
        }

        if self.bytes_written >= self.progress_mark {
            debug!("Written {} bytes to {}", self.bytes_written, self.name);
            while self.progress_mark <= self.bytes_written {
                self.progress_mark *= PROGRESS_LOG_FACTOR;
            }
        }
        Ok(data.len())
    }

    /// Upload the current part now, even if it is not full
    ///
    /// Does not wait for the upload to finish.
    pub fn flush_part(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.buffer.is_empty() {
            self.dispatch_part()?;
        }
        Ok(())
    }

    /// Upload what is left, wait for every part and complete the upload
    ///
    /// A part failure aborts the upload; the returned error carries the abort
    /// failure too, if there was one. Closing a closed writer is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WriterState::Closed => return Ok(()),
            WriterState::Aborted => {
                return Err(StreamError::Closed {
                    name: self.name.clone(),
                })
            }
            WriterState::Open | WriterState::Closing => {}
        }

        debug!("close file: {}", self.name);
        self.state = WriterState::Closing;

        // An empty object still needs one (empty) part.
        if !self.buffer.is_empty() || self.next_part == 1 {
            self.dispatch_part()?;
        }

        for (index, result) in self.in_flight.drain() {
            self.settle_part(index, result)?;
        }

        let tokens: Vec<PartToken> = std::mem::take(&mut self.completed).into_values().collect();
        trace!("Completing {} with {} parts", self.name, tokens.len());
        let operation = format!("complete upload of {}", self.name);
        let object = self.object.clone();
        if let Err(err) = self
            .retry
            .call(&operation, || object.complete_upload(tokens.clone()))
        {
            return Err(self.fail(err));
        }

        self.state = WriterState::Closed;
        debug!("Uploaded {} bytes to {}", self.bytes_written, self.name);
        Ok(())
    }

    /// Cancel outstanding parts and abort the upload
    ///
    /// Nothing written so far becomes visible. Aborting twice is a no-op.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            WriterState::Aborted => return Ok(()),
            WriterState::Closed => {
                return Err(StreamError::Closed {
                    name: self.name.clone(),
                })
            }
            WriterState::Open | WriterState::Closing => {}
        }
        debug!("abort file: {}", self.name);
        match self.abort_session() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(StreamError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Leave the first `count` part numbers for [`MultipartWriter::upload_reserved`]
    pub(crate) fn reserve_parts(&mut self, count: usize) {
        self.next_part += count;
        let target = self.policy.block_size_for(self.next_part);
        self.buffer.set_target(target as usize);
    }

    /// Upload `data` as the next part, bypassing the part buffer
    pub(crate) fn upload_next(&mut self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let index = self.next_part;
        self.check_part_limit(index)?;
        self.next_part += 1;
        let target = self.policy.block_size_for(self.next_part);
        self.buffer.set_target(target as usize);

        self.bytes_written += data.len() as u64;
        self.submit_part(index, data)?;
        self.wait_for_room()
    }

    /// Upload `data` as a part number left free by [`MultipartWriter::reserve_parts`]
    pub(crate) fn upload_reserved(&mut self, index: usize, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.bytes_written += data.len() as u64;
        self.submit_part(index, data)?;
        self.wait_for_room()
    }

    fn check_part_limit(&mut self, index: usize) -> Result<()> {
        if index > self.max_parts {
            let err = StreamError::TooManyParts {
                name: self.name.clone(),
                max_parts: self.max_parts,
            };
            return Err(self.fail(err));
        }
        Ok(())
    }

    /// Seal the buffered part and hand it to the pool
    fn dispatch_part(&mut self) -> Result<()> {
        let index = self.next_part;
        self.check_part_limit(index)?;

        let next_target = self.policy.block_size_for(index + 1);
        if next_target != self.buffer.target() as u64 {
            trace!("Part size of {} grows to {} bytes", self.name, next_target);
        }
        let data = self.buffer.seal(next_target as usize);
        self.next_part += 1;
        self.submit_part(index, data)
    }

    fn submit_part(&mut self, index: usize, data: Bytes) -> Result<()> {
        self.in_flight_sizes.insert(index, data.len() as u64);
        self.in_flight_bytes += data.len() as u64;

        trace!("Dispatching part {} of {} ({} bytes)", index, self.name, data.len());
        let object = self.object.clone();
        let retry = self.retry;
        let operation = format!("put part {} of {}", index, self.name);
        let handle = self
            .pool
            .submit(move || retry.call(&operation, || object.put_part(index, data.clone())));
        self.in_flight.push(index, handle);

        for (index, result) in self.in_flight.reap_finished() {
            self.settle_part(index, result)?;
        }
        Ok(())
    }

    /// Block until the parts in flight plus the part being filled fit `max_buffer_size`
    fn wait_for_room(&mut self) -> Result<()> {
        while self.in_flight_bytes + self.buffer.target() as u64 > self.max_buffer_size {
            let Some((index, result)) = self.in_flight.wait_any() else {
                break;
            };
            self.settle_part(index, result)?;
        }
        Ok(())
    }

    fn settle_part(&mut self, index: usize, result: Result<PartToken>) -> Result<()> {
        match result {
            Ok(token) => {
                trace!("Part {} of {} uploaded", index, self.name);
                let size = self.in_flight_sizes.remove(&index).unwrap_or(0);
                self.in_flight_bytes = self.in_flight_bytes.saturating_sub(size);
                self.completed.insert(index, token);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Abort after `source` and build the error to report
    fn fail(&mut self, source: StreamError) -> StreamError {
        let abort_error = self.abort_session().map(Box::new);
        StreamError::Aborted {
            name: self.name.clone(),
            source: Box::new(source),
            abort_error,
        }
    }

    /// Drain parts and call `abort_upload`, returning the abort failure
    fn abort_session(&mut self) -> Option<StreamError> {
        self.state = WriterState::Aborted;
        self.in_flight.cancel_and_drain();
        self.in_flight_sizes.clear();
        self.in_flight_bytes = 0;
        self.completed.clear();
        self.buffer.clear();

        let operation = format!("abort upload of {}", self.name);
        let object = self.object.clone();
        match self.retry.call(&operation, || object.abort_upload()) {
            Ok(()) => None,
            Err(err) => {
                warn!("Failed to abort upload of {}: {}", self.name, err);
                Some(err)
            }
        }
    }
}

impl Write for MultipartWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_part().map_err(Into::into)
    }
}

impl Seek for MultipartWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.bytes_written),
            SeekFrom::Start(offset) if offset == self.bytes_written => Ok(offset),
            other => Err(StreamError::Unsupported(format!(
                "{} is write-only and can only report its position, got {:?}",
                self.name, other
            ))
            .into()),
        }
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.bytes_written)
    }
}

impl Drop for MultipartWriter {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Open | WriterState::Closing) {
            warn!(
                "{} dropped without close, aborting upload of {} bytes",
                self.name, self.bytes_written
            );
            let _ = self.abort_session();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MemoryObject};

    fn writer_for(
        object: &Arc<MemoryObject>,
        block_size: BlockSizePolicy,
        max_buffer_size: u64,
    ) -> MultipartWriter {
        let pool = Arc::new(WorkerPool::new("writer-test", 4).unwrap());
        let options = WriterOptions {
            block_size,
            max_buffer_size,
            retry: RetryPolicy::no_retry(),
        };
        MultipartWriter::new(object.clone(), pool, options).unwrap()
    }

    #[test]
    fn test_fixed_parts() {
        let object = Arc::new(MemoryObject::new("mem://out"));
        let mut writer = writer_for(&object, BlockSizePolicy::Fixed(10), 100);
        let data: Vec<u8> = (0..25).collect();

        writer.write_all(&data).unwrap();
        assert_eq!(writer.parts_dispatched(), 2);
        writer.close().unwrap();

        assert_eq!(writer.parts_dispatched(), 3);
        assert_eq!(writer.state(), WriterState::Closed);
        assert_eq!(object.contents().unwrap(), data);
    }

    #[test]
    fn test_empty_object() {
        let object = Arc::new(MemoryObject::new("mem://empty"));
        let mut writer = writer_for(&object, BlockSizePolicy::Fixed(10), 100);
        writer.write_all(&[]).unwrap();
        writer.close().unwrap();
        assert_eq!(writer.parts_dispatched(), 1);
        assert_eq!(object.contents().unwrap().len(), 0);
    }

    #[test]
    fn test_flush_seals_short_part() {
        let object = Arc::new(MemoryObject::new("mem://flush"));
        let mut writer = writer_for(&object, BlockSizePolicy::Fixed(10), 100);
        writer.write_all(b"abc").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.parts_dispatched(), 1);
        writer.write_all(b"defg").unwrap();
        writer.close().unwrap();
        assert_eq!(object.contents().unwrap(), &b"abcdefg"[..]);
    }

    #[test]
    fn test_autoscale_grows_monotonically() {
        let object = Arc::new(MemoryObject::new("mem://scaled"));
        let mut writer = writer_for(&object, BlockSizePolicy::autoscale(8, 64), 1024);

        let mut sizes = vec![writer.next_block_size()];
        for i in 0..1000u32 {
            writer.write_all(&[(i % 256) as u8]).unwrap();
            sizes.push(writer.next_block_size());
        }
        writer.close().unwrap();

        assert!(sizes.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(sizes.last().unwrap() > &8);
        assert_eq!(object.contents().unwrap().len(), 1000);
    }

    #[test]
    fn test_block_size_policy() {
        let policy = BlockSizePolicy::autoscale(8, 1 << 20);
        assert_eq!(policy.block_size_for(1), 8);
        assert_eq!(policy.block_size_for(9), 8);
        assert_eq!(policy.block_size_for(10), 16);
        assert_eq!(policy.block_size_for(100), 32);
        assert_eq!(policy.block_size_for(1_000), 64);
        assert_eq!(policy.block_size_for(9_999), 64);
        assert_eq!(policy.max_object_size(10_000), 8 * 75_797);

        let capped = BlockSizePolicy::autoscale(8, 20);
        assert_eq!(capped.block_size_for(1_000), 20);
        assert_eq!(BlockSizePolicy::autoscale(8, 4).block_size_for(1), 8);
        assert_eq!(BlockSizePolicy::Fixed(10).max_object_size(3), 30);
    }

    /// Accepts parts but reports every one as empty
    #[derive(Debug)]
    struct ZeroReceipts(MemoryObject);

    impl RemoteObject for ZeroReceipts {
        fn name(&self) -> String {
            self.0.name()
        }

        fn object_size(&self) -> std::result::Result<Option<u64>, BackendError> {
            self.0.object_size()
        }

        fn fetch_range(
            &self,
            offset: u64,
            length: u64,
        ) -> std::result::Result<Bytes, BackendError> {
            self.0.fetch_range(offset, length)
        }

        fn put_part(
            &self,
            index: usize,
            data: Bytes,
        ) -> std::result::Result<PartToken, BackendError> {
            let token = self.0.put_part(index, data)?;
            Ok(PartToken { size: 0, ..token })
        }

        fn complete_upload(&self, tokens: Vec<PartToken>) -> std::result::Result<(), BackendError> {
            self.0.complete_upload(tokens)
        }

        fn abort_upload(&self) -> std::result::Result<(), BackendError> {
            self.0.abort_upload()
        }
    }

    #[test]
    fn test_backpressure_does_not_trust_receipt_sizes() {
        let object = Arc::new(ZeroReceipts(MemoryObject::new("mem://receipts")));
        let pool = Arc::new(WorkerPool::new("writer-test", 2).unwrap());
        let options = WriterOptions {
            block_size: BlockSizePolicy::Fixed(10),
            max_buffer_size: 20,
            retry: RetryPolicy::no_retry(),
        };
        let mut writer = MultipartWriter::new(object.clone(), pool, options).unwrap();

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        for chunk in data.chunks(7) {
            writer.write_all(chunk).unwrap();
            assert!(writer.buffered_bytes() <= 20);
        }
        writer.close().unwrap();
        assert_eq!(object.0.contents().unwrap(), data);
    }

    #[test]
    fn test_write_after_close_is_logical() {
        let object = Arc::new(MemoryObject::new("mem://closed"));
        let mut writer = writer_for(&object, BlockSizePolicy::Fixed(4), 16);
        writer.write_all(b"data").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();

        let err = writer.write_bytes(b"more").unwrap_err();
        assert!(err.is_logical());
    }

    #[test]
    fn test_tell_only_seek() {
        let object = Arc::new(MemoryObject::new("mem://seek"));
        let mut writer = writer_for(&object, BlockSizePolicy::Fixed(4), 16);
        writer.write_all(b"hello").unwrap();
        assert_eq!(writer.seek(SeekFrom::Current(0)).unwrap(), 5);
        assert_eq!(writer.seek(SeekFrom::Start(5)).unwrap(), 5);
        assert!(writer.seek(SeekFrom::Start(0)).is_err());
        assert!(writer.seek(SeekFrom::End(0)).is_err());
        writer.close().unwrap();
    }

    #[test]
    fn test_abort_discards_parts() {
        let object = Arc::new(MemoryObject::new("mem://aborted"));
        let mut writer = writer_for(&object, BlockSizePolicy::Fixed(4), 16);
        writer.write_all(b"0123456789").unwrap();
        writer.abort().unwrap();

        assert_eq!(writer.state(), WriterState::Aborted);
        assert!(object.contents().is_none());
        assert_eq!(object.staged_parts(), 0);
        assert!(writer.close().is_err());
    }

    #[test]
    fn test_drop_aborts_open_writer() {
        let object = Arc::new(MemoryObject::new("mem://dropped"));
        {
            let mut writer = writer_for(&object, BlockSizePolicy::Fixed(4), 16);
            writer.write_all(b"0123456789").unwrap();
        }
        assert!(object.contents().is_none());
        assert_eq!(object.staged_parts(), 0);
    }
}

//! PrefetchReader - seekable, prefetching reads over a remote object

use crate::backend::{BackendError, RemoteObject};
use crate::cache::BlockCache;
use crate::error::{Result, StreamError};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use std::io::{BufRead, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default read block size (8MB)
pub const DEFAULT_READER_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
/// Default read cache budget (128MB)
pub const DEFAULT_READER_MAX_BUFFER_SIZE: u64 = 128 * 1024 * 1024;

/// Tuning for one reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Size of each ranged fetch
    pub block_size: u64,
    /// Byte budget of the block cache; 0 disables caching
    pub max_buffer_size: u64,
    /// Blocks to prefetch past the cursor block; adaptive when `None`
    pub block_forward: Option<usize>,
    /// Retry policy for every fetch
    pub retry: RetryPolicy,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_READER_BLOCK_SIZE,
            max_buffer_size: DEFAULT_READER_MAX_BUFFER_SIZE,
            block_forward: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// A seek target the reader has jumped to recently
#[derive(Debug)]
struct SeekRecord {
    block: u64,
    /// Seeks made since this one
    age: usize,
}

/// Prefetch window size, shrinking while the caller jumps around
#[derive(Debug)]
struct PrefetchWindow {
    capacity: usize,
    size: usize,
    adaptive: bool,
    history: Vec<SeekRecord>,
}

impl PrefetchWindow {
    fn fixed(capacity: usize, size: usize) -> Self {
        Self {
            capacity,
            size,
            adaptive: false,
            history: Vec::new(),
        }
    }

    fn adaptive(capacity: usize) -> Self {
        Self {
            capacity,
            size: capacity,
            adaptive: capacity > 1,
            history: Vec::new(),
        }
    }

    /// Record a jump to `block`
    ///
    /// Each distinct region the caller keeps returning to gets an equal share
    /// of the cache. Regions not revisited within `2 * capacity` seeks age out.
    fn record_seek(&mut self, block: u64) {
        if !self.adaptive {
            return;
        }
        let capacity = self.capacity;
        let mut history: Vec<SeekRecord> = std::mem::take(&mut self.history)
            .into_iter()
            .filter(|record| record.age <= capacity * 2)
            .filter(|record| record.block < block || record.block > block.saturating_add(1))
            .map(|record| SeekRecord {
                age: record.age + 1,
                ..record
            })
            .collect();
        history.push(SeekRecord { block, age: 0 });

        let forward = (capacity / history.len()).min(capacity - 1);
        self.size = forward + 1;
        if forward == 0 {
            trace!("Random access detected, prefetch disabled");
            self.adaptive = false;
            history.clear();
        }
        self.history = history;
    }

    fn blocks(&self) -> usize {
        self.size
    }
}

/// A reader that presents a remote object as `Read + BufRead + Seek`
///
/// The object is split into `block_size` blocks. Reading fetches the block
/// under the cursor and prefetches the following ones on the worker pool;
/// the cache keeps at most `max_buffer_size` bytes, at least one block.
#[derive(Debug)]
pub struct PrefetchReader {
    object: Arc<dyn RemoteObject>,
    name: String,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    block_size: u64,
    /// Max number of cached blocks; 0 means direct reads
    block_capacity: usize,
    window: PrefetchWindow,
    cache: BlockCache,
    position: u64,
    size: Option<u64>,
    /// Whether the backend was asked for the size after reading past the end
    size_rechecked: bool,
    /// Block currently served by `fill_buf`
    current: Option<(u64, Bytes)>,
    closed: bool,
}

impl PrefetchReader {
    /// Open `object` for reading
    pub fn new(
        object: Arc<dyn RemoteObject>,
        pool: Arc<WorkerPool>,
        options: ReaderOptions,
    ) -> Result<Self> {
        if options.block_size == 0 {
            return Err(StreamError::InvalidConfig(
                "reader block size must be greater than 0".to_string(),
            ));
        }

        let block_capacity = if options.max_buffer_size == 0 {
            0
        } else {
            ((options.max_buffer_size / options.block_size) as usize).max(1)
        };

        let window = match options.block_forward {
            _ if block_capacity == 0 => PrefetchWindow::fixed(0, 1),
            Some(forward) if forward >= block_capacity => {
                return Err(StreamError::InvalidConfig(format!(
                    "max_buffer_size should be greater than block_forward * block_size, \
                     got: max_buffer_size={}, block_size={}, block_forward={}",
                    options.max_buffer_size, options.block_size, forward
                )));
            }
            Some(forward) => PrefetchWindow::fixed(block_capacity, forward + 1),
            None => PrefetchWindow::adaptive(block_capacity),
        };

        let name = object.name();
        let size = options
            .retry
            .call(&format!("stat {}", name), || object.object_size())?;

        debug!("open file: {}, mode: rb, size: {:?}", name, size);

        Ok(Self {
            cache: BlockCache::new(block_capacity as u64 * options.block_size),
            object,
            name,
            pool,
            retry: options.retry,
            block_size: options.block_size,
            block_capacity,
            window,
            position: 0,
            size,
            size_rechecked: false,
            current: None,
            closed: false,
        })
    }

    /// Name of the underlying object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the object, once known
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Current position
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Block size used for fetches
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current prefetch window in blocks, cursor block included
    pub fn prefetch_window(&self) -> usize {
        self.window.blocks()
    }

    /// Indices of the blocks currently tracked by the cache
    pub fn cached_blocks(&self) -> Vec<u64> {
        self.cache.indices()
    }

    /// Bytes held by ready blocks plus bytes reserved by in-flight fetches
    pub fn resident_bytes(&mut self) -> u64 {
        self.cache.settle();
        self.cache.resident_bytes()
    }

    /// Bytes held by ready blocks
    pub fn ready_bytes(&mut self) -> u64 {
        self.cache.settle();
        self.cache.ready_bytes()
    }

    /// Cache budget in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.cache.capacity_bytes()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read up to `n` bytes; fewer only at end of object
    ///
    /// If a block cannot be fetched the error names the offset where the
    /// missing data begins and the cursor stays at that offset.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let want = match self.size {
            Some(size) => n.min(size.saturating_sub(self.position) as usize),
            None => n,
        };
        let mut out = Vec::with_capacity(want.min(self.block_size as usize));
        while out.len() < want {
            let available = self.fill()?;
            if available.is_empty() {
                break;
            }
            let take = available.len().min(want - out.len());
            out.extend_from_slice(&available[..take]);
            self.advance(take);
        }
        Ok(out)
    }

    /// Cancel outstanding fetches and drop cached blocks
    ///
    /// Fetch failures that were never read are discarded. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        debug!("close file: {}", self.name);
        self.closed = true;
        self.current = None;
        self.cache.clear();
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, amount: usize) {
        self.position = self.position.saturating_add(amount as u64);
    }

    /// Number of blocks, once the size is known
    fn block_stop(&self) -> Option<u64> {
        self.size.map(|size| size.div_ceil(self.block_size))
    }

    fn block_len(&self, index: u64) -> u64 {
        let start = index.saturating_mul(self.block_size);
        match self.size {
            Some(size) => size.saturating_sub(start).min(self.block_size),
            None => self.block_size,
        }
    }

    fn learn_size(&mut self, size: u64) {
        if self.size != Some(size) {
            trace!("Size of {} settled at {}", self.name, size);
            self.size = Some(size);
        }
    }

    /// Bytes available at the cursor, empty at end of object
    fn fill(&mut self) -> Result<&[u8]> {
        self.ensure_open()?;
        if matches!(self.size, Some(size) if self.position >= size) {
            return Ok(&[]);
        }

        let index = self.position / self.block_size;
        let offset = (self.position - index * self.block_size) as usize;

        let cached = matches!(&self.current, Some((i, data)) if *i == index && offset < data.len());
        if !cached {
            self.current = None;
            let data = match self.load_block(index) {
                Ok(data) => data,
                Err(source) => {
                    return Err(StreamError::BlockUnavailable {
                        offset: self.position,
                        source: Box::new(source),
                    })
                }
            };
            if !data.is_empty() && (data.len() as u64) < self.block_size {
                if self.size.is_none() {
                    let start = index.saturating_mul(self.block_size);
                    self.learn_size(start.saturating_add(data.len() as u64));
                }
            } else if data.is_empty() {
                self.stat_size()?;
            }
            if offset >= data.len() {
                return Ok(&[]);
            }
            self.current = Some((index, data));
        }

        match &self.current {
            Some((_, data)) => Ok(&data[offset..]),
            None => Ok(&[]),
        }
    }

    /// Ask the backend once for a size that no block revealed
    ///
    /// An empty block only says the object ends at or before it, so the
    /// size is never guessed from one.
    fn stat_size(&mut self) -> Result<()> {
        if self.size.is_some() || self.size_rechecked {
            return Ok(());
        }
        self.size_rechecked = true;
        let object = self.object.clone();
        let size = self
            .retry
            .call(&format!("stat {}", self.name), || object.object_size())
            .map_err(|source| StreamError::BlockUnavailable {
                offset: self.position,
                source: Box::new(source),
            })?;
        if let Some(size) = size {
            self.learn_size(size);
        }
        Ok(())
    }

    fn load_block(&mut self, index: u64) -> Result<Bytes> {
        if self.block_capacity == 0 {
            return self.fetch_direct(index);
        }

        let window_end = index.saturating_add(self.window.blocks() as u64);
        let window_end = self.block_stop().map_or(window_end, |stop| window_end.min(stop));
        let window = index..window_end.max(index.saturating_add(1));

        if !self.cache.contains(index) {
            trace!("Cache miss for block {} of {}", index, self.name);
            let len = self.block_len(index);
            self.cache.make_room(index, window.clone(), len);
            if !self.cache.revive(index, len) {
                self.dispatch(index);
            }
        } else {
            trace!("Cache hit for block {} of {}", index, self.name);
            if self.cache.is_pending(index) {
                self.dispatch(index);
            }
        }
        self.cache.touch(index);

        for ahead in index.saturating_add(1)..window.end {
            if self.cache.contains(ahead) {
                continue;
            }
            let len = self.block_len(ahead);
            if !self.cache.reclaim_outside(index, window.clone(), len) {
                break;
            }
            if !self.cache.revive(ahead, len) {
                self.dispatch(ahead);
            }
        }

        self.cache.wait_ready(index)
    }

    fn dispatch(&mut self, index: u64) {
        let offset = index.saturating_mul(self.block_size);
        let length = self.block_len(index);
        let object = self.object.clone();
        let retry = self.retry;
        let operation = format!(
            "fetch {} [{}, {})",
            self.name,
            offset,
            offset.saturating_add(length)
        );

        self.cache.reference(index, length);
        let handle = self
            .pool
            .submit(move || fetch_block(&*object, retry, &operation, offset, length));
        self.cache.start_fetch(index, handle);
    }

    fn fetch_direct(&mut self, index: u64) -> Result<Bytes> {
        let offset = index.saturating_mul(self.block_size);
        let length = self.block_len(index);
        let operation = format!(
            "fetch {} [{}, {})",
            self.name,
            offset,
            offset.saturating_add(length)
        );
        fetch_block(&*self.object, self.retry, &operation, offset, length)
    }
}

/// One retried ranged fetch; a range past the end reads as empty
fn fetch_block(
    object: &dyn RemoteObject,
    retry: RetryPolicy,
    operation: &str,
    offset: u64,
    length: u64,
) -> Result<Bytes> {
    match retry.call(operation, || object.fetch_range(offset, length)) {
        Err(StreamError::Backend(BackendError::RangeNotSatisfiable { .. })) => Ok(Bytes::new()),
        other => other,
    }
}

impl Read for PrefetchReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let available = match self.fill() {
                Ok(available) => available,
                // Hand back what we have; the error resurfaces on the next call.
                Err(_) if filled > 0 => break,
                Err(err) => return Err(err.into()),
            };
            if available.is_empty() {
                break;
            }
            let n = available.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&available[..n]);
            self.advance(n);
            filled += n;
        }
        Ok(filled)
    }
}

impl BufRead for PrefetchReader {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.fill().map_err(Into::into)
    }

    fn consume(&mut self, amt: usize) {
        self.advance(amt);
    }
}

impl Seek for PrefetchReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.ensure_open()?;

        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
            SeekFrom::End(offset) => {
                if self.size.is_none() {
                    let size = self
                        .retry
                        .call(&format!("stat {}", self.name), || self.object.object_size())?;
                    if let Some(size) = size {
                        self.learn_size(size);
                    }
                }
                let size = self.size.ok_or_else(|| StreamError::UnknownSize {
                    name: self.name.clone(),
                })?;
                size as i128 + offset as i128
            }
        };

        if target < 0 {
            return Err(StreamError::InvalidSeek(format!(
                "cannot seek to {} before start of {}",
                target, self.name
            ))
            .into());
        }

        let mut target = target.min(u64::MAX as i128) as u64;
        if let Some(size) = self.size {
            target = target.min(size);
        }
        if target == self.position {
            return Ok(target);
        }

        let block = target / self.block_size;
        if block != self.position / self.block_size {
            self.window.record_seek(block);
        }
        self.position = target;
        Ok(target)
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.position)
    }
}

impl Drop for PrefetchReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

//! LimitedSeekableWriter - multipart uploads whose head can be rewritten
//!
//! Formats such as mp4 or msgpack streams want to patch a header once the
//! body is written. The first `head_block_size` bytes and the last
//! `tail_block_size` bytes stay in memory until close, so the writer can
//! seek back into either; everything in between is uploaded as it comes.

use crate::backend::RemoteObject;
use crate::error::{Result, StreamError};
use crate::pool::WorkerPool;
use crate::writer::{MultipartWriter, WriterOptions, WriterState};
use bytes::Bytes;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, trace};

/// Tuning for one limited seekable writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekableWriterOptions {
    /// Part size, buffer bound and retries of the underlying upload
    pub writer: WriterOptions,
    /// Bytes kept rewritable at the start; defaults to the first part size
    pub head_block_size: Option<u64>,
    /// Bytes kept rewritable at the end; defaults to the first part size
    pub tail_block_size: Option<u64>,
}

/// A writer that allows seeking inside the head or into the tail
///
/// The head becomes part 1 and is uploaded at [`LimitedSeekableWriter::close`];
/// the body is uploaded from part 2 on while writing. Seeking or writing
/// anywhere else is a logical error.
#[derive(Debug)]
pub struct LimitedSeekableWriter {
    inner: MultipartWriter,
    head: Vec<u8>,
    head_block_size: usize,
    /// Bytes `[tail_offset, content_size)` not uploaded yet
    tail: Vec<u8>,
    tail_block_size: usize,
    position: u64,
    content_size: u64,
}

impl LimitedSeekableWriter {
    /// Open `object` for writing
    pub fn new(
        object: Arc<dyn RemoteObject>,
        pool: Arc<WorkerPool>,
        options: SeekableWriterOptions,
    ) -> Result<Self> {
        let first_part = options.writer.block_size.block_size_for(1);
        let head_block_size = options.head_block_size.unwrap_or(first_part);
        let tail_block_size = options.tail_block_size.unwrap_or(first_part);
        if head_block_size == 0 {
            return Err(StreamError::InvalidConfig(
                "head block size must be greater than 0".to_string(),
            ));
        }

        let mut inner = MultipartWriter::new(object, pool, options.writer)?;
        inner.reserve_parts(1);
        debug!(
            "seekable head: {} bytes, tail: {} bytes for {}",
            head_block_size,
            tail_block_size,
            inner.name()
        );

        Ok(Self {
            inner,
            head: Vec::new(),
            head_block_size: head_block_size as usize,
            tail: Vec::new(),
            tail_block_size: tail_block_size as usize,
            position: 0,
            content_size: 0,
        })
    }

    /// Name of the underlying object
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current position
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Bytes written so far, counting from the start of the object
    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    /// Session state
    pub fn state(&self) -> WriterState {
        self.inner.state()
    }

    /// Size of the rewritable head
    pub fn head_block_size(&self) -> u64 {
        self.head_block_size as u64
    }

    /// Size of the rewritable tail
    pub fn tail_block_size(&self) -> u64 {
        self.tail_block_size as u64
    }

    /// Start of the bytes still held in the tail buffer
    pub fn tail_offset(&self) -> u64 {
        self.content_size - self.tail.len() as u64
    }

    /// Write `data` at the current position
    ///
    /// The written range must lie inside the head or start inside the tail.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(0);
        }

        let head_end = self.head_block_size as u64;
        let end = self.position.saturating_add(data.len() as u64);
        if self.position < head_end {
            if end > head_end && self.tail_offset() > head_end {
                return Err(StreamError::Unsupported(format!(
                    "head of {} overflows: {} bytes left, writing {}",
                    self.name(),
                    head_end - self.position,
                    data.len()
                )));
            }
        } else if self.position < self.tail_offset() {
            return Err(self.outside_error("write", self.position));
        }

        let mut rest = data;
        if self.position < head_end {
            let start = self.position as usize;
            let n = rest.len().min(self.head_block_size - start);
            overwrite(&mut self.head, start, &rest[..n]);
            self.advance(n);
            rest = &rest[n..];
        }
        if !rest.is_empty() {
            let start = (self.position - self.tail_offset()) as usize;
            overwrite(&mut self.tail, start, rest);
            self.advance(rest.len());
            self.upload_settled_tail()?;
        }
        Ok(data.len())
    }

    /// Upload head and tail and complete the upload
    ///
    /// Closing a closed writer is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.inner.state() {
            WriterState::Closed => return Ok(()),
            WriterState::Aborted => {
                return Err(StreamError::Closed {
                    name: self.name().to_string(),
                })
            }
            WriterState::Open | WriterState::Closing => {}
        }

        let head = Bytes::from(std::mem::take(&mut self.head));
        self.inner.upload_reserved(1, head)?;
        if !self.tail.is_empty() {
            let tail = Bytes::from(std::mem::take(&mut self.tail));
            self.inner.upload_next(tail)?;
        }
        self.inner.close()
    }

    /// Drop buffered data and abort the upload
    pub fn abort(&mut self) -> Result<()> {
        self.head.clear();
        self.tail.clear();
        self.inner.abort()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.state() != WriterState::Open {
            return Err(StreamError::Closed {
                name: self.name().to_string(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, amount: usize) {
        self.position += amount as u64;
        self.content_size = self.content_size.max(self.position);
    }

    fn outside_error(&self, what: &str, offset: u64) -> StreamError {
        StreamError::Unsupported(format!(
            "can only {} inside the head [0, {}) or the tail [{}, {}] of {}, got offset {}",
            what,
            self.head_block_size,
            self.tail_offset(),
            self.content_size,
            self.name(),
            offset
        ))
    }

    /// Upload the tail up to `tail_block_size` bytes before the cursor once a part fits
    fn upload_settled_tail(&mut self) -> Result<()> {
        let cursor = (self.position - self.tail_offset()) as usize;
        let part_size = self.inner.next_block_size() as usize;
        if cursor < part_size + self.tail_block_size {
            return Ok(());
        }

        let cut = cursor - self.tail_block_size;
        let kept = self.tail.split_off(cut);
        let part = std::mem::replace(&mut self.tail, kept);
        trace!("Uploading {} settled tail bytes of {}", part.len(), self.name());
        self.inner.upload_next(Bytes::from(part))
    }

    fn seek_to(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
            SeekFrom::End(offset) => self.content_size as i128 + offset as i128,
        };
        if target < 0 || target > self.content_size as i128 {
            return Err(StreamError::InvalidSeek(format!(
                "{} is outside [0, {}] of {}",
                target,
                self.content_size,
                self.name()
            )));
        }

        let target = target as u64;
        if target >= self.head_block_size as u64 && target < self.tail_offset() {
            return Err(self.outside_error("seek", target));
        }
        self.position = target;
        Ok(target)
    }
}

/// Write `data` into `buffer` at `start`, growing it past its end as needed
fn overwrite(buffer: &mut Vec<u8>, start: usize, data: &[u8]) {
    let overlap = buffer.len().saturating_sub(start).min(data.len());
    buffer[start..start + overlap].copy_from_slice(&data[..overlap]);
    buffer.extend_from_slice(&data[overlap..]);
}

impl Write for LimitedSeekableWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(buf).map_err(Into::into)
    }

    /// Head and tail must stay rewritable, so nothing is uploaded early
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for LimitedSeekableWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.seek_to(pos).map_err(Into::into)
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryObject;
    use crate::retry::RetryPolicy;
    use crate::writer::BlockSizePolicy;

    fn seekable(
        object: &Arc<MemoryObject>,
        block: u64,
        head: u64,
        tail: u64,
    ) -> LimitedSeekableWriter {
        let pool = Arc::new(WorkerPool::new("seekable-test", 2).unwrap());
        let options = SeekableWriterOptions {
            writer: WriterOptions {
                block_size: BlockSizePolicy::Fixed(block),
                max_buffer_size: 64,
                retry: RetryPolicy::no_retry(),
            },
            head_block_size: Some(head),
            tail_block_size: Some(tail),
        };
        LimitedSeekableWriter::new(object.clone(), pool, options).unwrap()
    }

    #[test]
    fn test_rewrite_header_after_body() {
        let object = Arc::new(MemoryObject::new("mem://header"));
        let mut writer = seekable(&object, 8, 8, 8);
        let body: Vec<u8> = (0..50).collect();

        writer.write_all(b"????").unwrap();
        writer.write_all(&body).unwrap();
        assert_eq!(writer.tail_offset(), 46);

        writer.seek(SeekFrom::Start(0)).unwrap();
        writer.write_all(b"HEAD").unwrap();
        assert_eq!(writer.tell(), 4);
        writer.seek(SeekFrom::End(0)).unwrap();
        writer.write_all(b"tail").unwrap();
        writer.close().unwrap();

        let mut expected = b"HEAD".to_vec();
        expected.extend_from_slice(&body);
        expected.extend_from_slice(b"tail");
        assert_eq!(object.contents().unwrap(), expected);
    }

    #[test]
    fn test_rewrite_inside_tail() {
        let object = Arc::new(MemoryObject::new("mem://tail"));
        let mut writer = seekable(&object, 8, 4, 8);
        let data: Vec<u8> = (0..30).collect();

        writer.write_all(&data).unwrap();
        assert_eq!(writer.seek(SeekFrom::End(-4)).unwrap(), 26);
        writer.write_all(b"ZZZZ").unwrap();
        assert_eq!(writer.content_size(), 30);
        writer.close().unwrap();

        let mut expected = data[..26].to_vec();
        expected.extend_from_slice(b"ZZZZ");
        assert_eq!(object.contents().unwrap(), expected);
    }

    #[test]
    fn test_seek_between_head_and_tail_is_rejected() {
        let object = Arc::new(MemoryObject::new("mem://middle"));
        let mut writer = seekable(&object, 8, 8, 8);
        writer.write_all(&[7u8; 40]).unwrap();

        let err = writer.seek(SeekFrom::Start(20)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(writer.seek(SeekFrom::Start(41)).is_err());
        assert!(writer.seek(SeekFrom::Current(-41)).is_err());

        // Writing from inside the head across its end would touch uploaded bytes.
        writer.seek(SeekFrom::Start(6)).unwrap();
        assert!(writer.write_bytes(b"abcd").unwrap_err().is_logical());
        writer.write_all(b"ab").unwrap();

        // The cursor now sits between head and tail.
        assert!(writer.write_bytes(b"x").unwrap_err().is_logical());
        writer.close().unwrap();

        let mut expected = vec![7u8; 40];
        expected[6..8].copy_from_slice(b"ab");
        assert_eq!(object.contents().unwrap(), expected);
    }

    #[test]
    fn test_small_object_stays_in_head() {
        let object = Arc::new(MemoryObject::new("mem://small"));
        let mut writer = seekable(&object, 8, 16, 8);
        writer.write_all(b"hello").unwrap();
        writer.seek(SeekFrom::Start(0)).unwrap();
        writer.write_all(b"J").unwrap();
        writer.close().unwrap();
        assert_eq!(object.contents().unwrap(), &b"Jello"[..]);

        let empty = Arc::new(MemoryObject::new("mem://nothing"));
        seekable(&empty, 8, 16, 8).close().unwrap();
        assert_eq!(empty.contents().unwrap().len(), 0);
    }

    #[test]
    fn test_write_after_close_is_logical() {
        let object = Arc::new(MemoryObject::new("mem://closed"));
        let mut writer = seekable(&object, 8, 8, 8);
        writer.write_all(b"abc").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.write_bytes(b"d").unwrap_err().is_logical());
        assert!(writer.seek(SeekFrom::Start(0)).is_err());
    }
}

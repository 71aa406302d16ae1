//! Helper utilities for flux-stream testing

use flux_stream::{BlockSizePolicy, ReaderOptions, RetryPolicy, WorkerPool, WriterOptions};
use std::io::Read;
use std::sync::Arc;

/// A dedicated pool, so tests can check its idleness in isolation
pub fn test_pool(workers: usize) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new("flux-test-worker", workers).expect("failed to spawn test pool"))
}

/// `attempts` tries per call without sleeping in between
pub fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: attempts,
        ..RetryPolicy::default()
    }
    .without_delay()
}

/// Reader options with an adaptive window and fast retries
pub fn reader_options(block_size: u64, max_buffer_size: u64) -> ReaderOptions {
    ReaderOptions {
        block_size,
        max_buffer_size,
        block_forward: None,
        retry: fast_retry(3),
    }
}

/// Writer options with fixed part size and fast retries
pub fn fixed_writer_options(block_size: u64, max_buffer_size: u64) -> WriterOptions {
    WriterOptions {
        block_size: BlockSizePolicy::Fixed(block_size),
        max_buffer_size,
        retry: fast_retry(3),
    }
}

/// Reads `reader` to the end in chunks of the given sizes, then the rest
pub fn read_in_chunks<R: Read>(reader: &mut R, sizes: &[usize]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    for &size in sizes {
        let mut chunk = vec![0u8; size];
        let n = read_up_to(reader, &mut chunk)?;
        out.extend_from_slice(&chunk[..n]);
        if n < size {
            return Ok(out);
        }
    }
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Fills `buf` unless the reader hits end of stream first
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

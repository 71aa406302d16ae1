//! Common assertions for flux-stream testing

use anyhow::{bail, Result};
use flux_stream::WorkerPool;
use std::time::{Duration, Instant};

/// Asserts that two byte strings are identical, reporting the first difference
pub fn assert_same_bytes(actual: &[u8], expected: &[u8]) {
    if let Some(offset) = actual.iter().zip(expected).position(|(a, b)| a != b) {
        panic!(
            "Content mismatch at offset {}: got {:#04x}, expected {:#04x}",
            offset, actual[offset], expected[offset]
        );
    }
    assert_eq!(
        actual.len(),
        expected.len(),
        "Length mismatch: got {} bytes, expected {}",
        actual.len(),
        expected.len()
    );
}

/// Waits until `pool` has nothing running or queued
///
/// Cancelled jobs are discarded by the workers asynchronously, so the pool
/// may need a moment to settle after a stream closes.
pub fn assert_pool_idle(pool: &WorkerPool, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let stats = pool.stats();
        if stats.is_idle() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "Pool still busy after {:?}: {} active, {} queued",
                timeout,
                stats.active,
                stats.queued
            );
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Asserts that `values` never decrease
pub fn assert_non_decreasing(values: &[u64]) {
    if let Some(i) = values.windows(2).position(|pair| pair[1] < pair[0]) {
        panic!(
            "Value decreased at position {}: {} -> {}",
            i + 1,
            values[i],
            values[i + 1]
        );
    }
}

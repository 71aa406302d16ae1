//! Common test fixtures for flux-stream testing

use flux_stream::MemoryObject;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Deterministic bytes in which every offset is easy to tell apart
///
/// The period is 251, so block-aligned slices never repeat.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i % 251) as u8) ^ ((i / 251) as u8)).collect()
}

/// Seeded random bytes
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(data.as_mut_slice());
    data
}

/// Seeded random chunk sizes in `0..=max_chunk` that add up to `total`
///
/// Zero-length chunks are included on purpose.
pub fn chunk_sizes(total: usize, max_chunk: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sizes = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let size = rng.gen_range(0..=max_chunk.max(1)).min(remaining);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

/// An in-memory object holding `data`
pub fn memory_object(name: &str, data: &[u8]) -> Arc<MemoryObject> {
    Arc::new(MemoryObject::with_data(name, data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterned_blocks_differ() {
        let data = patterned(4096);
        assert_eq!(data.len(), 4096);
        assert_ne!(&data[0..64], &data[64..128]);
        assert_ne!(&data[0..251], &data[251..502]);
    }

    #[test]
    fn test_chunk_sizes_add_up() {
        let sizes = chunk_sizes(1000, 37, 7);
        assert_eq!(sizes.iter().sum::<usize>(), 1000);
        assert!(sizes.iter().all(|size| *size <= 37));
        assert_eq!(sizes, chunk_sizes(1000, 37, 7));
    }
}

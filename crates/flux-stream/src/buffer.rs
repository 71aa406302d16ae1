//! Part buffer for the multipart writer

use bytes::{Bytes, BytesMut};

/// Accumulates written bytes until a part is full
///
/// The target size can change between parts; it only takes effect for the
/// part being filled when it is raised.
#[derive(Debug)]
pub(crate) struct PartBuffer {
    buffer: BytesMut,
    target: usize,
}

impl PartBuffer {
    /// Create a buffer for parts of `target` bytes
    pub fn new(target: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            target: target.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Room left before the current part is full
    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.buffer.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Copy as much of `data` as fits, returning the number of bytes taken
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.remaining());
        if self.buffer.capacity() == 0 && to_write > 0 {
            self.buffer.reserve(self.target);
        }
        self.buffer.extend_from_slice(&data[..to_write]);
        to_write
    }

    /// Change the size of the part being filled; only while it is empty
    pub fn set_target(&mut self, target: usize) {
        debug_assert!(self.buffer.is_empty());
        self.target = target.max(1);
    }

    /// Take the buffered part and switch to `next_target` for the following one
    pub fn seal(&mut self, next_target: usize) -> Bytes {
        self.target = next_target.max(1);
        self.buffer.split().freeze()
    }

    /// Drop buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

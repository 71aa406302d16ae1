//! In-process remote object

use super::{BackendError, PartToken, RemoteObject};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A remote object held in memory
///
/// Useful for tests and for staging data locally behind the same interface
/// as a real store.
#[derive(Debug)]
pub struct MemoryObject {
    name: String,
    data: Mutex<Option<Bytes>>,
    staged: Mutex<BTreeMap<usize, Bytes>>,
    /// When set, `object_size` answers `None` until the first fetch
    hide_size: bool,
    size_revealed: AtomicBool,
}

impl MemoryObject {
    /// Create an object that does not exist yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(None),
            staged: Mutex::new(BTreeMap::new()),
            hide_size: false,
            size_revealed: AtomicBool::new(false),
        }
    }

    /// Create an object holding `data`
    pub fn with_data(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let object = Self::new(name);
        *object.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(data.into());
        object
    }

    /// Like [`MemoryObject::with_data`], but the size stays unknown until the first fetch
    pub fn with_unknown_size(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let mut object = Self::with_data(name, data);
        object.hide_size = true;
        object
    }

    /// Current committed contents, if the object exists
    pub fn contents(&self) -> Option<Bytes> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of parts uploaded but not yet completed or aborted
    pub fn staged_parts(&self) -> usize {
        self.staged.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn committed(&self) -> Result<Bytes, BackendError> {
        self.contents()
            .ok_or_else(|| BackendError::NotFound(self.name.clone()))
    }
}

impl RemoteObject for MemoryObject {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn object_size(&self) -> Result<Option<u64>, BackendError> {
        let data = self.committed()?;
        if self.hide_size && !self.size_revealed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(data.len() as u64))
    }

    fn fetch_range(&self, offset: u64, length: u64) -> Result<Bytes, BackendError> {
        let data = self.committed()?;
        self.size_revealed.store(true, Ordering::Release);

        let size = data.len() as u64;
        if offset >= size {
            return Err(BackendError::RangeNotSatisfiable { offset });
        }
        let end = offset.saturating_add(length).min(size);
        Ok(data.slice(offset as usize..end as usize))
    }

    fn put_part(&self, index: usize, data: Bytes) -> Result<PartToken, BackendError> {
        if index == 0 || index > self.max_parts() {
            return Err(BackendError::InvalidRequest(format!(
                "part index {} out of range",
                index
            )));
        }
        let size = data.len() as u64;
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(index, data);
        Ok(PartToken {
            index,
            id: format!("{}#{}", self.name, index),
            size,
        })
    }

    fn complete_upload(&self, tokens: Vec<PartToken>) -> Result<(), BackendError> {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        let mut assembled = BytesMut::new();
        for token in &tokens {
            let part = staged.get(&token.index).ok_or_else(|| {
                BackendError::InvalidRequest(format!("part {} was never uploaded", token.index))
            })?;
            assembled.extend_from_slice(part);
        }
        staged.clear();
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(assembled.freeze());
        Ok(())
    }

    fn abort_upload(&self) -> Result<(), BackendError> {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

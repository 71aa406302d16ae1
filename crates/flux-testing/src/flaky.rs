//! Fault-injecting wrapper around any remote object

use bytes::Bytes;
use flux_stream::{BackendError, PartToken, RemoteObject};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// What an injected fault does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the first `n` calls with a timeout, then pass through
    Transient(u32),
    /// Fail every call with a retryable connection reset
    AlwaysTransient,
    /// Fail every call with a non-retryable error
    Fatal,
}

#[derive(Debug)]
struct FaultState {
    fault: Fault,
    hits: u32,
}

impl FaultState {
    fn new(fault: Fault) -> Self {
        Self { fault, hits: 0 }
    }

    fn trigger(&mut self, what: &str) -> Option<BackendError> {
        self.hits += 1;
        match self.fault {
            Fault::Transient(n) if self.hits <= n => {
                Some(BackendError::Timeout(format!("injected timeout on {}", what)))
            }
            Fault::Transient(_) => None,
            Fault::AlwaysTransient => Some(BackendError::ConnectionReset(format!(
                "injected reset on {}",
                what
            ))),
            Fault::Fatal => Some(BackendError::Unauthorized(format!(
                "injected failure on {}",
                what
            ))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wraps a [`RemoteObject`], injecting failures and delays and recording calls
///
/// Fetch faults and delays are keyed by the fetch offset, part faults and
/// delays by the 1-based part index.
#[derive(Debug)]
pub struct FlakyObject {
    inner: Arc<dyn RemoteObject>,
    fetch_faults: Mutex<HashMap<u64, FaultState>>,
    part_faults: Mutex<HashMap<usize, FaultState>>,
    complete_fault: Mutex<Option<FaultState>>,
    size_fault: Mutex<Option<FaultState>>,
    abort_fault: Mutex<Option<FaultState>>,
    fetch_delays: HashMap<u64, Duration>,
    part_delays: HashMap<usize, Duration>,
    random_delay: Option<(Duration, Duration)>,
    max_parts: Option<usize>,
    fetch_counts: Mutex<HashMap<u64, usize>>,
    /// Fetches running per offset, and the most seen at once
    fetches_running: Mutex<HashMap<u64, (usize, usize)>>,
    upload_order: Mutex<Vec<usize>>,
    completed_with: Mutex<Option<Vec<usize>>>,
    aborts: AtomicUsize,
    size_lookups: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Tracks one call in flight
struct ActiveCall<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Tracks one fetch in flight at a given offset
struct ActiveFetch<'a> {
    running: &'a Mutex<HashMap<u64, (usize, usize)>>,
    offset: u64,
}

impl Drop for ActiveFetch<'_> {
    fn drop(&mut self) {
        if let Some((now, _)) = lock(self.running).get_mut(&self.offset) {
            *now -= 1;
        }
    }
}

impl FlakyObject {
    /// Wrap `inner` without any fault
    pub fn new(inner: Arc<dyn RemoteObject>) -> Self {
        Self {
            inner,
            fetch_faults: Mutex::new(HashMap::new()),
            part_faults: Mutex::new(HashMap::new()),
            complete_fault: Mutex::new(None),
            size_fault: Mutex::new(None),
            abort_fault: Mutex::new(None),
            fetch_delays: HashMap::new(),
            part_delays: HashMap::new(),
            random_delay: None,
            max_parts: None,
            fetch_counts: Mutex::new(HashMap::new()),
            fetches_running: Mutex::new(HashMap::new()),
            upload_order: Mutex::new(Vec::new()),
            completed_with: Mutex::new(None),
            aborts: AtomicUsize::new(0),
            size_lookups: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Inject `fault` into fetches starting at `offset`
    pub fn fail_fetch_at(self, offset: u64, fault: Fault) -> Self {
        lock(&self.fetch_faults).insert(offset, FaultState::new(fault));
        self
    }

    /// Inject `fault` into uploads of part `index`
    pub fn fail_part(self, index: usize, fault: Fault) -> Self {
        lock(&self.part_faults).insert(index, FaultState::new(fault));
        self
    }

    /// Inject `fault` into `complete_upload`
    pub fn fail_complete(self, fault: Fault) -> Self {
        *lock(&self.complete_fault) = Some(FaultState::new(fault));
        self
    }

    /// Inject `fault` into `object_size`
    pub fn fail_size(self, fault: Fault) -> Self {
        *lock(&self.size_fault) = Some(FaultState::new(fault));
        self
    }

    /// Inject `fault` into `abort_upload`
    pub fn fail_abort(self, fault: Fault) -> Self {
        *lock(&self.abort_fault) = Some(FaultState::new(fault));
        self
    }

    /// Sleep `delay` before fetches starting at `offset`
    pub fn delay_fetch_at(mut self, offset: u64, delay: Duration) -> Self {
        self.fetch_delays.insert(offset, delay);
        self
    }

    /// Sleep `delay` before uploading part `index`
    pub fn delay_part(mut self, index: usize, delay: Duration) -> Self {
        self.part_delays.insert(index, delay);
        self
    }

    /// Sleep a random time in `[min, max]` before every call without a fixed delay
    pub fn with_random_delay(mut self, min: Duration, max: Duration) -> Self {
        self.random_delay = Some((min, max.max(min)));
        self
    }

    /// Report a different part-count ceiling than the wrapped object
    pub fn with_max_parts(mut self, max_parts: usize) -> Self {
        self.max_parts = Some(max_parts);
        self
    }

    /// Number of fetches issued at `offset`, retries included
    pub fn fetch_count(&self, offset: u64) -> usize {
        lock(&self.fetch_counts).get(&offset).copied().unwrap_or(0)
    }

    /// Number of fetches issued overall
    pub fn total_fetches(&self) -> usize {
        lock(&self.fetch_counts).values().sum()
    }

    /// Offsets fetched at least once, ascending
    pub fn fetched_offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = lock(&self.fetch_counts).keys().copied().collect();
        offsets.sort_unstable();
        offsets
    }

    /// Highest number of fetches at `offset` that ran at the same time
    pub fn peak_fetches_at(&self, offset: u64) -> usize {
        lock(&self.fetches_running)
            .get(&offset)
            .map_or(0, |(_, peak)| *peak)
    }

    /// Highest number of calls that ran at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Part indices in the order their uploads finished
    pub fn upload_order(&self) -> Vec<usize> {
        lock(&self.upload_order).clone()
    }

    /// Part indices passed to the last `complete_upload`, in the order given
    pub fn completed_parts(&self) -> Option<Vec<usize>> {
        lock(&self.completed_with).clone()
    }

    /// Number of `object_size` calls, failed ones included
    pub fn size_lookups(&self) -> usize {
        self.size_lookups.load(Ordering::Acquire)
    }

    /// Number of `abort_upload` calls
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::Acquire)
    }

    fn enter(&self) -> ActiveCall<'_> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        ActiveCall {
            active: &self.active,
        }
    }

    fn enter_fetch(&self, offset: u64) -> ActiveFetch<'_> {
        let mut running = lock(&self.fetches_running);
        let (now, peak) = running.entry(offset).or_insert((0, 0));
        *now += 1;
        *peak = (*peak).max(*now);
        ActiveFetch {
            running: &self.fetches_running,
            offset,
        }
    }

    fn pause(&self, fixed: Option<&Duration>) {
        let delay = match (fixed, self.random_delay) {
            (Some(delay), _) => *delay,
            (None, Some((min, max))) if max > min => {
                let micros = rand::thread_rng().gen_range(min.as_micros()..=max.as_micros());
                Duration::from_micros(micros as u64)
            }
            (None, Some((min, _))) => min,
            (None, None) => Duration::ZERO,
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

impl RemoteObject for FlakyObject {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn object_size(&self) -> Result<Option<u64>, BackendError> {
        self.size_lookups.fetch_add(1, Ordering::AcqRel);
        let injected = lock(&self.size_fault)
            .as_mut()
            .and_then(|state| state.trigger("size"));
        if let Some(err) = injected {
            return Err(err);
        }
        self.inner.object_size()
    }

    fn fetch_range(&self, offset: u64, length: u64) -> Result<Bytes, BackendError> {
        let _call = self.enter();
        let _fetch = self.enter_fetch(offset);
        *lock(&self.fetch_counts).entry(offset).or_insert(0) += 1;
        self.pause(self.fetch_delays.get(&offset));

        let injected = lock(&self.fetch_faults)
            .get_mut(&offset)
            .and_then(|state| state.trigger(&format!("fetch at {}", offset)));
        if let Some(err) = injected {
            trace!("Injecting {} into fetch at {}", err, offset);
            return Err(err);
        }
        self.inner.fetch_range(offset, length)
    }

    fn put_part(&self, index: usize, data: Bytes) -> Result<PartToken, BackendError> {
        let _call = self.enter();
        self.pause(self.part_delays.get(&index));

        let injected = lock(&self.part_faults)
            .get_mut(&index)
            .and_then(|state| state.trigger(&format!("part {}", index)));
        if let Some(err) = injected {
            trace!("Injecting {} into part {}", err, index);
            return Err(err);
        }

        let token = self.inner.put_part(index, data)?;
        lock(&self.upload_order).push(index);
        Ok(token)
    }

    fn complete_upload(&self, tokens: Vec<PartToken>) -> Result<(), BackendError> {
        *lock(&self.completed_with) = Some(tokens.iter().map(|token| token.index).collect());

        let injected = lock(&self.complete_fault)
            .as_mut()
            .and_then(|state| state.trigger("complete"));
        if let Some(err) = injected {
            return Err(err);
        }
        self.inner.complete_upload(tokens)
    }

    fn abort_upload(&self) -> Result<(), BackendError> {
        self.aborts.fetch_add(1, Ordering::AcqRel);

        let injected = lock(&self.abort_fault)
            .as_mut()
            .and_then(|state| state.trigger("abort"));
        if let Some(err) = injected {
            return Err(err);
        }
        self.inner.abort_upload()
    }

    fn max_parts(&self) -> usize {
        self.max_parts.unwrap_or_else(|| self.inner.max_parts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_stream::MemoryObject;

    #[test]
    fn test_transient_fault_clears() {
        let inner = Arc::new(MemoryObject::with_data("mem://flaky", &b"abcdef"[..]));
        let flaky = FlakyObject::new(inner).fail_fetch_at(0, Fault::Transient(2));

        assert!(flaky.fetch_range(0, 3).is_err());
        assert!(flaky.fetch_range(0, 3).is_err());
        assert_eq!(flaky.fetch_range(0, 3).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(flaky.fetch_range(3, 3).unwrap(), Bytes::from_static(b"def"));
        assert_eq!(flaky.fetch_count(0), 3);
        assert_eq!(flaky.total_fetches(), 4);
    }

    #[test]
    fn test_fatal_part_fault() {
        let inner = Arc::new(MemoryObject::new("mem://parts"));
        let flaky = FlakyObject::new(inner).fail_part(2, Fault::Fatal);

        assert!(flaky.put_part(1, Bytes::from_static(b"a")).is_ok());
        let err = flaky.put_part(2, Bytes::from_static(b"b")).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(flaky.upload_order(), vec![1]);
    }

    #[test]
    fn test_size_fault_counts_lookups() {
        let inner = Arc::new(MemoryObject::with_data("mem://size", &b"abc"[..]));
        let flaky = FlakyObject::new(inner).fail_size(Fault::Transient(1));

        assert!(flaky.object_size().is_err());
        assert_eq!(flaky.object_size().unwrap(), Some(3));
        assert_eq!(flaky.size_lookups(), 2);
    }
}

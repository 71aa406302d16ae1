//! Fixed-size worker pool for range fetches and part uploads
//!
//! Jobs are queued FIFO on a crossbeam channel and picked up by a fixed
//! number of named OS threads, so they start in submission order but may
//! finish in any order. Each submission returns a [`TaskHandle`]; a stream
//! groups its handles in a [`TaskSet`] and drains it before it closes.

use crate::error::{Result, StreamError};
use crossbeam_channel::{unbounded, Receiver, Select, Sender, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Worker count of the process-wide pool unless `FLUX_STREAM_MAX_WORKERS` says otherwise
pub const DEFAULT_MAX_WORKERS: usize = 8;

type Job = Box<dyn FnOnce() + Send + 'static>;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    queued: AtomicUsize,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads
    pub workers: usize,
    /// Jobs currently executing
    pub active: usize,
    /// Jobs waiting for a worker (including cancelled ones not yet discarded)
    pub queued: usize,
}

impl PoolStats {
    /// No job running or waiting
    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.queued == 0
    }
}

/// A bounded set of reusable threads
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawn a pool of `workers` threads (at least one)
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!("Started worker pool {} with {} threads", name, workers);

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers: handles,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Get or create the process-wide pool shared by every stream
    pub fn global() -> Result<Arc<WorkerPool>> {
        static POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

        if let Some(pool) = POOL.get() {
            return Ok(pool.clone());
        }

        let workers = std::env::var("FLUX_STREAM_MAX_WORKERS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_WORKERS);
        let pool = WorkerPool::new("flux-stream-worker", workers)?;

        Ok(POOL.get_or_init(|| Arc::new(pool)).clone())
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            active: self.counters.active.load(Ordering::Acquire),
            queued: self.counters.queued.load(Ordering::Acquire),
        }
    }

    /// Queue `f` for execution
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let state = Arc::new(AtomicU8::new(QUEUED));
        let counters = self.counters.clone();

        let job_state = state.clone();
        let job: Job = Box::new(move || {
            counters.queued.fetch_sub(1, Ordering::AcqRel);
            if job_state
                .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            counters.active.fetch_add(1, Ordering::AcqRel);
            let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!("Pool job panicked: {}", message);
                Err(StreamError::WorkerPanicked(message))
            });
            counters.active.fetch_sub(1, Ordering::AcqRel);
            let _ = result_tx.send(result);
        });

        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        let queued = match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !queued {
            // Queue closed: the job was dropped unrun, and with it the result sender.
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
        }

        TaskHandle {
            state,
            receiver: result_rx,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread of pool {} panicked", self.name);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of one submitted job
#[derive(Debug)]
pub struct TaskHandle<T> {
    state: Arc<AtomicU8>,
    receiver: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Prevent the job from starting; returns false if it already started
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            || self.is_cancelled()
    }

    /// Whether the job was cancelled before it started
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether `wait` would return without blocking
    pub fn is_finished(&self) -> bool {
        self.is_cancelled() || !self.receiver.is_empty()
    }

    /// Block until the job finishes
    pub fn wait(self) -> Result<T> {
        if self.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        self.receiver.recv().unwrap_or(Err(StreamError::Cancelled))
    }

    /// Take the result if the job has finished
    pub fn try_take(&self) -> Option<Result<T>> {
        if self.is_cancelled() {
            return Some(Err(StreamError::Cancelled));
        }
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(StreamError::Cancelled)),
        }
    }
}

/// Outstanding jobs of one stream, keyed by block or part index
#[derive(Debug)]
pub struct TaskSet<K, T> {
    tasks: Vec<(K, TaskHandle<T>)>,
}

impl<K, T> Default for TaskSet<K, T> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<K: Copy + PartialEq, T> TaskSet<K, T> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` under `key`
    pub fn push(&mut self, key: K, handle: TaskHandle<T>) {
        self.tasks.push((key, handle));
    }

    /// Number of outstanding jobs
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// No outstanding jobs
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether a job is tracked under `key`
    pub fn contains(&self, key: K) -> bool {
        self.tasks.iter().any(|(k, _)| *k == key)
    }

    /// Keys in submission order
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.tasks.iter().map(|(k, _)| *k)
    }

    /// Stop tracking `key` and hand its job back
    pub fn remove(&mut self, key: K) -> Option<TaskHandle<T>> {
        let index = self.tasks.iter().position(|(k, _)| *k == key)?;
        Some(self.tasks.remove(index).1)
    }

    /// Collect every finished job without blocking
    pub fn reap_finished(&mut self) -> Vec<(K, Result<T>)> {
        let mut finished = Vec::new();
        let mut index = 0;
        while index < self.tasks.len() {
            match self.tasks[index].1.try_take() {
                Some(result) => {
                    let (key, _) = self.tasks.remove(index);
                    finished.push((key, result));
                }
                None => index += 1,
            }
        }
        finished
    }

    /// Block until any job finishes; `None` when the set is empty
    pub fn wait_any(&mut self) -> Option<(K, Result<T>)> {
        if self.tasks.is_empty() {
            return None;
        }
        if let Some(index) = self.tasks.iter().position(|(_, h)| h.is_cancelled()) {
            let (key, _) = self.tasks.remove(index);
            return Some((key, Err(StreamError::Cancelled)));
        }

        let (index, received) = {
            let mut select = Select::new();
            for (_, handle) in &self.tasks {
                select.recv(&handle.receiver);
            }
            let operation = select.select();
            let index = operation.index();
            let received = operation.recv(&self.tasks[index].1.receiver);
            (index, received)
        };

        let (key, _) = self.tasks.remove(index);
        Some((key, received.unwrap_or(Err(StreamError::Cancelled))))
    }

    /// Cancel every job that has not started, then wait for the rest
    pub fn cancel_and_drain(&mut self) -> Vec<(K, Result<T>)> {
        for (_, handle) in &self.tasks {
            handle.cancel();
        }
        self.tasks
            .drain(..)
            .map(|(key, handle)| (key, handle.wait()))
            .collect()
    }

    /// Wait for every job in submission order
    pub fn drain(&mut self) -> Vec<(K, Result<T>)> {
        self.tasks
            .drain(..)
            .map(|(key, handle)| (key, handle.wait()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new("test-pool", 2).unwrap();
        let handle = pool.submit(|| Ok(21 * 2));
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", 3).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut set = TaskSet::new();
        for i in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            set.push(
                i,
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }),
            );
        }
        let results = set.drain();
        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats().is_idle());
    }

    #[test]
    fn test_cancel_before_start() {
        let pool = WorkerPool::new("cancel", 1).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let blocker_gate = gate.clone();
        let blocker = pool.submit(move || {
            blocker_gate.wait();
            Ok(())
        });

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = ran.clone();
        let queued = pool.submit(move || {
            ran_in_job.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(queued.cancel());
        assert!(matches!(queued.wait(), Err(StreamError::Cancelled)));
        gate.wait();
        blocker.wait().unwrap();

        // The cancelled job is discarded once a worker reaches it.
        let after = pool.submit(|| Ok(()));
        after.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let pool = WorkerPool::new("panics", 1).unwrap();
        let handle = pool.submit(|| -> Result<()> { panic!("boom") });
        assert!(matches!(handle.wait(), Err(StreamError::WorkerPanicked(m)) if m == "boom"));
        // The worker survives.
        assert_eq!(pool.submit(|| Ok(7)).wait().unwrap(), 7);
    }

    #[test]
    fn test_wait_any_returns_first_finisher() {
        let pool = WorkerPool::new("any", 2).unwrap();
        let mut set = TaskSet::new();
        set.push(
            1usize,
            pool.submit(|| {
                std::thread::sleep(Duration::from_millis(200));
                Ok("slow")
            }),
        );
        set.push(2usize, pool.submit(|| Ok("fast")));

        let (key, result) = set.wait_any().unwrap();
        assert_eq!(key, 2);
        assert_eq!(result.unwrap(), "fast");
        assert_eq!(set.len(), 1);
        let rest = set.drain();
        assert_eq!(rest[0].0, 1);
    }

    #[test]
    fn test_reap_finished_is_non_blocking() {
        let pool = WorkerPool::new("reap", 1).unwrap();
        let mut set = TaskSet::new();
        let gate = Arc::new(Barrier::new(2));
        let job_gate = gate.clone();
        set.push(
            0u64,
            pool.submit(move || {
                job_gate.wait();
                Ok(())
            }),
        );
        assert!(set.reap_finished().is_empty());
        gate.wait();
        let drained = set.cancel_and_drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].1.is_ok());
    }
}

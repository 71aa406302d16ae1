//! Block cache behind [`PrefetchReader`](crate::PrefetchReader)
//!
//! Blocks are keyed by index in a `BTreeMap` so eviction can walk them in
//! offset order. Ready and in-flight blocks count against the byte budget;
//! the block under the cursor is never evicted.

use crate::error::{Result, StreamError};
use crate::pool::{TaskHandle, TaskSet};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::trace;

/// Lifecycle of one block
#[derive(Debug)]
pub(crate) enum BlockState {
    /// Referenced, not dispatched yet
    Pending,
    /// A fetch is queued or running on the pool
    Fetching(TaskHandle<Bytes>),
    /// Data arrived; shorter than the block only at end of object
    Ready(Bytes),
    /// Fetch failed after retries; raised when the block is read
    Failed(StreamError),
}

#[derive(Debug)]
pub(crate) struct Block {
    /// Expected length, used for budget accounting while in flight
    length: u64,
    state: BlockState,
    last_touched: u64,
}

impl Block {
    fn resident_bytes(&self) -> u64 {
        match &self.state {
            BlockState::Fetching(_) => self.length,
            BlockState::Ready(data) => data.len() as u64,
            BlockState::Pending | BlockState::Failed(_) => 0,
        }
    }

    fn is_fetching(&self) -> bool {
        matches!(self.state, BlockState::Fetching(_))
    }

    /// Move a finished fetch into `Ready`/`Failed` without blocking
    fn settle(&mut self) {
        let finished = match &self.state {
            BlockState::Fetching(handle) => handle.try_take(),
            _ => None,
        };
        if let Some(result) = finished {
            self.state = match result {
                Ok(data) => BlockState::Ready(data),
                Err(err) => BlockState::Failed(err),
            };
        }
    }
}

/// Index-ordered set of blocks with a byte budget
#[derive(Debug)]
pub(crate) struct BlockCache {
    blocks: BTreeMap<u64, Block>,
    capacity_bytes: u64,
    clock: u64,
    /// Evicted fetches that were already running
    ///
    /// A block referenced again while its fetch is still here takes the
    /// fetch back instead of issuing a second one.
    draining: TaskSet<u64, Bytes>,
}

impl BlockCache {
    pub(crate) fn new(capacity_bytes: u64) -> Self {
        Self {
            blocks: BTreeMap::new(),
            capacity_bytes,
            clock: 0,
            draining: TaskSet::new(),
        }
    }

    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub(crate) fn contains(&self, index: u64) -> bool {
        self.blocks.contains_key(&index)
    }

    /// Indices of every tracked block, ascending
    pub(crate) fn indices(&self) -> Vec<u64> {
        self.blocks.keys().copied().collect()
    }

    /// Bytes held by ready blocks plus bytes reserved by in-flight ones
    pub(crate) fn resident_bytes(&self) -> u64 {
        self.blocks.values().map(Block::resident_bytes).sum()
    }

    /// Bytes held by ready blocks only
    pub(crate) fn ready_bytes(&self) -> u64 {
        self.blocks
            .values()
            .filter(|block| matches!(block.state, BlockState::Ready(_)))
            .map(Block::resident_bytes)
            .sum()
    }

    /// Number of evicted fetches still running
    pub(crate) fn draining(&self) -> usize {
        self.draining.len()
    }

    pub(crate) fn reference(&mut self, index: u64, length: u64) {
        self.clock += 1;
        let clock = self.clock;
        self.blocks.entry(index).or_insert(Block {
            length,
            state: BlockState::Pending,
            last_touched: clock,
        });
    }

    /// Track `index` again with its evicted fetch, if that fetch is still draining
    ///
    /// Returns whether the block is tracked afterwards.
    pub(crate) fn revive(&mut self, index: u64, length: u64) -> bool {
        if self.blocks.contains_key(&index) {
            return true;
        }
        let Some(handle) = self.draining.remove(index) else {
            return false;
        };
        trace!("Reusing evicted fetch of block {}", index);
        self.clock += 1;
        let mut block = Block {
            length,
            state: BlockState::Fetching(handle),
            last_touched: self.clock,
        };
        block.settle();
        self.blocks.insert(index, block);
        true
    }

    pub(crate) fn start_fetch(&mut self, index: u64, handle: TaskHandle<Bytes>) {
        if let Some(block) = self.blocks.get_mut(&index) {
            block.state = BlockState::Fetching(handle);
        }
    }

    pub(crate) fn is_pending(&self, index: u64) -> bool {
        matches!(
            self.blocks.get(&index).map(|block| &block.state),
            Some(BlockState::Pending)
        )
    }

    pub(crate) fn touch(&mut self, index: u64) {
        self.clock += 1;
        if let Some(block) = self.blocks.get_mut(&index) {
            block.last_touched = self.clock;
        }
    }

    /// Settle finished fetches and forget discarded ones
    pub(crate) fn settle(&mut self) {
        for block in self.blocks.values_mut() {
            block.settle();
        }
        for (index, _) in self.draining.reap_finished() {
            trace!("Discarded evicted fetch of block {}", index);
        }
    }

    /// Block until `index` is ready and return its data
    ///
    /// A failed block is removed so that a later read fetches it again.
    pub(crate) fn wait_ready(&mut self, index: u64) -> Result<Bytes> {
        {
            let block = self.blocks.get_mut(&index).ok_or_else(|| {
                StreamError::Unsupported(format!("block {} is not tracked", index))
            })?;

            if block.is_fetching() {
                if let BlockState::Fetching(handle) =
                    std::mem::replace(&mut block.state, BlockState::Pending)
                {
                    block.state = match handle.wait() {
                        Ok(data) => BlockState::Ready(data),
                        Err(err) => BlockState::Failed(err),
                    };
                }
            }

            match &block.state {
                BlockState::Ready(data) => return Ok(data.clone()),
                BlockState::Pending => {
                    return Err(StreamError::Unsupported(format!(
                        "block {} was never dispatched",
                        index
                    )))
                }
                BlockState::Failed(_) | BlockState::Fetching(_) => {}
            }
        }

        match self.blocks.remove(&index).map(|block| block.state) {
            Some(BlockState::Failed(err)) => Err(err),
            _ => Err(StreamError::Unsupported(format!(
                "block {} is in an unexpected state",
                index
            ))),
        }
    }

    /// Evict until `incoming` more bytes fit the budget
    ///
    /// `window` is the prefetch window around the cursor block `current`.
    /// Victims, in order: blocks behind the cursor (lowest index first),
    /// blocks past the window (least recently touched first), in-flight
    /// fetches outside the window, then blocks inside the window from the
    /// far end. `current` itself always stays.
    pub(crate) fn make_room(&mut self, current: u64, window: Range<u64>, incoming: u64) {
        self.settle();
        self.forget_failed_outside(current, &window);

        while self.resident_bytes() + incoming > self.capacity_bytes {
            let Some(victim) = self.pick_victim(current, &window, true) else {
                break;
            };
            self.evict(victim);
        }
    }

    /// Like [`BlockCache::make_room`] but never evicts inside `window`
    ///
    /// Returns whether `incoming` bytes now fit.
    pub(crate) fn reclaim_outside(
        &mut self,
        current: u64,
        window: Range<u64>,
        incoming: u64,
    ) -> bool {
        self.settle();
        self.forget_failed_outside(current, &window);

        while self.resident_bytes() + incoming > self.capacity_bytes {
            let Some(victim) = self.pick_victim(current, &window, false) else {
                return false;
            };
            self.evict(victim);
        }
        true
    }

    fn forget_failed_outside(&mut self, current: u64, window: &Range<u64>) {
        self.blocks.retain(|index, block| {
            *index == current
                || window.contains(index)
                || !matches!(block.state, BlockState::Failed(_))
        });
    }

    fn pick_victim(&self, current: u64, window: &Range<u64>, inside: bool) -> Option<u64> {
        let holds_bytes = |block: &Block| block.resident_bytes() > 0;

        let behind = self
            .blocks
            .range(..current)
            .find(|(index, block)| {
                !window.contains(index) && holds_bytes(block) && !block.is_fetching()
            })
            .map(|(index, _)| *index);
        if behind.is_some() {
            return behind;
        }

        let beyond = self
            .blocks
            .range(window.end.max(current.saturating_add(1))..)
            .filter(|(_, block)| holds_bytes(block) && !block.is_fetching())
            .min_by_key(|(_, block)| block.last_touched)
            .map(|(index, _)| *index);
        if beyond.is_some() {
            return beyond;
        }

        let stale_fetch = self
            .blocks
            .iter()
            .find(|(index, block)| {
                **index != current && !window.contains(index) && block.is_fetching()
            })
            .map(|(index, _)| *index);
        if stale_fetch.is_some() || !inside {
            return stale_fetch;
        }

        self.blocks
            .iter()
            .rev()
            .find(|(index, block)| **index != current && holds_bytes(block))
            .map(|(index, _)| *index)
    }

    fn evict(&mut self, index: u64) {
        let Some(block) = self.blocks.remove(&index) else {
            return;
        };
        trace!("Evicting block {}", index);
        if let BlockState::Fetching(handle) = block.state {
            if !handle.cancel() {
                self.draining.push(index, handle);
            }
        }
    }

    /// Cancel or await every outstanding fetch and drop all data
    pub(crate) fn clear(&mut self) {
        let mut outstanding = TaskSet::new();
        for (index, block) in std::mem::take(&mut self.blocks) {
            if let BlockState::Fetching(handle) = block.state {
                outstanding.push(index, handle);
            }
        }
        outstanding.cancel_and_drain();
        self.draining.cancel_and_drain();
    }
}

//! Priority-indexed queue of threads blocked on an exhausted pool.

use std::collections::VecDeque;

use crate::PoolId;

/// Number of priority levels the queue distinguishes.
pub const WAIT_LEVELS: usize = 4;

/// Four FIFO lists of `(thread, pool)` entries, index = priority level.
///
/// The thread identifier type is generic so this crate stays independent of
/// the kernel's id types.
#[derive(Debug, Clone)]
pub struct MemoryWaitQueue<T> {
    levels: [VecDeque<(T, PoolId)>; WAIT_LEVELS],
}

impl<T> Default for MemoryWaitQueue<T> {
    fn default() -> Self {
        Self {
            levels: Default::default(),
        }
    }
}

impl<T: Copy + PartialEq> MemoryWaitQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `thread` to the list for `level`. Levels past the top are
    /// clamped to the highest list.
    pub fn enqueue(&mut self, thread: T, level: usize, pool: PoolId) {
        let level = level.min(WAIT_LEVELS - 1);
        self.levels[level].push_back((thread, pool));
    }

    /// Unlinks `thread` wherever it is queued. Returns the pool it waited on.
    pub fn remove(&mut self, thread: T) -> Option<PoolId> {
        for level in self.levels.iter_mut() {
            if let Some(pos) = level.iter().position(|(t, _)| *t == thread) {
                return level.remove(pos).map(|(_, pool)| pool);
            }
        }
        None
    }

    /// Pops the first waiter on `pool` from the highest non-empty level.
    pub fn next_for(&mut self, pool: PoolId) -> Option<T> {
        for level in self.levels.iter_mut().rev() {
            if let Some(pos) = level.iter().position(|(_, p)| *p == pool) {
                return level.remove(pos).map(|(thread, _)| thread);
            }
        }
        None
    }

    /// Checks whether `thread` is queued.
    pub fn contains(&self, thread: T) -> bool {
        self.levels
            .iter()
            .any(|level| level.iter().any(|(t, _)| *t == thread))
    }

    /// Number of threads queued on `pool`.
    pub fn waiting_on(&self, pool: PoolId) -> usize {
        self.levels
            .iter()
            .map(|level| level.iter().filter(|(_, p)| *p == pool).count())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }
}

//! Pools keyed by id, plus the threads blocked on them.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::{
    MemoryWaitQueue, PoolError, PoolId, PoolResult, PoolStats, SegmentAllocator,
    DEFAULT_ALIGNMENT,
};

/// Registry of segment pools.
///
/// `T` is the thread identifier stored in the memory wait queue.
#[derive(Debug)]
pub struct PoolRegistry<T> {
    pools: BTreeMap<PoolId, SegmentAllocator>,
    next_id: u32,
    alignment: usize,
    waiters: MemoryWaitQueue<T>,
}

impl<T: Copy + PartialEq> Default for PoolRegistry<T> {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            next_id: 1,
            alignment: DEFAULT_ALIGNMENT,
            waiters: MemoryWaitQueue::new(),
        }
    }
}

impl<T: Copy + PartialEq> PoolRegistry<T> {
    /// Creates an empty registry whose pools use `alignment` as granularity.
    pub fn new(alignment: usize) -> PoolResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(PoolError::BadAlignment(alignment));
        }
        Ok(Self {
            alignment,
            ..Self::default()
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Registers a pool over `[base, base + size)` and returns its id.
    pub fn create(&mut self, base: usize, size: usize) -> PoolResult<PoolId> {
        let allocator = SegmentAllocator::new(base, size, self.alignment)?;
        let id = PoolId(self.next_id);
        self.next_id += 1;
        self.pools.insert(id, allocator);
        debug!("{id} created at {base:#x}, {size} bytes");
        Ok(id)
    }

    /// Removes a pool. Refused while any allocation is outstanding or any
    /// thread is still queued for it.
    pub fn delete(&mut self, id: PoolId) -> PoolResult<()> {
        let pool = self.get(id)?;
        let waiters = self.waiters.waiting_on(id);
        if waiters > 0 {
            return Err(PoolError::HasWaiters { pool: id, waiters });
        }
        let free = pool.free_bytes();
        if free != pool.size() {
            return Err(PoolError::InUse {
                pool: id,
                outstanding: pool.size() - free,
            });
        }
        self.pools.remove(&id);
        debug!("{id} deleted");
        Ok(())
    }

    pub fn allocate(&mut self, id: PoolId, size: usize) -> PoolResult<usize> {
        if size == 0 {
            return Err(PoolError::ZeroSize);
        }
        let addr = self.get_mut(id)?.allocate(size)?;
        trace!("{id} allocated {size} bytes at {addr:#x}");
        Ok(addr)
    }

    /// Frees an allocation and returns the number of bytes released.
    pub fn deallocate(&mut self, id: PoolId, addr: usize) -> PoolResult<usize> {
        let released = self.get_mut(id)?.deallocate(addr)?;
        trace!("{id} released {released} bytes at {addr:#x}");
        Ok(released)
    }

    /// Total free bytes in a pool.
    pub fn query(&self, id: PoolId) -> PoolResult<usize> {
        Ok(self.get(id)?.free_bytes())
    }

    pub fn stats(&self, id: PoolId) -> PoolResult<PoolStats> {
        Ok(self.get(id)?.stats())
    }

    /// Checks whether a request of `size` bytes could succeed once the pool
    /// is completely free.
    pub fn can_ever_fit(&self, id: PoolId, size: usize) -> PoolResult<bool> {
        Ok(self.get(id)?.can_ever_fit(size))
    }

    pub fn contains(&self, id: PoolId) -> bool {
        self.pools.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn get(&self, id: PoolId) -> PoolResult<&SegmentAllocator> {
        self.pools.get(&id).ok_or(PoolError::UnknownPool(id))
    }

    fn get_mut(&mut self, id: PoolId) -> PoolResult<&mut SegmentAllocator> {
        self.pools.get_mut(&id).ok_or(PoolError::UnknownPool(id))
    }

    /// Queues `thread` at `level` until memory in `pool` is released.
    pub fn wait(&mut self, thread: T, level: usize, pool: PoolId) {
        self.waiters.enqueue(thread, level, pool);
    }

    /// Pops the highest priority thread waiting on `pool`.
    pub fn wake_next(&mut self, pool: PoolId) -> Option<T> {
        self.waiters.next_for(pool)
    }

    /// Unlinks `thread` from the memory wait queue.
    pub fn cancel_wait(&mut self, thread: T) -> Option<PoolId> {
        self.waiters.remove(thread)
    }

    pub fn waiters(&self) -> &MemoryWaitQueue<T> {
        &self.waiters
    }
}

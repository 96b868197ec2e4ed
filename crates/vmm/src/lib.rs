#![forbid(unsafe_code)]

//! # vmm - segment pools
//!
//! Address-ordered, coalescing free-list allocation over fixed memory
//! regions. A pool never touches the memory it manages: it only hands out
//! addresses inside `[base, base + size)`, so the same allocator backs thread
//! stacks, I/O staging buffers, or any caller-owned region.
//!
//! ## Module Overview
//! - [`segment`]  – one pool: first-fit allocation, merge-on-free.
//! - [`registry`] – pools keyed by [`PoolId`] plus the queue of threads
//!   blocked on an exhausted pool.
//! - [`waitq`]    – the 4-level memory wait queue.

use core::fmt;

use thiserror::Error;

pub mod registry;
pub mod segment;
pub mod waitq;

pub use registry::PoolRegistry;
pub use segment::{Segment, SegmentAllocator};
pub use waitq::{MemoryWaitQueue, WAIT_LEVELS};

/// Default allocation granularity in bytes.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Opaque pool identifier, assigned from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Result type used by the pool layer.
pub type PoolResult<T> = Result<T, PoolError>;

/// Pool errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("requested size is zero")]
    ZeroSize,
    #[error("region {base:#x}+{size:#x} is not usable")]
    InvalidRegion { base: usize, size: usize },
    #[error("alignment {0} is not a power of two")]
    BadAlignment(usize),
    #[error("{0} not found")]
    UnknownPool(PoolId),
    #[error("address {0:#x} lies outside the pool")]
    OutOfBounds(usize),
    #[error("address {0:#x} is not a live allocation")]
    NotAllocated(usize),
    #[error("no free segment can hold {requested} bytes")]
    Exhausted { requested: usize },
    #[error("{pool} still has {outstanding} bytes allocated")]
    InUse { pool: PoolId, outstanding: usize },
    #[error("{pool} still has {waiters} blocked threads")]
    HasWaiters { pool: PoolId, waiters: usize },
}

/// Pool statistics for debugging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes managed by the pool.
    pub size: usize,
    /// Bytes currently free.
    pub free_bytes: usize,
    /// Bytes currently handed out.
    pub used_bytes: usize,
    /// Number of segments on the free list.
    pub free_segments: usize,
    /// Number of live allocations.
    pub live_allocations: usize,
    /// Lowest `free_bytes` ever observed.
    pub min_free_bytes: usize,
}

impl PoolStats {
    /// Checks if nothing is allocated.
    pub const fn is_pristine(&self) -> bool {
        self.used_bytes == 0
    }

    /// Get utilization as a percentage (0-100).
    pub fn utilization(&self) -> u8 {
        if self.size == 0 {
            0
        } else {
            ((self.used_bytes * 100) / self.size) as u8
        }
    }
}

/// Rounds `size` up to a multiple of `alignment` (a power of two).
///
/// Returns `None` on overflow.
pub fn round_up(size: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    size.checked_add(alignment - 1).map(|s| s & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_granularity() {
        assert_eq!(round_up(1, 64), Some(64));
        assert_eq!(round_up(64, 64), Some(64));
        assert_eq!(round_up(100, 64), Some(128));
        assert_eq!(round_up(usize::MAX, 64), None);
    }

    #[test]
    fn stats_utilization() {
        let stats = PoolStats {
            size: 1000,
            free_bytes: 750,
            used_bytes: 250,
            free_segments: 1,
            live_allocations: 2,
            min_free_bytes: 500,
        };
        assert_eq!(stats.utilization(), 25);
        assert!(!stats.is_pristine());
    }
}

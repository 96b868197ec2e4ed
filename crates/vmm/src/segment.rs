//! First-fit, coalescing segment allocator for a single pool.
//!
//! The free list is kept sorted by base address and never contains two
//! address-adjacent segments: every free merges with its neighbours. Free and
//! allocated segments together always tile `[base, base + size)`.

use std::collections::BTreeMap;

use crate::{round_up, PoolError, PoolResult, PoolStats};

/// A contiguous range of pool addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: usize,
    pub size: usize,
}

impl Segment {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// First address past the segment.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Allocator state for one pool.
#[derive(Debug, Clone)]
pub struct SegmentAllocator {
    base: usize,
    size: usize,
    alignment: usize,
    free: Vec<Segment>,
    /// Live allocations: base -> granted size.
    allocated: BTreeMap<usize, usize>,
    min_free: usize,
}

impl SegmentAllocator {
    /// Creates an allocator whose single free segment spans the whole region.
    pub fn new(base: usize, size: usize, alignment: usize) -> PoolResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(PoolError::BadAlignment(alignment));
        }
        if base == 0 || size == 0 || base.checked_add(size).is_none() {
            return Err(PoolError::InvalidRegion { base, size });
        }
        Ok(Self {
            base,
            size,
            alignment,
            free: vec![Segment::new(base, size)],
            allocated: BTreeMap::new(),
            min_free: size,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Free segments in ascending address order.
    pub fn free_segments(&self) -> &[Segment] {
        &self.free
    }

    /// Live allocations in ascending address order.
    pub fn allocations(&self) -> impl Iterator<Item = Segment> + '_ {
        self.allocated
            .iter()
            .map(|(&base, &size)| Segment::new(base, size))
    }

    /// Checks whether `addr` lies inside the managed region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Size actually reserved for a request of `size` bytes.
    pub fn granted_size(&self, size: usize) -> Option<usize> {
        round_up(size, self.alignment)
    }

    /// Checks whether a request could ever succeed, i.e. fits an empty pool.
    pub fn can_ever_fit(&self, size: usize) -> bool {
        matches!(self.granted_size(size), Some(granted) if granted <= self.size)
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|segment| segment.size).sum()
    }

    /// Checks whether every byte is free again.
    pub fn is_pristine(&self) -> bool {
        self.allocated.is_empty()
    }

    /// Allocates `size` bytes (rounded up to the alignment) from the first
    /// free segment, in address order, that is large enough.
    pub fn allocate(&mut self, size: usize) -> PoolResult<usize> {
        if size == 0 {
            return Err(PoolError::ZeroSize);
        }
        let granted = self
            .granted_size(size)
            .ok_or(PoolError::Exhausted { requested: size })?;

        let index = self
            .free
            .iter()
            .position(|segment| segment.size >= granted)
            .ok_or(PoolError::Exhausted { requested: granted })?;

        let addr = self.free[index].base;
        if self.free[index].size == granted {
            self.free.remove(index);
        } else {
            let segment = &mut self.free[index];
            segment.base += granted;
            segment.size -= granted;
        }
        self.allocated.insert(addr, granted);

        let free = self.free_bytes();
        if free < self.min_free {
            self.min_free = free;
        }
        Ok(addr)
    }

    /// Returns the allocation starting at `addr` to the free list, merging it
    /// with adjacent free segments. Returns the number of bytes released.
    pub fn deallocate(&mut self, addr: usize) -> PoolResult<usize> {
        if !self.contains(addr) {
            return Err(PoolError::OutOfBounds(addr));
        }
        let size = self
            .allocated
            .remove(&addr)
            .ok_or(PoolError::NotAllocated(addr))?;
        let released = Segment::new(addr, size);

        // First free segment above the released one.
        let pos = self.free.partition_point(|segment| segment.base < addr);
        let touches_left = pos > 0 && self.free[pos - 1].end() == released.base;
        let touches_right = pos < self.free.len() && self.free[pos].base == released.end();

        match (touches_left, touches_right) {
            (true, true) => {
                let right = self.free.remove(pos);
                self.free[pos - 1].size += released.size + right.size;
            }
            (true, false) => {
                self.free[pos - 1].size += released.size;
            }
            (false, true) => {
                let right = &mut self.free[pos];
                right.base = released.base;
                right.size += released.size;
            }
            (false, false) => {
                self.free.insert(pos, released);
            }
        }
        Ok(size)
    }

    pub fn stats(&self) -> PoolStats {
        let free_bytes = self.free_bytes();
        PoolStats {
            size: self.size,
            free_bytes,
            used_bytes: self.size - free_bytes,
            free_segments: self.free.len(),
            live_allocations: self.allocated.len(),
            min_free_bytes: self.min_free,
        }
    }
}

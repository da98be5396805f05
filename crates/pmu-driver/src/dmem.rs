//! DMEM allocation for command payloads
//!
//! Payload regions are carved out of the software-managed area the firmware
//! advertises in its INIT message. [`RangeAllocator`] is a first-fit free
//! list with coalescing; anything implementing [`DmemAllocator`] can replace it.

use crate::error::{PmuError, Result};
use pmu_chip::wire::DMEM_ALLOC_ALIGNMENT;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// A region of falcon DMEM owned by one in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmemRegion {
    /// Byte offset in DMEM
    pub offset: u32,
    /// Requested size in bytes
    pub size: u32,
}

/// Allocator for falcon DMEM.
pub trait DmemAllocator: Debug + Send {
    /// Allocate `size` bytes, returning the DMEM offset.
    ///
    /// # Errors
    ///
    /// [`PmuError::DmemExhausted`] when no free range is large enough.
    fn alloc(&mut self, size: u32) -> Result<u32>;

    /// Return a region obtained from [`alloc`](Self::alloc).
    fn free(&mut self, offset: u32, size: u32);
}

const fn align_up(size: u32) -> u32 {
    (size + DMEM_ALLOC_ALIGNMENT - 1) & !(DMEM_ALLOC_ALIGNMENT - 1)
}

/// First-fit allocator over one contiguous DMEM range.
#[derive(Debug)]
pub struct RangeAllocator {
    base: u32,
    size: u32,
    /// Free ranges keyed by offset.
    free: BTreeMap<u32, u32>,
    /// Live allocations: offset → aligned size.
    live: BTreeMap<u32, u32>,
}

impl RangeAllocator {
    /// Manage `[base, base + size)`. `base` is rounded up to the allocation
    /// alignment and the usable size shrinks accordingly.
    pub fn new(base: u32, size: u32) -> Self {
        let start = align_up(base);
        let usable = size.saturating_sub(start - base) & !(DMEM_ALLOC_ALIGNMENT - 1);
        let mut free = BTreeMap::new();
        if usable > 0 {
            free.insert(start, usable);
        }
        tracing::debug!("DMEM allocator over {start:#x}+{usable:#x}");
        Self {
            base: start,
            size: usable,
            free,
            live: BTreeMap::new(),
        }
    }

    /// Start of the managed range.
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Bytes currently free.
    pub fn available(&self) -> u32 {
        self.free.values().sum()
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Total managed bytes.
    pub const fn capacity(&self) -> u32 {
        self.size
    }
}

impl DmemAllocator for RangeAllocator {
    fn alloc(&mut self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(PmuError::invalid_command("zero-sized DMEM allocation"));
        }
        let need = align_up(size);
        let (offset, len) = self
            .free
            .iter()
            .find(|(_, len)| **len >= need)
            .map(|(o, l)| (*o, *l))
            .ok_or(PmuError::DmemExhausted { size })?;

        self.free.remove(&offset);
        if len > need {
            self.free.insert(offset + need, len - need);
        }
        self.live.insert(offset, need);
        tracing::trace!("DMEM alloc {size} bytes at {offset:#x}");
        Ok(offset)
    }

    fn free(&mut self, offset: u32, size: u32) {
        let Some(len) = self.live.remove(&offset) else {
            tracing::warn!("DMEM free of unknown region {offset:#x}+{size}");
            return;
        };
        if len != align_up(size) {
            tracing::warn!("DMEM free at {offset:#x}: size {size} does not match allocation {len}");
        }

        let mut start = offset;
        let mut merged = len;
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            merged += next_len;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                merged += prev_len;
            }
        }
        self.free.insert(start, merged);
        tracing::trace!("DMEM free {offset:#x}");
    }
}

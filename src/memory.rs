//! Host-side memory for the reference accelerator service
//!
//! `MemoryPool` backs the remote buffers clients allocate; `LocalMemory`
//! models an engine's LMem, a flat byte-addressed region.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Configuration for the memory pool
#[derive(Clone, Debug)]
pub struct MemoryPoolConfig {
    /// Total size of the memory pool in bytes
    pub size: usize,
    /// Alignment for allocations
    pub alignment: usize,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            size: 256 * 1024 * 1024, // 256MB default
            alignment: 64,
        }
    }
}

/// Bump allocator with a coalescing free list
struct BumpAllocator {
    /// High-water mark of the bump region
    offset: usize,
    capacity: usize,
    alignment: usize,
    /// Free blocks below `offset`: offset -> size
    free_list: BTreeMap<usize, usize>,
}

impl BumpAllocator {
    fn new(capacity: usize, alignment: usize) -> Self {
        Self {
            offset: 0,
            capacity,
            alignment: alignment.max(1).next_power_of_two(),
            free_list: BTreeMap::new(),
        }
    }

    /// `None` when rounding up overflows
    fn align_up(&self, value: usize) -> Option<usize> {
        value
            .checked_add(self.alignment - 1)
            .map(|v| v & !(self.alignment - 1))
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return Some(self.offset);
        }
        let size = self.align_up(size)?;

        // First fit from the free list
        let found = self
            .free_list
            .iter()
            .find(|(_, block_size)| **block_size >= size)
            .map(|(&offset, &block_size)| (offset, block_size));

        if let Some((offset, block_size)) = found {
            self.free_list.remove(&offset);
            if block_size > size {
                self.free_list.insert(offset + size, block_size - size);
            }
            return Some(offset);
        }

        match self.offset.checked_add(size) {
            Some(end) if end <= self.capacity => {}
            _ => return None,
        }
        let offset = self.offset;
        self.offset += size;
        Some(offset)
    }

    fn deallocate(&mut self, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        let mut start = offset;
        // Sizes handed out by allocate always align
        let Some(mut size) = self.align_up(size) else {
            return;
        };

        // Merge with the preceding block
        if let Some((&prev, &prev_size)) = self.free_list.range(..start).next_back() {
            if prev + prev_size == start {
                self.free_list.remove(&prev);
                start = prev;
                size += prev_size;
            }
        }
        // Merge with the following block
        if let Some(next_size) = self.free_list.remove(&(start + size)) {
            size += next_size;
        }

        if start + size == self.offset {
            self.offset = start;
        } else {
            self.free_list.insert(start, size);
        }
    }

    fn used(&self) -> usize {
        self.offset - self.free_list.values().sum::<usize>()
    }

    fn available(&self) -> usize {
        self.capacity - self.used()
    }
}

/// Memory pool holding every remote buffer of the service
pub struct MemoryPool {
    buffer: Vec<u8>,
    allocator: Mutex<BumpAllocator>,
}

impl MemoryPool {
    pub fn new(config: MemoryPoolConfig) -> Self {
        Self {
            buffer: vec![0u8; config.size],
            allocator: Mutex::new(BumpAllocator::new(config.size, config.alignment)),
        }
    }

    /// Allocate a region within the pool
    pub fn allocate(&self, size: usize) -> Result<PoolAllocation> {
        let offset = self
            .allocator
            .lock()
            .allocate(size)
            .ok_or_else(|| anyhow!("Memory pool exhausted ({} bytes requested)", size))?;

        Ok(PoolAllocation { offset, size })
    }

    /// Return a region to the pool
    pub fn deallocate(&self, allocation: &PoolAllocation) {
        self.allocator
            .lock()
            .deallocate(allocation.offset, allocation.size);
    }

    /// Write data to a specific offset in the pool
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if !in_bounds(offset, data.len(), self.buffer.len()) {
            return Err(anyhow!("Write exceeds pool bounds"));
        }
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read data from a specific offset in the pool
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if !in_bounds(offset, len, self.buffer.len()) {
            return Err(anyhow!("Read exceeds pool bounds"));
        }
        Ok(&self.buffer[offset..offset + len])
    }

    pub fn stats(&self) -> PoolStats {
        let alloc = self.allocator.lock();
        PoolStats {
            total: self.buffer.len(),
            used: alloc.used(),
            available: alloc.available(),
        }
    }
}

fn in_bounds(offset: usize, len: usize, total: usize) -> bool {
    matches!(offset.checked_add(len), Some(end) if end <= total)
}

/// Represents an allocation within the memory pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolAllocation {
    pub offset: usize,
    pub size: usize,
}

/// Memory pool statistics
#[derive(Clone, Debug)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub available: usize,
}

/// An engine's local memory
pub struct LocalMemory {
    bytes: Vec<u8>,
}

impl LocalMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn check_range(&self, address: u64, len: usize) -> Result<usize> {
        let start = usize::try_from(address)
            .map_err(|_| anyhow!("LMem address {} out of range", address))?;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start),
            _ => Err(anyhow!(
                "LMem access [{}, +{}) exceeds LMem size {}",
                address,
                len,
                self.bytes.len()
            )),
        }
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let start = self.check_range(address, data.len())?;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, address: u64, len: usize) -> Result<&[u8]> {
        let start = self.check_range(address, len)?;
        Ok(&self.bytes[start..start + len])
    }
}

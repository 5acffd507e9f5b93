//! Caching device-memory allocator.
//!
//! Blocks returned by dropped [`Buffer`]s are not released to the device;
//! they go into a recycle pool keyed by exact byte size and are handed out
//! again to the next request of that size. When the device refuses an
//! allocation the whole pool is evicted and the request retried once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::gpu::buffer::Buffer;
use crate::gpu::device::{BlockId, Device, DeviceBlock, DeviceError};

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Out of device memory: cannot allocate {nbytes} bytes even after evicting the recycle pool")]
    OutOfMemory {
        nbytes: usize,
        #[source]
        source: DeviceError,
    },
}

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Blocks owned by outstanding buffers.
    pub live_blocks: usize,
    /// Bytes owned by outstanding buffers.
    pub live_bytes: usize,
    /// Blocks sitting in the recycle pool.
    pub pooled_blocks: usize,
    /// Bytes sitting in the recycle pool.
    pub pooled_bytes: usize,
    /// Allocations served from the pool.
    pub hits: u64,
    /// Allocations that went to the device.
    pub misses: u64,
    /// Pooled blocks released back to the device.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct AllocatorState {
    /// Block identity -> size, for blocks owned by a buffer.
    live_blocks: HashMap<BlockId, usize>,

    /// Size -> blocks nobody owns. Exact sizes only.
    recycle_pool: HashMap<usize, Vec<DeviceBlock>>,

    /// Sum of `live_blocks` sizes.
    total_bytes: usize,

    pooled_blocks: usize,
    pooled_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl AllocatorState {
    fn take_pooled(&mut self, nbytes: usize) -> Option<DeviceBlock> {
        let blocks = self.recycle_pool.get_mut(&nbytes)?;
        let block = blocks.pop()?;
        if blocks.is_empty() {
            self.recycle_pool.remove(&nbytes);
        }
        self.pooled_blocks -= 1;
        self.pooled_bytes -= nbytes;
        Some(block)
    }

    fn pool(&mut self, nbytes: usize, block: DeviceBlock) {
        self.recycle_pool.entry(nbytes).or_default().push(block);
        self.pooled_blocks += 1;
        self.pooled_bytes += nbytes;
    }

    fn drain_pool(&mut self) -> Vec<DeviceBlock> {
        self.pooled_blocks = 0;
        self.pooled_bytes = 0;
        self.recycle_pool.drain().flat_map(|(_, blocks)| blocks).collect()
    }
}

/// State shared between the allocator handle and the buffers it issued.
///
/// Buffers only hold a `Weak` to this, so once every allocator handle is
/// gone they fall back to releasing straight to the device.
#[derive(Debug)]
pub(crate) struct AllocatorShared {
    device: Arc<dyn Device>,
    state: Mutex<AllocatorState>,
}

impl AllocatorShared {
    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(&self, state: &mut AllocatorState) -> usize {
        let blocks = state.drain_pool();
        let count = blocks.len();
        for block in blocks {
            self.device.release(block);
        }
        state.evictions += count as u64;
        count
    }

    /// Move a block from `live_blocks` into the recycle pool.
    ///
    /// Hands the block back if this allocator does not track it.
    pub(crate) fn reclaim(&self, block: DeviceBlock) -> Result<(), DeviceBlock> {
        let mut state = self.lock();
        let Some(nbytes) = state.live_blocks.remove(&block.id()) else {
            warn!(block = block.id(), "Buffer was not allocated by this allocator");
            return Err(block);
        };
        state.total_bytes -= nbytes;
        trace!(block = block.id(), nbytes, "Returned block to recycle pool");
        state.pool(nbytes, block);
        Ok(())
    }
}

impl Drop for AllocatorShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.live_blocks.is_empty() {
            warn!(
                outstanding = state.live_blocks.len(),
                bytes = state.total_bytes,
                "Allocator torn down with live buffers; they will release directly to the device"
            );
        }

        let blocks = state.drain_pool();
        let released = blocks.len();
        for block in blocks {
            self.device.release(block);
        }
        debug!(released, device = self.device.name(), "Allocator torn down");
    }
}

/// Caching allocator for one device.
///
/// Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    shared: Arc<AllocatorShared>,
}

impl DeviceAllocator {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            shared: Arc::new(AllocatorShared {
                device,
                state: Mutex::new(AllocatorState::default()),
            }),
        }
    }

    /// Allocate a buffer of exactly `nbytes`.
    ///
    /// A zero-byte request yields an empty buffer without touching the device.
    pub fn alloc(&self, nbytes: usize) -> Result<Buffer, AllocatorError> {
        if nbytes == 0 {
            warn!("Allocator created buffer with 0 size");
            return Ok(self.buffer(None, 0));
        }

        let shared = &self.shared;
        let mut state = shared.lock();

        let block = match state.take_pooled(nbytes) {
            Some(block) => {
                state.hits += 1;
                trace!(block = block.id(), nbytes, "Reused pooled block");
                block
            }
            None => {
                state.misses += 1;
                match shared.device.allocate(nbytes) {
                    Ok(block) => block,
                    Err(err) => {
                        let evicted = shared.evict(&mut state);
                        warn!(
                            nbytes,
                            evicted,
                            error = %err,
                            "Device allocation failed, evicted recycle pool and retrying"
                        );
                        shared.device.allocate(nbytes).map_err(|source| {
                            error!(nbytes, error = %source, "Cannot allocate buffer");
                            AllocatorError::OutOfMemory { nbytes, source }
                        })?
                    }
                }
            }
        };

        state.live_blocks.insert(block.id(), nbytes);
        state.total_bytes += nbytes;
        debug!(
            block = block.id(),
            nbytes,
            live_bytes = state.total_bytes,
            "Allocated buffer"
        );
        drop(state);

        Ok(self.buffer(Some(block), nbytes))
    }

    /// Return a buffer's block to the pool, leaving the buffer empty.
    ///
    /// Buffers from another allocator, or already-empty buffers, are left
    /// untouched.
    pub fn free(&self, buffer: &mut Buffer) {
        let Some(id) = buffer.id() else {
            trace!("Free called on empty buffer");
            return;
        };
        if !buffer.is_from(&self.shared) {
            warn!(block = id, "Buffer was not allocated by this allocator");
            return;
        }
        let len = buffer.len();
        if let Some(block) = buffer.take_block() {
            if let Err(block) = self.shared.reclaim(block) {
                buffer.restore_block(block, len);
            }
        }
    }

    /// Release every pooled block to the device. Returns how many were released.
    pub fn evict_pool(&self) -> usize {
        let mut state = self.shared.lock();
        let evicted = self.shared.evict(&mut state);
        debug!(evicted, "Evicted recycle pool");
        evicted
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.shared.lock();
        AllocatorStats {
            live_blocks: state.live_blocks.len(),
            live_bytes: state.total_bytes,
            pooled_blocks: state.pooled_blocks,
            pooled_bytes: state.pooled_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Number of blocks owned by outstanding buffers.
    pub fn live_count(&self) -> usize {
        self.shared.lock().live_blocks.len()
    }

    /// Bytes owned by outstanding buffers.
    pub fn live_bytes(&self) -> usize {
        self.shared.lock().total_bytes
    }

    /// Number of blocks waiting in the recycle pool.
    pub fn pooled_count(&self) -> usize {
        self.shared.lock().pooled_blocks
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.shared.device
    }

    fn buffer(&self, block: Option<DeviceBlock>, len: usize) -> Buffer {
        Buffer::new(
            block,
            len,
            Arc::clone(&self.shared.device),
            Arc::downgrade(&self.shared),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::host::HostDevice;

    fn allocator(capacity: usize) -> (Arc<HostDevice>, DeviceAllocator) {
        let device = Arc::new(HostDevice::with_capacity(capacity));
        let alloc = DeviceAllocator::new(device.clone());
        (device, alloc)
    }

    #[test]
    fn test_allocate_and_recycle() {
        let (device, alloc) = allocator(1 << 20);

        let buf = alloc.alloc(1024).unwrap();
        let id = buf.id().unwrap();
        assert_eq!(alloc.live_count(), 1);
        assert_eq!(alloc.live_bytes(), 1024);

        drop(buf);
        assert_eq!(alloc.live_count(), 0);
        assert_eq!(alloc.pooled_count(), 1);

        let again = alloc.alloc(1024).unwrap();
        assert_eq!(again.id(), Some(id));
        assert_eq!(device.allocate_calls(), 1);

        let stats = alloc.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.pooled_blocks, 0);
    }

    #[test]
    fn test_zero_size_skips_device() {
        let (device, alloc) = allocator(1024);

        let buf = alloc.alloc(0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        drop(buf);

        assert_eq!(device.allocate_calls(), 0);
        assert_eq!(alloc.stats(), AllocatorStats::default());
    }

    #[test]
    fn test_explicit_free_leaves_buffer_empty() {
        let (_device, alloc) = allocator(4096);

        let mut buf = alloc.alloc(512).unwrap();
        alloc.free(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(alloc.pooled_count(), 1);

        // Second free is a no-op.
        alloc.free(&mut buf);
        assert_eq!(alloc.pooled_count(), 1);
    }

    #[test]
    fn test_evict_pool_releases_to_device() {
        let (device, alloc) = allocator(4096);

        let a = alloc.alloc(1024).unwrap();
        let b = alloc.alloc(2048).unwrap();
        drop(a);
        drop(b);
        assert_eq!(device.resident_bytes(), 3072);

        assert_eq!(alloc.evict_pool(), 2);
        assert_eq!(device.resident_bytes(), 0);
        assert_eq!(alloc.stats().evictions, 2);
    }

    #[test]
    fn test_teardown_releases_pool() {
        let (device, alloc) = allocator(4096);

        drop(alloc.alloc(1024).unwrap());
        assert_eq!(device.resident_bytes(), 1024);

        drop(alloc);
        assert_eq!(device.resident_bytes(), 0);
        assert_eq!(device.release_calls(), 1);
    }
}

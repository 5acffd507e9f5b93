//! RAII owner of one device block.

use std::fmt;
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use tracing::debug;

use crate::gpu::allocator::AllocatorShared;
use crate::gpu::device::{BlockId, Device, DeviceBlock, DeviceError};

/// Exclusive owner of a device block issued by a
/// [`DeviceAllocator`](crate::gpu::allocator::DeviceAllocator).
///
/// Dropping the buffer returns the block to its allocator's recycle pool. If
/// that allocator is already gone, the block is released to the device
/// directly. A default-constructed buffer is empty and owns nothing.
#[derive(Default)]
pub struct Buffer {
    block: Option<DeviceBlock>,
    len: usize,
    device: Option<Arc<dyn Device>>,
    origin: Weak<AllocatorShared>,
}

impl Buffer {
    pub(crate) fn new(
        block: Option<DeviceBlock>,
        len: usize,
        device: Arc<dyn Device>,
        origin: Weak<AllocatorShared>,
    ) -> Self {
        Self {
            block,
            len,
            device: Some(device),
            origin,
        }
    }

    /// Declared length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the buffer owns no block (zero-sized, freed or moved-from).
    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    pub fn block(&self) -> Option<&DeviceBlock> {
        self.block.as_ref()
    }

    pub fn id(&self) -> Option<BlockId> {
        self.block.as_ref().map(DeviceBlock::id)
    }

    /// Move the contents out, leaving `self` empty.
    pub fn take(&mut self) -> Buffer {
        std::mem::take(self)
    }

    /// Return the block to the allocator now instead of at scope end.
    pub fn free(self) {
        drop(self);
    }

    /// Upload `values` to the start of the buffer.
    pub fn write<T: Pod>(&self, values: &[T]) -> Result<(), DeviceError> {
        self.write_bytes(0, bytemuck::cast_slice(values))
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        match (&self.block, &self.device) {
            (Some(block), Some(device)) => device.write(block, offset, data),
            _ if data.is_empty() => Ok(()),
            _ => Err(DeviceError::OutOfBounds {
                offset,
                len: data.len(),
                size: 0,
            }),
        }
    }

    /// Download the whole buffer as elements of `T`.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>, DeviceError> {
        let size = std::mem::size_of::<T>();
        if size == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.read_bytes()?;
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>, DeviceError> {
        let mut out = vec![0u8; self.len];
        if let (Some(block), Some(device)) = (&self.block, &self.device) {
            device.read(block, 0, &mut out)?;
        }
        Ok(out)
    }

    pub(crate) fn is_from(&self, shared: &Arc<AllocatorShared>) -> bool {
        std::ptr::eq(self.origin.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn take_block(&mut self) -> Option<DeviceBlock> {
        let block = self.block.take();
        if block.is_some() {
            self.len = 0;
        }
        block
    }

    pub(crate) fn restore_block(&mut self, block: DeviceBlock, len: usize) {
        self.len = len;
        self.block = Some(block);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };

        let orphan = match self.origin.upgrade() {
            Some(shared) => shared.reclaim(block).err(),
            None => Some(block),
        };

        if let (Some(block), Some(device)) = (orphan, &self.device) {
            debug!(
                block = block.id(),
                nbytes = block.len(),
                "Releasing buffer directly to device"
            );
            device.release(block);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("block", &self.id())
            .field("len", &self.len)
            .finish()
    }
}

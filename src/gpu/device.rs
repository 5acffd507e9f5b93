//! Device capability consumed by the allocator and the dispatch path.
//!
//! A [`Device`] hands out opaque [`DeviceBlock`]s, takes them back, and opens
//! [`Submission`]s on its command queue. Backends implement this trait; the
//! crate ships a host-memory simulation in [`crate::gpu::host`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use thiserror::Error;

use crate::gpu::library::Pipeline;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Block {0} is not resident on this device")]
    UnknownBlock(BlockId),

    #[error("Access out of bounds: offset {offset} + {len} exceeds block size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Submission committed without a pipeline")]
    NoPipeline,

    #[error("Kernel execution failed: {0}")]
    Execution(String),
}

/// Identity of a device block.
pub type BlockId = u64;

/// Process-wide block counter, so identities never collide across devices.
static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a new unique block ID. Backends call this from `allocate`.
pub fn new_block_id() -> BlockId {
    NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle to a contiguous region of device memory.
///
/// Not `Clone`: whoever holds the handle owns the region, and it
/// goes back to the device only through [`Device::release`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceBlock {
    id: BlockId,
    len: usize,
}

impl DeviceBlock {
    /// Wrap a backend allocation. Only device implementations should call this.
    pub fn new(id: BlockId, len: usize) -> Self {
        Self { id, len }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Callback that takes back ownership of a context blob's bytes.
pub type BlobDeleter = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Out-of-band argument bytes passed to a kernel next to its buffers.
///
/// The blob owns its bytes until the submission it was bound to is
/// reclaimed; at that point the deleter (if any) receives them back.
pub struct ContextBlob {
    data: Vec<u8>,
    deleter: Option<BlobDeleter>,
}

impl ContextBlob {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            deleter: None,
        }
    }

    pub fn with_deleter(data: Vec<u8>, deleter: impl FnOnce(Vec<u8>) + Send + 'static) -> Self {
        Self {
            data,
            deleter: Some(Box::new(deleter)),
        }
    }

    /// Pack plain scalars (or small arrays) into a blob.
    pub fn from_pod<T: Pod>(values: &[T]) -> Self {
        Self::new(bytemuck::cast_slice(values).to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for ContextBlob {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            deleter(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for ContextBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBlob")
            .field("len", &self.data.len())
            .field("has_deleter", &self.deleter.is_some())
            .finish()
    }
}

/// One unit of work on the device's command queue.
///
/// Everything bound to a submission (including a context blob) is released
/// when the submission is dropped, whether or not it was committed.
pub trait Submission {
    fn set_pipeline(&mut self, pipeline: Arc<dyn Pipeline>);

    /// Bind a buffer at `index`. `None` binds an empty (zero-length) argument.
    fn set_buffer(&mut self, index: usize, block: Option<&DeviceBlock>);

    /// Bind a context blob at `index`; the submission takes ownership.
    fn set_context(&mut self, index: usize, blob: ContextBlob);

    /// Record a 1D dispatch of `grid` threads in groups of `group`.
    fn dispatch(&mut self, grid: usize, group: usize);

    /// Submit and block until the device reports completion.
    fn commit_and_wait(&mut self) -> Result<(), DeviceError>;
}

/// Device capability: memory blocks plus a command queue.
pub trait Device: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn allocate(&self, nbytes: usize) -> Result<DeviceBlock, DeviceError>;

    fn release(&self, block: DeviceBlock);

    fn new_submission(&self) -> Result<Box<dyn Submission + '_>, DeviceError>;

    /// Copy host bytes into a shared-storage block.
    fn write(&self, block: &DeviceBlock, offset: usize, data: &[u8]) -> Result<(), DeviceError>;

    /// Copy a shared-storage block's bytes back to the host.
    fn read(&self, block: &DeviceBlock, offset: usize, out: &mut [u8]) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_block_ids_are_unique() {
        let a = new_block_id();
        let b = new_block_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_context_blob_deleter_runs_once_with_data() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        let blob = {
            let calls = calls.clone();
            let seen = seen.clone();
            ContextBlob::with_deleter(vec![1, 2, 3], move |data| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.store(data.len(), Ordering::SeqCst);
            })
        };
        assert_eq!(blob.len(), 3);
        drop(blob);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_context_blob_from_pod() {
        let blob = ContextBlob::from_pod(&[1.5f32, -2.0]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob.as_bytes()[..4], &1.5f32.to_ne_bytes());
    }
}

//! gpu-dispatch-core: device-memory caching and kernel dispatch for a GPU
//! tensor backend.
//!
//! Two pieces sit between tensor operations and the device:
//!   - [`DeviceAllocator`] recycles device blocks by exact size instead of
//!     returning them to the driver, handing them out as RAII [`Buffer`]s.
//!   - [`KernelCache`] resolves and builds each (op, dtype) kernel the first
//!     time it is needed and shares the compiled program afterwards.
//!
//! [`GpuContext`] bundles both with a device. The [`gpu::host`] module
//! provides a device that runs kernels in host memory.

pub mod config;
pub mod context;
pub mod dtype;
pub mod gpu;
pub mod kernel;

pub use context::GpuContext;
pub use dtype::DType;
pub use gpu::allocator::{AllocatorError, AllocatorStats, DeviceAllocator};
pub use gpu::buffer::Buffer;
pub use gpu::device::{ContextBlob, Device, DeviceError};
pub use kernel::cache::{KernelCache, KernelProgram};
pub use kernel::invocation::KernelInvocation;
pub use kernel::{KernelError, Op};

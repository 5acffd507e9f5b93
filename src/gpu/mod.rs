//! Device abstraction and device-memory management.
//!
//! - [`device`]: the device and submission interfaces, raw blocks, context blobs
//! - [`library`]: program libraries, device functions and pipelines
//! - [`allocator`]: caching allocator with an exact-size recycle pool
//! - [`buffer`]: RAII handle returning its block to the allocator on drop
//! - [`host`]: host-memory device and closure-backed program library

pub mod allocator;
pub mod buffer;
pub mod device;
pub mod host;
pub mod library;

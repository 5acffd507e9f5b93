//! Explicitly owned device context.
//!
//! Bundles one device with its allocator and kernel cache. Whoever creates
//! the context owns it; several independent contexts can coexist. Fields drop
//! in declaration order, so cached kernels go before the allocator evicts its
//! pool.

use std::sync::Arc;

use crate::config::Config;
use crate::dtype::DType;
use crate::gpu::allocator::{AllocatorError, DeviceAllocator};
use crate::gpu::buffer::Buffer;
use crate::gpu::device::{ContextBlob, Device};
use crate::gpu::host::{HostDevice, HostLibrary};
use crate::gpu::library::ProgramLibrary;
use crate::kernel::cache::KernelCache;
use crate::kernel::invocation::KernelInvocation;
use crate::kernel::registry::KernelRegistry;
use crate::kernel::{KernelError, Op};

#[derive(Debug)]
pub struct GpuContext {
    kernels: KernelCache,
    allocator: DeviceAllocator,
    device: Arc<dyn Device>,
}

impl GpuContext {
    pub fn new(
        device: Arc<dyn Device>,
        library: Arc<dyn ProgramLibrary>,
        registry: KernelRegistry,
    ) -> Self {
        Self {
            kernels: KernelCache::new(library, registry),
            allocator: DeviceAllocator::new(Arc::clone(&device)),
            device,
        }
    }

    /// Host-simulated context built from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(HostDevice::new(&config.device)),
            Arc::new(HostLibrary::with_builtin_kernels(
                config.device.max_threads_per_group,
            )),
            KernelRegistry::from_config(&config.kernels),
        )
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    pub fn kernels(&self) -> &KernelCache {
        &self.kernels
    }

    pub fn alloc(&self, nbytes: usize) -> Result<Buffer, AllocatorError> {
        self.allocator.alloc(nbytes)
    }

    /// Look up (compiling if needed) the kernel for `(op, dtype)` and run it.
    pub fn dispatch(
        &self,
        op: Op,
        dtype: DType,
        inputs: &[&Buffer],
        outputs: &[&Buffer],
        context: Option<ContextBlob>,
    ) -> Result<(), KernelError> {
        let program = self.kernels.get_or_compile(op, dtype)?;
        let mut invocation = KernelInvocation::new(&program)
            .inputs(inputs)
            .outputs(outputs);
        if let Some(blob) = context {
            invocation = invocation.context(blob);
        }
        invocation.submit(self.device.as_ref())
    }
}

//! Host-memory simulation of a GPU device and its program library.
//!
//! Blocks are plain byte vectors behind a mutex and submissions run the bound
//! kernel on the calling thread, so `commit_and_wait` is trivially
//! synchronous. The simulation keeps counters (allocate/release calls,
//! resident bytes, pipelines built) and supports injected allocation
//! failures, which is what the tests and the demo binary lean on.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytemuck::Pod;
use half::f16;
use tracing::{debug, trace, warn};

use crate::config::DeviceConfig;
use crate::dtype::DType;
use crate::gpu::device::{
    new_block_id, BlockId, ContextBlob, Device, DeviceBlock, DeviceError, Submission,
};
use crate::gpu::library::{
    DeviceFunction, FunctionHandle, Pipeline, PipelineHandle, ProgramLibrary,
};

/// Arguments handed to a host kernel: every bound buffer in binding order.
pub struct HostArgs<'a> {
    pub buffers: &'a mut [Vec<u8>],
    pub context: Option<&'a [u8]>,
    /// Number of threads dispatched (elements to process for 1D kernels).
    pub grid: usize,
}

pub type HostKernelFn = Arc<dyn Fn(&mut HostArgs<'_>) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Default)]
struct HostMemory {
    blocks: HashMap<BlockId, Vec<u8>>,
    resident: usize,
}

/// Launch shape and context binding of a committed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDispatch {
    pub grid: usize,
    pub group: usize,
    /// Binding index of the context blob, if one was bound.
    pub context_index: Option<usize>,
}

/// Simulated device with a fixed memory capacity.
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    capacity: usize,
    memory: Mutex<HostMemory>,
    allocate_calls: AtomicUsize,
    release_calls: AtomicUsize,
    submissions: AtomicUsize,
    last_dispatch: Mutex<Option<HostDispatch>>,
    injected_failures: AtomicUsize,
}

impl HostDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            name: config.name.clone(),
            capacity: config.memory_capacity,
            memory: Mutex::new(HostMemory::default()),
            allocate_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            last_dispatch: Mutex::new(None),
            injected_failures: AtomicUsize::new(0),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&DeviceConfig {
            memory_capacity: capacity,
            ..DeviceConfig::default()
        })
    }

    /// Make the next `count` allocations fail regardless of free capacity.
    pub fn fail_next_allocations(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Shape of the most recent successful submission.
    pub fn last_dispatch(&self) -> Option<HostDispatch> {
        *self.last_dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes currently held by allocated blocks (pooled or in use).
    pub fn resident_bytes(&self) -> usize {
        self.lock_memory().resident
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock_memory(&self) -> MutexGuard<'_, HostMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, nbytes: usize) -> Result<DeviceBlock, DeviceError> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);

        let mut memory = self.lock_memory();
        let available = self.capacity.saturating_sub(memory.resident);
        if self.take_injected_failure() || nbytes > available {
            debug!(nbytes, available, "Host device refused allocation");
            return Err(DeviceError::OutOfMemory {
                requested: nbytes,
                available,
            });
        }

        let id = new_block_id();
        memory.blocks.insert(id, vec![0u8; nbytes]);
        memory.resident += nbytes;
        trace!(block = id, nbytes, "Host device allocated block");
        Ok(DeviceBlock::new(id, nbytes))
    }

    fn release(&self, block: DeviceBlock) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);

        let mut memory = self.lock_memory();
        let removed = memory.blocks.remove(&block.id());
        match removed {
            Some(bytes) => memory.resident -= bytes.len(),
            None => warn!(block = block.id(), "Released block not resident on host device"),
        }
    }

    fn new_submission(&self) -> Result<Box<dyn Submission + '_>, DeviceError> {
        Ok(Box::new(HostSubmission {
            device: self,
            pipeline: None,
            bindings: Vec::new(),
            context: None,
            grid: 0,
            group: 0,
        }))
    }

    fn write(&self, block: &DeviceBlock, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        let mut memory = self.lock_memory();
        let bytes = memory
            .blocks
            .get_mut(&block.id())
            .ok_or(DeviceError::UnknownBlock(block.id()))?;
        let end = checked_end(offset, data.len(), bytes.len())?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, block: &DeviceBlock, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let memory = self.lock_memory();
        let bytes = memory
            .blocks
            .get(&block.id())
            .ok_or(DeviceError::UnknownBlock(block.id()))?;
        let end = checked_end(offset, out.len(), bytes.len())?;
        out.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }
}

fn checked_end(offset: usize, len: usize, size: usize) -> Result<usize, DeviceError> {
    offset
        .checked_add(len)
        .filter(|&end| end <= size)
        .ok_or(DeviceError::OutOfBounds { offset, len, size })
}

/// Command buffer on the host device. Dropping it drops the bound context
/// blob, which is when the blob's deleter runs.
struct HostSubmission<'a> {
    device: &'a HostDevice,
    pipeline: Option<Arc<dyn Pipeline>>,
    bindings: Vec<Option<BlockId>>,
    context: Option<(usize, ContextBlob)>,
    grid: usize,
    group: usize,
}

impl HostSubmission<'_> {
    /// Reject launch shapes and context bindings a real queue would refuse.
    fn validate(&self) -> Result<(), DeviceError> {
        if self.group == 0 || self.group > self.grid.max(1) {
            return Err(DeviceError::Execution(format!(
                "threadgroup size {} outside [1, {}]",
                self.group,
                self.grid.max(1)
            )));
        }
        if let Some((index, _)) = &self.context {
            if *index != self.bindings.len() {
                return Err(DeviceError::Execution(format!(
                    "context bound at index {index}, expected {} after the buffers",
                    self.bindings.len()
                )));
            }
        }
        Ok(())
    }
}

impl Submission for HostSubmission<'_> {
    fn set_pipeline(&mut self, pipeline: Arc<dyn Pipeline>) {
        self.pipeline = Some(pipeline);
    }

    fn set_buffer(&mut self, index: usize, block: Option<&DeviceBlock>) {
        if self.bindings.len() <= index {
            self.bindings.resize(index + 1, None);
        }
        self.bindings[index] = block.map(DeviceBlock::id);
    }

    fn set_context(&mut self, index: usize, blob: ContextBlob) {
        self.context = Some((index, blob));
    }

    fn dispatch(&mut self, grid: usize, group: usize) {
        self.grid = grid;
        self.group = group;
    }

    fn commit_and_wait(&mut self) -> Result<(), DeviceError> {
        let pipeline = self.pipeline.as_ref().ok_or(DeviceError::NoPipeline)?;
        let host = pipeline
            .as_any()
            .downcast_ref::<HostPipeline>()
            .ok_or_else(|| {
                DeviceError::Execution(format!(
                    "pipeline {} was not built by a host library",
                    pipeline.function_name()
                ))
            })?;
        self.validate()?;

        self.device.submissions.fetch_add(1, Ordering::SeqCst);
        let mut memory = self.device.lock_memory();

        let mut buffers = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let bytes = match binding {
                Some(id) => memory
                    .blocks
                    .get(id)
                    .cloned()
                    .ok_or(DeviceError::UnknownBlock(*id))?,
                None => Vec::new(),
            };
            buffers.push(bytes);
        }

        let mut args = HostArgs {
            buffers: &mut buffers,
            context: self.context.as_ref().map(|(_, blob)| blob.as_bytes()),
            grid: self.grid,
        };
        (host.kernel)(&mut args).map_err(DeviceError::Execution)?;

        // All-or-nothing: check every length before touching device memory.
        for (binding, bytes) in self.bindings.iter().zip(&buffers) {
            let Some(id) = binding else { continue };
            if memory.blocks.get(id).is_some_and(|slot| slot.len() != bytes.len()) {
                return Err(DeviceError::Execution(format!(
                    "kernel {} resized block {id}",
                    host.function_name
                )));
            }
        }
        for (binding, bytes) in self.bindings.iter().zip(buffers) {
            let Some(id) = binding else { continue };
            if let Some(slot) = memory.blocks.get_mut(id) {
                *slot = bytes;
            }
        }
        drop(memory);

        *self
            .device
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(HostDispatch {
            grid: self.grid,
            group: self.group,
            context_index: self.context.as_ref().map(|(index, _)| *index),
        });

        trace!(kernel = %host.function_name, grid = self.grid, "Host submission completed");
        Ok(())
    }
}

struct HostFunction {
    name: String,
    kernel: HostKernelFn,
}

impl DeviceFunction for HostFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

struct HostPipeline {
    function_name: String,
    kernel: HostKernelFn,
    max_threads_per_group: usize,
}

impl Pipeline for HostPipeline {
    fn function_name(&self) -> &str {
        &self.function_name
    }

    fn max_threads_per_group(&self) -> usize {
        self.max_threads_per_group
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for HostPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPipeline")
            .field("function_name", &self.function_name)
            .field("max_threads_per_group", &self.max_threads_per_group)
            .finish()
    }
}

/// Program library whose "compiled" functions are Rust closures.
pub struct HostLibrary {
    functions: RwLock<HashMap<String, HostKernelFn>>,
    max_threads_per_group: usize,
    pipelines_built: AtomicUsize,
}

impl HostLibrary {
    /// Empty library.
    pub fn new(max_threads_per_group: usize) -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            max_threads_per_group,
            pipelines_built: AtomicUsize::new(0),
        }
    }

    /// Library with `add`, `mul`, `relu` and `fill` for float, half and int.
    pub fn with_builtin_kernels(max_threads_per_group: usize) -> Self {
        let library = Self::new(max_threads_per_group);
        library.register_elementwise::<f32>(DType::Float32);
        library.register_elementwise::<f16>(DType::Float16);
        library.register_elementwise::<i32>(DType::Int32);
        library
    }

    /// Export `kernel` under `name`, replacing any previous export.
    pub fn register(
        &self,
        name: impl Into<String>,
        kernel: impl Fn(&mut HostArgs<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(kernel));
    }

    /// Pipelines built so far (one per compilation attempt).
    pub fn pipelines_built(&self) -> usize {
        self.pipelines_built.load(Ordering::SeqCst)
    }

    fn register_elementwise<T: HostScalar>(&self, dtype: DType) {
        let token = dtype.token();
        self.register(format!("add_{token}"), |args| binary::<T>(args, T::plus));
        self.register(format!("mul_{token}"), |args| binary::<T>(args, T::times));
        self.register(format!("relu_{token}"), unary_relu::<T>);
        self.register(format!("fill_{token}"), fill::<T>);
    }
}

impl fmt::Debug for HostLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let functions = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("HostLibrary")
            .field("functions", &functions)
            .field("max_threads_per_group", &self.max_threads_per_group)
            .finish()
    }
}

impl ProgramLibrary for HostLibrary {
    fn resolve_function(&self, name: &str) -> Option<FunctionHandle> {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        let kernel = functions.get(name)?;
        Some(Arc::new(HostFunction {
            name: name.to_string(),
            kernel: Arc::clone(kernel),
        }))
    }

    fn build_pipeline(&self, function: &FunctionHandle) -> Result<PipelineHandle, String> {
        let host = function
            .as_any()
            .downcast_ref::<HostFunction>()
            .ok_or_else(|| format!("function {} does not belong to this library", function.name()))?;

        self.pipelines_built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(HostPipeline {
            function_name: host.name.clone(),
            kernel: Arc::clone(&host.kernel),
            max_threads_per_group: self.max_threads_per_group,
        }))
    }
}

/// Element types the built-in host kernels are instantiated for.
pub trait HostScalar: Pod + PartialOrd + Send + Sync {
    const ZERO: Self;

    fn plus(self, rhs: Self) -> Self;

    fn times(self, rhs: Self) -> Self;

    fn relu(self) -> Self {
        if self > Self::ZERO {
            self
        } else {
            Self::ZERO
        }
    }
}

impl HostScalar for f32 {
    const ZERO: Self = 0.0;

    fn plus(self, rhs: Self) -> Self {
        self + rhs
    }

    fn times(self, rhs: Self) -> Self {
        self * rhs
    }
}

impl HostScalar for f16 {
    const ZERO: Self = f16::ZERO;

    fn plus(self, rhs: Self) -> Self {
        self + rhs
    }

    fn times(self, rhs: Self) -> Self {
        self * rhs
    }
}

impl HostScalar for i32 {
    const ZERO: Self = 0;

    fn plus(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    fn times(self, rhs: Self) -> Self {
        self.wrapping_mul(rhs)
    }
}

fn load<T: Pod>(bytes: &[u8], count: usize) -> Result<Vec<T>, String> {
    let size = std::mem::size_of::<T>();
    let needed = count * size;
    if bytes.len() < needed {
        return Err(format!("buffer holds {} bytes, kernel needs {needed}", bytes.len()));
    }
    Ok(bytes[..needed]
        .chunks_exact(size)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

fn store<T: Pod>(out: &mut [u8], values: &[T]) -> Result<(), String> {
    let src: &[u8] = bytemuck::cast_slice(values);
    if out.len() < src.len() {
        return Err(format!("output holds {} bytes, kernel writes {}", out.len(), src.len()));
    }
    out[..src.len()].copy_from_slice(src);
    Ok(())
}

fn binary<T: HostScalar>(args: &mut HostArgs<'_>, op: fn(T, T) -> T) -> Result<(), String> {
    let grid = args.grid;
    let bound = args.buffers.len();
    let [lhs, rhs, out] = &mut *args.buffers else {
        return Err(format!("expected 3 buffers, got {bound}"));
    };
    let lhs = load::<T>(lhs, grid)?;
    let rhs = load::<T>(rhs, grid)?;
    let result: Vec<T> = lhs.into_iter().zip(rhs).map(|(a, b)| op(a, b)).collect();
    store(out, &result)
}

fn unary_relu<T: HostScalar>(args: &mut HostArgs<'_>) -> Result<(), String> {
    let grid = args.grid;
    let bound = args.buffers.len();
    let [input, out] = &mut *args.buffers else {
        return Err(format!("expected 2 buffers, got {bound}"));
    };
    let result: Vec<T> = load::<T>(input, grid)?.into_iter().map(T::relu).collect();
    store(out, &result)
}

/// Fill the output with the scalar carried in the context blob.
fn fill<T: HostScalar>(args: &mut HostArgs<'_>) -> Result<(), String> {
    let grid = args.grid;
    let value = match args.context {
        Some(bytes) => load::<T>(bytes, 1)?[0],
        None => return Err("fill needs a context blob holding the value".to_string()),
    };
    let bound = args.buffers.len();
    let [out] = &mut *args.buffers else {
        return Err(format!("expected 1 buffer, got {bound}"));
    };
    store(out, &vec![value; grid])
}

//! Compile-once kernel cache.
//!
//! Lookups take a shared lock just long enough to clone an `Arc`. On a miss
//! the pipeline is built with no lock held, then inserted with the map's
//! insert-if-absent entry API: if another thread got there first its program
//! wins and the freshly built one is dropped. Compilation may therefore run
//! more than once for a key under contention, but only one program is ever
//! stored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, trace};

use crate::dtype::DType;
use crate::gpu::library::{FunctionHandle, PipelineHandle, ProgramLibrary};
use crate::kernel::registry::{KernelEntry, KernelRegistry};
use crate::kernel::{KernelError, KernelKey, Op};

/// A kernel resolved from the library with its pipeline built.
#[derive(Debug)]
pub struct KernelProgram {
    key: KernelKey,
    entry: KernelEntry,
    function: FunctionHandle,
    pipeline: PipelineHandle,
}

impl KernelProgram {
    pub fn key(&self) -> KernelKey {
        self.key
    }

    /// Device function name.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn entry(&self) -> &KernelEntry {
        &self.entry
    }

    pub fn function(&self) -> &FunctionHandle {
        &self.function
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }
}

pub struct KernelCache {
    library: Arc<dyn ProgramLibrary>,
    registry: KernelRegistry,
    programs: RwLock<HashMap<KernelKey, Arc<KernelProgram>>>,
    compilations: AtomicUsize,
}

impl KernelCache {
    pub fn new(library: Arc<dyn ProgramLibrary>, registry: KernelRegistry) -> Self {
        Self {
            library,
            registry,
            programs: RwLock::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Fetch the program for `(op, dtype)`, compiling it on first use.
    pub fn get_or_compile(&self, op: Op, dtype: DType) -> Result<Arc<KernelProgram>, KernelError> {
        let key = KernelKey::new(op, dtype);

        if let Some(program) = self.read_programs().get(&key) {
            return Ok(Arc::clone(program));
        }

        let compiled = Arc::new(self.compile(key)?);

        let mut programs = self.write_programs();
        let program = programs.entry(key).or_insert_with(|| Arc::clone(&compiled));
        if Arc::ptr_eq(program, &compiled) {
            debug!(kernel = %key, name = compiled.name(), "Cached kernel");
        } else {
            trace!(kernel = %key, "Another thread cached this kernel first, discarding ours");
        }
        Ok(Arc::clone(program))
    }

    fn compile(&self, key: KernelKey) -> Result<KernelProgram, KernelError> {
        let entry = self
            .registry
            .lookup(key.op, key.dtype)
            .cloned()
            .ok_or_else(|| {
                error!(kernel = %key, "No kernel registered");
                KernelError::Unsupported {
                    op: key.op,
                    dtype: key.dtype,
                    detail: "no kernel registered for this type".to_string(),
                }
            })?;

        debug!(kernel = %key, name = %entry.name, "Lazy loading kernel");

        let function = self.library.resolve_function(&entry.name).ok_or_else(|| {
            error!(kernel = %key, name = %entry.name, "Failed to find device function");
            KernelError::Unsupported {
                op: key.op,
                dtype: key.dtype,
                detail: format!("function {} not found in program library", entry.name),
            }
        })?;

        self.compilations.fetch_add(1, Ordering::Relaxed);
        let pipeline = self.library.build_pipeline(&function).map_err(|message| {
            error!(name = %entry.name, error = %message, "Failed to create pipeline state");
            KernelError::PipelineBuild {
                name: entry.name.clone(),
                message,
            }
        })?;

        Ok(KernelProgram {
            key,
            entry,
            function,
            pipeline,
        })
    }

    pub fn contains(&self, op: Op, dtype: DType) -> bool {
        self.read_programs().contains_key(&KernelKey::new(op, dtype))
    }

    /// Number of cached programs.
    pub fn len(&self) -> usize {
        self.read_programs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_programs().is_empty()
    }

    /// Pipeline builds attempted, including ones that lost an insert race.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    fn read_programs(&self) -> RwLockReadGuard<'_, HashMap<KernelKey, Arc<KernelProgram>>> {
        self.programs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_programs(&self) -> RwLockWriteGuard<'_, HashMap<KernelKey, Arc<KernelProgram>>> {
        self.programs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for KernelCache {
    fn drop(&mut self) {
        let programs = self.programs.get_mut().unwrap_or_else(PoisonError::into_inner);
        trace!(kernels = programs.len(), "Releasing kernel cache");
        programs.clear();
    }
}

impl std::fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCache")
            .field("cached", &self.len())
            .field("registered", &self.registry.len())
            .field("compilations", &self.compilations())
            .finish()
    }
}

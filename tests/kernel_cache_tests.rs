//! Integration tests for the compile-once kernel cache.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use gpu_dispatch_core::gpu::host::HostLibrary;
use gpu_dispatch_core::gpu::library::{
    DeviceFunction, FunctionHandle, PipelineHandle, ProgramLibrary,
};
use gpu_dispatch_core::kernel::registry::KernelRegistry;
use gpu_dispatch_core::{DType, KernelCache, KernelError, Op};

fn host_cache() -> (Arc<HostLibrary>, KernelCache) {
    let library = Arc::new(HostLibrary::with_builtin_kernels(256));
    let cache = KernelCache::new(library.clone(), KernelRegistry::with_defaults());
    (library, cache)
}

#[derive(Debug)]
struct NamedFunction(String);

impl DeviceFunction for NamedFunction {
    fn name(&self) -> &str {
        &self.0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resolves every name but refuses to build a pipeline.
#[derive(Debug, Default)]
struct BrokenLibrary {
    attempts: AtomicUsize,
}

impl ProgramLibrary for BrokenLibrary {
    fn resolve_function(&self, name: &str) -> Option<FunctionHandle> {
        Some(Arc::new(NamedFunction(name.to_string())))
    }

    fn build_pipeline(&self, function: &FunctionHandle) -> Result<PipelineHandle, String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(format!("{} uses an unsupported feature", function.name()))
    }
}

#[test]
fn test_concurrent_callers_share_one_program() {
    const CALLERS: usize = 16;
    let (_library, cache) = host_cache();
    let barrier = Barrier::new(CALLERS);

    let programs: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    cache.get_or_compile(Op::Mul, DType::Float16).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let first = &programs[0];
    assert!(programs.iter().all(|p| Arc::ptr_eq(p, first)));
    assert_eq!(cache.len(), 1);
    assert!(cache.compilations() >= 1);
    assert!(cache.compilations() <= CALLERS);
}

#[test]
fn test_two_threads_on_cold_cache() {
    let (_library, cache) = host_cache();
    let barrier = Barrier::new(2);

    let (a, b) = std::thread::scope(|scope| {
        let get = || {
            barrier.wait();
            cache.get_or_compile(Op::Add, DType::Float32).unwrap()
        };
        let first = scope.spawn(get);
        let second = scope.spawn(get);
        (first.join().unwrap(), second.join().unwrap())
    });

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.name(), "add_float");
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(Op::Add, DType::Float32));
}

#[test]
fn test_missing_function_fails_closed() {
    let library = Arc::new(HostLibrary::new(64));
    library.register("add_float", |_| Ok(()));
    let cache = KernelCache::new(library.clone(), KernelRegistry::with_defaults());

    let err = cache.get_or_compile(Op::Relu, DType::Float32).unwrap_err();
    assert!(matches!(err, KernelError::Unsupported { op: Op::Relu, .. }));
    assert!(err.to_string().contains("relu_float"));
    assert!(cache.is_empty());
    assert_eq!(library.pipelines_built(), 0);

    // A registered, present function still compiles.
    cache.get_or_compile(Op::Add, DType::Float32).unwrap();
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_unregistered_dtype_fails_closed() {
    let (_library, cache) = host_cache();

    for dtype in [DType::Bool, DType::UInt8, DType::Float64, DType::Int64] {
        let err = cache.get_or_compile(Op::Add, dtype).unwrap_err();
        assert!(matches!(err, KernelError::Unsupported { .. }));
    }
    assert!(cache.is_empty());
    assert_eq!(cache.compilations(), 0);
}

#[test]
fn test_pipeline_failure_is_not_cached() {
    let library = Arc::new(BrokenLibrary::default());
    let cache = KernelCache::new(library.clone(), KernelRegistry::with_defaults());

    for _ in 0..2 {
        let err = cache.get_or_compile(Op::Fill, DType::Int32).unwrap_err();
        match err {
            KernelError::PipelineBuild { name, message } => {
                assert_eq!(name, "fill_int");
                assert!(message.contains("unsupported feature"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // Each call retried the build instead of remembering the failure.
    assert_eq!(library.attempts.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
}

#[test]
fn test_registry_entry_name_is_used() {
    let library = Arc::new(HostLibrary::new(64));
    library.register("vector_add_v2", |_| Ok(()));

    let mut registry = KernelRegistry::new();
    registry.register_entry(
        Op::Add,
        DType::Float32,
        gpu_dispatch_core::kernel::registry::KernelEntry {
            name: "vector_add_v2".to_string(),
            inputs: 2,
            outputs: 1,
        },
    );
    let cache = KernelCache::new(library, registry);

    let program = cache.get_or_compile(Op::Add, DType::Float32).unwrap();
    assert_eq!(program.name(), "vector_add_v2");
    assert_eq!(program.pipeline().function_name(), "vector_add_v2");
    assert_eq!(program.function().name(), "vector_add_v2");
}

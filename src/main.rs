//! gpu-dispatch-core: drive the caching allocator and kernel cache.
//!
//! Spawns worker threads that share one host-simulated device context. Each
//! worker allocates buffers, runs the configured kernel, checks the result
//! against the host scalar ops, and drops the buffers back into the pool.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail};
use clap::Parser;
use half::f16;
use tracing::{debug, info, warn};

use gpu_dispatch_core::config::{Cli, Config, WorkloadConfig};
use gpu_dispatch_core::gpu::host::{HostDevice, HostLibrary, HostScalar};
use gpu_dispatch_core::kernel::registry::KernelRegistry;
use gpu_dispatch_core::{Buffer, ContextBlob, DType, GpuContext, Op};

/// Deterministic input values for the workload.
trait Sample: HostScalar {
    fn sample(index: usize) -> Self;
}

impl Sample for f32 {
    fn sample(index: usize) -> Self {
        (index % 17) as f32 - 8.0
    }
}

impl Sample for f16 {
    fn sample(index: usize) -> Self {
        f16::from_f32((index % 17) as f32 - 8.0)
    }
}

impl Sample for i32 {
    fn sample(index: usize) -> Self {
        (index % 17) as i32 - 8
    }
}

fn inputs_for<T: Sample>(count: usize, elems: usize, seed: usize) -> Vec<Vec<T>> {
    (0..count)
        .map(|arg| (0..elems).map(|i| T::sample(i + seed + arg * 5)).collect())
        .collect()
}

fn expected<T: Sample>(op: Op, inputs: &[Vec<T>], elems: usize, fill: T) -> Vec<T> {
    match op {
        Op::Add => inputs[0].iter().zip(&inputs[1]).map(|(&a, &b)| a.plus(b)).collect(),
        Op::Mul => inputs[0].iter().zip(&inputs[1]).map(|(&a, &b)| a.times(b)).collect(),
        Op::Relu => inputs[0].iter().map(|&a| a.relu()).collect(),
        Op::Fill => vec![fill; elems],
    }
}

/// Run one worker's iterations. Returns the number of mismatching results.
fn run_worker<T: Sample>(
    ctx: &GpuContext,
    workload: &WorkloadConfig,
    worker: usize,
) -> anyhow::Result<usize> {
    let (op, dtype) = (workload.op, workload.dtype);
    let (input_count, _) = op.arity();
    let elem_size = std::mem::size_of::<T>();
    let mut mismatches = 0;

    for iteration in 0..workload.iterations {
        let elems = workload.sizes[(worker + iteration) % workload.sizes.len()];
        let seed = worker * 31 + iteration;
        let values = inputs_for::<T>(input_count, elems, seed);
        let fill = T::sample(seed);

        let inputs = values
            .iter()
            .map(|data| {
                let buffer = ctx.alloc(elems * elem_size)?;
                buffer.write(data)?;
                Ok(buffer)
            })
            .collect::<anyhow::Result<Vec<Buffer>>>()?;
        let output = ctx.alloc(elems * elem_size)?;

        let input_refs: Vec<&Buffer> = inputs.iter().collect();
        let context = (op == Op::Fill).then(|| ContextBlob::from_pod(&[fill]));
        ctx.dispatch(op, dtype, &input_refs, &[&output], context)?;

        if output.read::<T>()? != expected(op, &values, elems, fill) {
            warn!(worker, iteration, elems, "Kernel result mismatch");
            mismatches += 1;
        }
    }

    debug!(worker, "Worker finished");
    Ok(mismatches)
}

fn run_workload(ctx: &GpuContext, workload: &WorkloadConfig) -> anyhow::Result<usize> {
    let run: fn(&GpuContext, &WorkloadConfig, usize) -> anyhow::Result<usize> = match workload.dtype {
        DType::Float32 => run_worker::<f32>,
        DType::Float16 => run_worker::<f16>,
        DType::Int32 => run_worker::<i32>,
        other => bail!("no host kernels for {other}"),
    };
    if workload.sizes.is_empty() {
        bail!("workload.sizes must not be empty");
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workload.threads)
            .map(|worker| scope.spawn(move || run(ctx, workload, worker)))
            .collect();

        handles.into_iter().try_fold(0, |total, handle| -> anyhow::Result<usize> {
            let mismatches = handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))??;
            Ok(total + mismatches)
        })
    })
}

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "gpu_dispatch_core=debug"
    } else {
        "gpu_dispatch_core=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("gpu-dispatch-core v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        device = %config.device.name,
        memory_capacity = config.device.memory_capacity,
        op = %config.workload.op,
        dtype = %config.workload.dtype,
        threads = config.workload.threads,
        iterations = config.workload.iterations,
        "Configuration loaded"
    );

    // Build the device context.
    let device = Arc::new(HostDevice::new(&config.device));
    let library = Arc::new(HostLibrary::with_builtin_kernels(
        config.device.max_threads_per_group,
    ));
    let ctx = GpuContext::new(
        device.clone(),
        library.clone(),
        KernelRegistry::from_config(&config.kernels),
    );

    let start = Instant::now();
    let mismatches = run_workload(&ctx, &config.workload)?;
    let elapsed = start.elapsed();

    let stats = ctx.allocator().stats();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        mismatches,
        stats = %serde_json::to_string(&stats)?,
        "Workload complete"
    );
    info!(
        cached_kernels = ctx.kernels().len(),
        compilations = ctx.kernels().compilations(),
        pipelines_built = library.pipelines_built(),
        "Kernel cache"
    );
    info!(
        allocate_calls = device.allocate_calls(),
        release_calls = device.release_calls(),
        submissions = device.submissions(),
        resident_bytes = device.resident_bytes(),
        "Device"
    );

    let evicted = ctx.allocator().evict_pool();
    debug!(evicted, "Recycle pool drained");

    if mismatches > 0 {
        bail!("{mismatches} kernel results did not match the host reference");
    }
    Ok(())
}

//! Runtime configuration for gpu-dispatch-core.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Missing sections and fields fall back to their defaults.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::kernel::registry::KernelRegistration;
use crate::kernel::Op;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gpu-dispatch-core",
    about = "Drive the caching allocator and kernel cache with a concurrent workload"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the number of worker threads.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Override the iterations per worker.
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Simulated device settings.
    pub device: DeviceConfig,

    /// Kernel registrations beyond the defaults.
    pub kernels: KernelConfig,

    /// Demo workload shape.
    pub workload: WorkloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name reported in logs.
    pub name: String,

    /// Memory capacity in bytes.
    pub memory_capacity: usize,

    /// Threads per threadgroup reported by built pipelines.
    pub max_threads_per_group: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "host-sim".to_string(),
            memory_capacity: 256 * 1024 * 1024, // 256 MB
            max_threads_per_group: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Extra (op, dtype) pairs the program library exports.
    pub extra: Vec<KernelRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Concurrent worker threads.
    pub threads: usize,

    /// Kernel runs per worker.
    pub iterations: usize,

    /// Element counts cycled through by the workers.
    pub sizes: Vec<usize>,

    pub op: Op,

    pub dtype: DType,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 64,
            sizes: vec![1024, 4096, 16384],
            op: Op::Add,
            dtype: DType::Float32,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(threads) = cli.threads {
            self.workload.threads = threads;
        }
        if let Some(iterations) = cli.iterations {
            self.workload.iterations = iterations;
        }
    }
}

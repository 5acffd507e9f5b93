//! Table of kernels the program library is expected to export.
//!
//! Adding an (op, dtype) pair is a table entry, populated once at startup
//! from the defaults plus whatever the configuration adds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::KernelConfig;
use crate::dtype::DType;
use crate::kernel::{KernelKey, Op};

/// How to find and call one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEntry {
    /// Exported device function name.
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
}

/// A registration read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRegistration {
    pub op: Op,
    pub dtype: DType,

    /// Overrides the `<op>_<token>` name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Types the default table registers every op for.
const DEFAULT_DTYPES: [DType; 3] = [DType::Float32, DType::Float16, DType::Int32];
const DEFAULT_OPS: [Op; 4] = [Op::Add, Op::Mul, Op::Relu, Op::Fill];

#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    entries: HashMap<KernelKey, KernelEntry>,
}

impl KernelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every op for float, half and int.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for dtype in DEFAULT_DTYPES {
            for op in DEFAULT_OPS {
                registry.register(op, dtype);
            }
        }
        registry
    }

    /// Defaults plus the configured extra registrations.
    pub fn from_config(config: &KernelConfig) -> Self {
        let mut registry = Self::with_defaults();
        for extra in &config.extra {
            let key = KernelKey::new(extra.op, extra.dtype);
            let (inputs, outputs) = extra.op.arity();
            let entry = KernelEntry {
                name: extra.name.clone().unwrap_or_else(|| key.function_name()),
                inputs,
                outputs,
            };
            debug!(kernel = %key, name = %entry.name, "Registered configured kernel");
            registry.register_entry(extra.op, extra.dtype, entry);
        }
        registry
    }

    /// Register `op` for `dtype` under the conventional name.
    pub fn register(&mut self, op: Op, dtype: DType) -> Option<KernelEntry> {
        let (inputs, outputs) = op.arity();
        let entry = KernelEntry {
            name: KernelKey::new(op, dtype).function_name(),
            inputs,
            outputs,
        };
        self.register_entry(op, dtype, entry)
    }

    /// Register an explicit entry. Returns the entry it replaced, if any.
    pub fn register_entry(&mut self, op: Op, dtype: DType, entry: KernelEntry) -> Option<KernelEntry> {
        self.entries.insert(KernelKey::new(op, dtype), entry)
    }

    pub fn lookup(&self, op: Op, dtype: DType) -> Option<&KernelEntry> {
        self.entries.get(&KernelKey::new(op, dtype))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

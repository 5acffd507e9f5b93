//! Kernel lookup, compilation and dispatch.
//!
//! - [`registry`]: which (op, dtype) pairs have a device function, and its name
//! - [`cache`]: compile-once cache of pipelines per (op, dtype)
//! - [`invocation`]: binding buffers and submitting one kernel run

pub mod cache;
pub mod invocation;
pub mod registry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dtype::DType;
use crate::gpu::device::DeviceError;

/// Operation tag, the other half of a kernel key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Add,
    Mul,
    Relu,
    Fill,
}

impl Op {
    /// Lowercase name used as the device function prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Mul => "mul",
            Op::Relu => "relu",
            Op::Fill => "fill",
        }
    }

    /// Number of (input, output) buffers the kernel binds.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Op::Add | Op::Mul => (2, 1),
            Op::Relu => (1, 1),
            Op::Fill => (0, 1),
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Cache key for one compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub op: Op,
    pub dtype: DType,
}

impl KernelKey {
    pub fn new(op: Op, dtype: DType) -> Self {
        Self { op, dtype }
    }

    /// Device function name: `<op>_<dtype token>`, e.g. `add_float`.
    pub fn function_name(&self) -> String {
        format!("{}_{}", self.op.name(), self.dtype.token())
    }
}

impl std::fmt::Display for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<{}>", self.op, self.dtype)
    }
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Unsupported kernel {op} for type {dtype}: {detail}")]
    Unsupported { op: Op, dtype: DType, detail: String },

    #[error("Failed to create pipeline state for function {name}: {message}")]
    PipelineBuild { name: String, message: String },

    #[error(
        "Kernel {name} takes {expected_inputs} inputs and {expected_outputs} outputs, \
         got {inputs} and {outputs}"
    )]
    ArgumentMismatch {
        name: String,
        expected_inputs: usize,
        expected_outputs: usize,
        inputs: usize,
        outputs: usize,
    },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_convention() {
        assert_eq!(KernelKey::new(Op::Add, DType::Float32).function_name(), "add_float");
        assert_eq!(KernelKey::new(Op::Relu, DType::Float16).function_name(), "relu_half");
        assert_eq!(KernelKey::new(Op::Mul, DType::Int32).function_name(), "mul_int");
    }

    #[test]
    fn test_unsupported_error_names_op_and_type() {
        let err = KernelError::Unsupported {
            op: Op::Add,
            dtype: DType::Float64,
            detail: "no kernel registered".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("add"));
        assert!(msg.contains("Float64"));
    }
}

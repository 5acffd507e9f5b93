//! Compiled-program library capability.
//!
//! The library is built ahead of time from kernel sources; this crate only
//! resolves functions in it by name and turns them into pipelines.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A device-side function resolved from the library.
pub trait DeviceFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// A compute pipeline built from one [`DeviceFunction`].
pub trait Pipeline: Send + Sync + fmt::Debug {
    fn function_name(&self) -> &str;

    /// Upper bound on threads per threadgroup for this pipeline.
    fn max_threads_per_group(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

pub type FunctionHandle = Arc<dyn DeviceFunction>;
pub type PipelineHandle = Arc<dyn Pipeline>;

pub trait ProgramLibrary: Send + Sync + fmt::Debug {
    /// Look up a function by its exported name.
    fn resolve_function(&self, name: &str) -> Option<FunctionHandle>;

    /// Build a pipeline; `Err` carries the driver's message.
    fn build_pipeline(&self, function: &FunctionHandle) -> Result<PipelineHandle, String>;
}

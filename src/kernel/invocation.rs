//! Submitting one kernel run to the device.
//!
//! Buffers bind by position, inputs first then outputs; a context blob, if
//! any, binds at the next index. The submission (and the blob with it) is
//! dropped at the end of [`KernelInvocation::submit`] on every path.

use std::sync::Arc;

use tracing::debug;

use crate::gpu::buffer::Buffer;
use crate::gpu::device::{ContextBlob, Device};
use crate::kernel::cache::KernelProgram;
use crate::kernel::KernelError;

pub struct KernelInvocation<'a> {
    program: &'a KernelProgram,
    inputs: &'a [&'a Buffer],
    outputs: &'a [&'a Buffer],
    context: Option<ContextBlob>,
}

impl<'a> KernelInvocation<'a> {
    pub fn new(program: &'a KernelProgram) -> Self {
        Self {
            program,
            inputs: &[],
            outputs: &[],
            context: None,
        }
    }

    pub fn inputs(mut self, inputs: &'a [&'a Buffer]) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: &'a [&'a Buffer]) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn context(mut self, blob: ContextBlob) -> Self {
        self.context = Some(blob);
        self
    }

    /// Encode, commit and block until the device finishes.
    ///
    /// The grid covers the first output's elements.
    pub fn submit(self, device: &dyn Device) -> Result<(), KernelError> {
        let Self {
            program,
            inputs,
            outputs,
            context,
        } = self;

        let entry = program.entry();
        if inputs.len() != entry.inputs || outputs.len() != entry.outputs {
            return Err(KernelError::ArgumentMismatch {
                name: entry.name.clone(),
                expected_inputs: entry.inputs,
                expected_outputs: entry.outputs,
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
        }

        let elem_size = program.key().dtype.size_in_bytes();
        let grid = outputs.first().map_or(0, |buffer| buffer.len() / elem_size);
        let group = program.pipeline().max_threads_per_group().min(grid).max(1);

        let mut submission = device.new_submission()?;
        submission.set_pipeline(Arc::clone(program.pipeline()));
        for (index, buffer) in inputs.iter().chain(outputs).enumerate() {
            submission.set_buffer(index, buffer.block());
        }
        if let Some(blob) = context {
            submission.set_context(inputs.len() + outputs.len(), blob);
        }
        submission.dispatch(grid, group);
        submission.commit_and_wait()?;

        debug!(kernel = program.name(), grid, group, "Kernel completed");
        Ok(())
    }
}

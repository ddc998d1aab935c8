use std::sync::Arc;

use tfe_rs::device::DeviceMemory;
use tfe_rs::status::{Status, StatusResult};
use tfe_rs::xla::hlo::HloModule;
use tfe_rs::xla::transfer::read_defined_literal;
use tfe_rs::xla::{Executable, ScopedShapedBuffer, ServiceExecutableRunOptions, Shape, ShapedBuffer};

use crate::evaluator::HloEvaluator;
use crate::PLATFORM_NAME;

/// Runs a compiled module by evaluating it on the stream's worker.
pub struct InterpreterExecutable {
    module: Arc<HloModule>,
    result_shape: Shape,
}

impl InterpreterExecutable {
    pub fn new(module: HloModule) -> StatusResult<Self> {
        let result_shape = module
            .config
            .entry_computation_layout
            .as_ref()
            .map(|layout| layout.result_shape.clone())
            .ok_or_else(|| {
                Status::internal(format!(
                    "module {} reached the interpreter backend without a layout",
                    module.name()
                ))
            })?;
        Ok(InterpreterExecutable {
            module: Arc::new(module),
            result_shape,
        })
    }

    pub fn result_shape(&self) -> &Shape {
        &self.result_shape
    }
}

impl Executable for InterpreterExecutable {
    fn module(&self) -> &HloModule {
        &self.module
    }

    fn platform_name(&self) -> &str {
        PLATFORM_NAME
    }

    fn execute_async_on_stream(
        &self,
        run_options: &ServiceExecutableRunOptions<'_>,
        arguments: &[ShapedBuffer],
    ) -> StatusResult<ScopedShapedBuffer> {
        // Hold the argument memory until the stream has evaluated the module.
        let keep_alive = arguments
            .iter()
            .flat_map(|argument| argument.buffers().iter().map(|(_, base)| base.upgrade()))
            .collect::<StatusResult<Vec<DeviceMemory>>>()?;
        let arguments = arguments.to_vec();

        let result = ScopedShapedBuffer::allocate(
            &self.result_shape,
            run_options.allocator,
            run_options.device_ordinal,
        )?;
        let outputs: Vec<DeviceMemory> = result.buffers().iter().map(|(_, memory)| memory.clone()).collect();
        let module = Arc::clone(&self.module);

        run_options.stream.enqueue_fn(move || {
            let _keep_alive = keep_alive;
            let literals = arguments
                .iter()
                .map(read_defined_literal)
                .collect::<StatusResult<Vec<_>>>()?;
            let value = HloEvaluator::new(&module).evaluate(&literals)?;
            let leaves = value.leaves();
            if leaves.len() != outputs.len() {
                return Err(Status::internal(format!(
                    "module {} produced {} leaves for {} result buffers",
                    module.name(),
                    leaves.len(),
                    outputs.len()
                )));
            }
            for (tensor, memory) in leaves.into_iter().zip(&outputs) {
                memory.write(tensor.shared_bytes())?;
            }
            Ok(())
        });
        Ok(result)
    }

    fn size_in_bytes(&self) -> u64 {
        self.module
            .computations()
            .iter()
            .map(|computation| computation.instruction_count() as u64)
            .sum()
    }
}

use std::sync::Arc;

use tfe_rs::status::{Status, StatusResult};
use tfe_rs::xla::hlo::HloModule;
use tfe_rs::xla::passes::{HloPassPipeline, LayoutAssignment};
use tfe_rs::xla::{CompileOptions, Compiler, Executable};

use crate::executable::InterpreterExecutable;
use crate::PLATFORM_NAME;

/// Compiler for the interpreter platform: layout assignment followed by a reference evaluator.
///
/// The evaluator works on host literals, so compilation never draws on the scratch allocator.
#[derive(Debug, Default)]
pub struct InterpreterCompiler;

impl InterpreterCompiler {
    pub fn new() -> Self {
        InterpreterCompiler
    }
}

impl Compiler for InterpreterCompiler {
    fn platform_name(&self) -> &str {
        PLATFORM_NAME
    }

    fn run_hlo_passes(&self, mut module: HloModule, options: &CompileOptions<'_>) -> StatusResult<HloModule> {
        let mut pipeline = HloPassPipeline::new("interpreter");
        pipeline.add_pass(LayoutAssignment::new(
            options.argument_layouts.map(<[_]>::to_vec),
        ));
        pipeline.run(&mut module)?;
        Ok(module)
    }

    fn run_backend(&self, module: HloModule, _options: &CompileOptions<'_>) -> StatusResult<Arc<dyn Executable>> {
        tracing::trace!(module = module.name(), "interpreter backend");
        Ok(Arc::new(InterpreterExecutable::new(module)?))
    }

    fn run_hlo_passes_on_module_group(
        &self,
        _modules: Vec<HloModule>,
        _options: &CompileOptions<'_>,
    ) -> StatusResult<Vec<HloModule>> {
        Err(Status::unimplemented(
            "Module group compilation is not supported on Interpreter",
        ))
    }

    fn compile_module_group(
        &self,
        _modules: Vec<HloModule>,
        _options: &CompileOptions<'_>,
    ) -> StatusResult<Vec<Arc<dyn Executable>>> {
        Err(Status::unimplemented(
            "Module group compilation is not supported on Interpreter",
        ))
    }
}

//! The compile-and-run sequence behind every XLA-lowered eager kernel.

use std::sync::Arc;

use crate::device::Device;
use crate::jit::compilation_cache::{CompilationCache, CompiledKernel};
use crate::jit::launch_context::{KernelInput, LaunchOutput, XlaComputationLaunchContext};
use crate::jit::variable_info::snapshot_resource_variables;
use crate::jit::xla_compiler::{compile_graph, XlaGraph, XlaKernelLookup};
use crate::status::StatusResult;
use crate::xla::local_client::{ExecutableBuildOptions, ExecutableRunOptions};

/// Snapshots variables, compiles (through `cache`), runs on `device` and marshals the results.
///
/// Returns once the run is enqueued; computed outputs carry definition events.
pub fn launch(
    device: &Device,
    graph: &XlaGraph,
    inputs: &[KernelInput],
    kernels: &dyn XlaKernelLookup,
    cache: &CompilationCache,
) -> StatusResult<Vec<LaunchOutput>> {
    let local = device.local()?;
    let variables: Vec<(usize, Arc<_>)> = inputs
        .iter()
        .enumerate()
        .filter_map(|(index, input)| match input {
            KernelInput::Resource(var) => Some((index, Arc::clone(var))),
            KernelInput::Tensor(_) => None,
        })
        .collect();
    let snapshot = snapshot_resource_variables(&variables)?;

    let args = XlaComputationLaunchContext::build_compiler_arguments(inputs, &snapshot)?;
    let key = CompilationCache::signature(device.name(), graph, &args)?;
    let (kernel, cache_hit) = cache.compile_if_needed(key, || {
        let result = compile_graph(graph, &args, kernels)?;
        let executable = local.client().compile(
            &result.module,
            &result.xla_input_shapes,
            &ExecutableBuildOptions::for_device(device.ordinal()),
            Some(local.allocator()),
        )?;
        Ok(CompiledKernel { result, executable })
    })?;
    tracing::debug!(graph = %graph.name, device = device.name(), cache_hit, "launching compiled kernel");

    let launch_context = XlaComputationLaunchContext::new(local, device.ordinal());
    let arguments = launch_context.populate_inputs(&kernel.result, inputs, &snapshot)?;
    let run_options = ExecutableRunOptions::new(local.compute_stream(), local.allocator());
    let result = if kernel.executable.build_options().snapshots_enabled() {
        kernel.executable.run(&arguments, &run_options)?
    } else {
        kernel.executable.run_async(&arguments, &run_options)?
    };
    launch_context.populate_outputs(&kernel.result, result, inputs)
}

//! In-process client: compiles modules for a platform and runs them on local devices.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::device::{DeviceAllocator, Stream};
use crate::status::{ensure_arg, Status, StatusResult};
use crate::xla::compiler::{self, CompileOptions, Compiler};
use crate::xla::executable::{Executable, ExecutionProfile, HloSnapshot, ServiceExecutableRunOptions};
use crate::xla::hlo::HloModule;
use crate::xla::literal::Literal;
use crate::xla::passes::{FlattenCallGraph, HloDce, HloPassPipeline};
use crate::xla::shape::Shape;
use crate::xla::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};
use crate::xla::transfer;

#[derive(Debug, Clone, Default)]
pub struct ExecutableBuildOptions {
    /// Device the executable is built for; runs on other ordinals are rejected.
    pub device_ordinal: Option<usize>,
    /// Record an [`HloSnapshot`] for every run. Falls back to `TFE_XLA_DUMP_SNAPSHOTS`.
    pub dump_snapshots: Option<bool>,
    /// Where snapshots are written. Falls back to `TFE_XLA_DUMP_DIR`.
    pub dump_dir: Option<PathBuf>,
}

impl ExecutableBuildOptions {
    pub fn for_device(device_ordinal: usize) -> Self {
        ExecutableBuildOptions {
            device_ordinal: Some(device_ordinal),
            ..Self::default()
        }
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.dump_snapshots
            .unwrap_or_else(crate::env::xla_dump_snapshots)
    }

    pub fn dump_dir(&self) -> Option<PathBuf> {
        self.dump_dir
            .clone()
            .or_else(|| crate::env::xla_dump_dir().cloned())
    }
}

#[derive(Default, Clone, Copy)]
pub struct ExecutableRunOptions<'a> {
    pub stream: Option<&'a Stream>,
    pub allocator: Option<&'a Arc<DeviceAllocator>>,
    /// Defaults to the allocator's device ordinal.
    pub device_ordinal: Option<usize>,
}

impl<'a> ExecutableRunOptions<'a> {
    pub fn new(stream: &'a Stream, allocator: &'a Arc<DeviceAllocator>) -> Self {
        ExecutableRunOptions {
            stream: Some(stream),
            allocator: Some(allocator),
            device_ordinal: None,
        }
    }
}

pub struct LocalClient {
    compiler: Arc<dyn Compiler>,
}

impl LocalClient {
    /// Client for a platform whose compiler has been registered.
    pub fn for_platform(platform: &str) -> StatusResult<Arc<Self>> {
        Ok(Self::with_compiler(compiler::get_compiler(platform)?))
    }

    pub fn with_compiler(compiler: Arc<dyn Compiler>) -> Arc<Self> {
        Arc::new(LocalClient { compiler })
    }

    pub fn platform_name(&self) -> &str {
        self.compiler.platform_name()
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    /// Passes every backend runs before its own pipeline.
    fn service_pipeline() -> HloPassPipeline {
        let mut pipeline = HloPassPipeline::new("service");
        pipeline.add_pass(FlattenCallGraph).add_pass(HloDce);
        pipeline
    }

    /// Validates `argument_layouts` against the entry computation and compiles the module.
    ///
    /// `scratch_allocator` may be used by the backend for transient memory only.
    pub fn compile(
        &self,
        module: &HloModule,
        argument_layouts: &[Shape],
        build_options: &ExecutableBuildOptions,
        scratch_allocator: Option<&Arc<DeviceAllocator>>,
    ) -> StatusResult<LocalExecutable> {
        module.verify()?;
        let entry = module.entry_computation()?;
        let params = entry.parameter_instructions();
        ensure_arg!(
            params.len() == argument_layouts.len(),
            "Invalid number of arguments for computation: expected {}, got {}.",
            params.len(),
            argument_layouts.len()
        );
        for (i, (param, layout)) in params.iter().zip(argument_layouts).enumerate() {
            ensure_arg!(
                param.shape.compatible(layout),
                "Invalid argument shape for argument {i}, expected {}, got {layout}.",
                param.shape
            );
        }

        let start = Instant::now();
        let mut module = module.clone();
        Self::service_pipeline().run(&mut module)?;
        let options = CompileOptions {
            device_allocator: scratch_allocator,
            argument_layouts: Some(argument_layouts),
        };
        let module = self.compiler.run_hlo_passes(module, &options)?;
        let executable = self.compiler.run_backend(module, &options)?;
        let compile_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            module = executable.module().name(),
            platform = self.platform_name(),
            compile_time_ms,
            "compiled executable"
        );
        Ok(LocalExecutable {
            executable,
            build_options: build_options.clone(),
            compile_time_ms,
            last_snapshot: Mutex::new(None),
        })
    }

    /// Allocates device buffers for `literal` and copies it over on `stream`.
    pub fn literal_to_shaped_buffer(
        &self,
        literal: &Literal,
        stream: &Stream,
        allocator: &Arc<DeviceAllocator>,
    ) -> StatusResult<ScopedShapedBuffer> {
        transfer::literal_to_scoped_buffer(stream, literal, allocator, allocator.device_ordinal())
    }

    pub fn shaped_buffer_to_literal(&self, buffer: &ShapedBuffer, stream: &Stream) -> StatusResult<Literal> {
        transfer::transfer_literal_from_device(stream, buffer)
    }
}

pub struct LocalExecutable {
    executable: Arc<dyn Executable>,
    build_options: ExecutableBuildOptions,
    compile_time_ms: u64,
    last_snapshot: Mutex<Option<HloSnapshot>>,
}

struct ValidatedRun<'a> {
    stream: &'a Stream,
    allocator: &'a Arc<DeviceAllocator>,
    device_ordinal: usize,
}

impl LocalExecutable {
    pub fn executable(&self) -> &Arc<dyn Executable> {
        &self.executable
    }

    pub fn build_options(&self) -> &ExecutableBuildOptions {
        &self.build_options
    }

    pub fn compile_time_ms(&self) -> u64 {
        self.compile_time_ms
    }

    /// Snapshot of the most recent run, when snapshots are enabled.
    pub fn last_snapshot(&self) -> Option<HloSnapshot> {
        self.last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn validate<'a>(
        &self,
        arguments: &[ShapedBuffer],
        options: &ExecutableRunOptions<'a>,
    ) -> StatusResult<ValidatedRun<'a>> {
        let module = self.executable.module();
        let layout = module.config.entry_computation_layout.as_ref().ok_or_else(|| {
            Status::internal(format!("module {} has no entry computation layout", module.name()))
        })?;
        ensure_arg!(
            layout.parameter_shapes.len() == arguments.len(),
            "Invalid number of arguments for computation: expected {}, got {}.",
            layout.parameter_shapes.len(),
            arguments.len()
        );
        for (i, (expected, argument)) in layout.parameter_shapes.iter().zip(arguments).enumerate() {
            ensure_arg!(
                expected.compatible_with_layout(argument.on_host_shape()),
                "Invalid argument shape for argument {i}, expected {expected}, got {}.",
                argument.on_host_shape()
            );
        }

        let stream = options
            .stream
            .ok_or_else(|| Status::invalid_argument("a stream is required to run an executable"))?;
        ensure_arg!(
            stream.ok(),
            "stream {} is uninitialized or in an error state",
            stream.name()
        );
        let allocator = options
            .allocator
            .ok_or_else(|| Status::invalid_argument("a device allocator is required to run an executable"))?;
        let device_ordinal = options.device_ordinal.unwrap_or(allocator.device_ordinal());
        ensure_arg!(
            allocator.device_ordinal() == device_ordinal,
            "allocator for device ordinal {} cannot serve a run on device ordinal {device_ordinal}",
            allocator.device_ordinal()
        );
        if let Some(built_for) = self.build_options.device_ordinal {
            ensure_arg!(
                built_for == device_ordinal,
                "executable was built for device ordinal {built_for} but is run on device ordinal {device_ordinal}"
            );
        }
        for (i, argument) in arguments.iter().enumerate() {
            ensure_arg!(
                argument.device_ordinal() == device_ordinal,
                "argument {i} lives on device ordinal {} but the run targets device ordinal {device_ordinal}",
                argument.device_ordinal()
            );
        }
        Ok(ValidatedRun {
            stream,
            allocator,
            device_ordinal,
        })
    }

    /// Runs to completion and returns the result buffers.
    pub fn run(
        &self,
        arguments: &[ShapedBuffer],
        options: &ExecutableRunOptions<'_>,
    ) -> StatusResult<ScopedShapedBuffer> {
        let mut profile = ExecutionProfile::default();
        self.run_with_profile(arguments, options, &mut profile)
    }

    pub fn run_with_profile(
        &self,
        arguments: &[ShapedBuffer],
        options: &ExecutableRunOptions<'_>,
        profile: &mut ExecutionProfile,
    ) -> StatusResult<ScopedShapedBuffer> {
        let run = self.validate(arguments, options)?;
        let service_options = ServiceExecutableRunOptions {
            stream: run.stream,
            allocator: run.allocator,
            device_ordinal: run.device_ordinal,
        };

        if !self.build_options.snapshots_enabled() {
            let result = self
                .executable
                .execute_on_stream(&service_options, arguments, Some(profile))?;
            profile.compile_time_ms = self.compile_time_ms;
            return Ok(result);
        }

        let recorded_arguments = arguments
            .iter()
            .map(|argument| transfer::transfer_literal_from_device(run.stream, argument))
            .collect::<StatusResult<Vec<_>>>()?;
        let result = self
            .executable
            .execute_on_stream(&service_options, arguments, Some(profile))?;
        profile.compile_time_ms = self.compile_time_ms;
        let recorded_result = transfer::transfer_literal_from_device(run.stream, &result.as_shaped_buffer())?;
        let snapshot = HloSnapshot {
            hlo_module: self.executable.module().clone(),
            arguments: recorded_arguments,
            result: Some(recorded_result),
            execution_platform: self.executable.platform_name().to_string(),
        };
        if let Some(dir) = self.build_options.dump_dir() {
            snapshot.dump_to(&dir)?;
        }
        *self.last_snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        Ok(result)
    }

    /// Validates and enqueues the run; result buffers are defined when the stream catches up.
    pub fn run_async(
        &self,
        arguments: &[ShapedBuffer],
        options: &ExecutableRunOptions<'_>,
    ) -> StatusResult<ScopedShapedBuffer> {
        let run = self.validate(arguments, options)?;
        self.executable.execute_async_on_stream(
            &ServiceExecutableRunOptions {
                stream: run.stream,
                allocator: run.allocator,
                device_ordinal: run.device_ordinal,
            },
            arguments,
        )
    }
}

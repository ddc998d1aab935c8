//! Backend compiler interface and the process-wide registry of compilers by platform.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::device::DeviceAllocator;
use crate::status::{Status, StatusResult};
use crate::xla::executable::Executable;
use crate::xla::hlo::HloModule;
use crate::xla::shape::Shape;

/// Inputs that shape a compilation beyond the module itself.
#[derive(Default, Clone, Copy)]
pub struct CompileOptions<'a> {
    /// Used only for scratch memory during compilation; everything taken from it must be
    /// released before compilation returns.
    pub device_allocator: Option<&'a Arc<DeviceAllocator>>,
    pub argument_layouts: Option<&'a [Shape]>,
}

pub trait Compiler: Send + Sync {
    fn platform_name(&self) -> &str;

    /// Runs the backend's HLO-level pipeline.
    fn run_hlo_passes(&self, module: HloModule, options: &CompileOptions<'_>) -> StatusResult<HloModule>;

    /// Lowers an optimized module into an executable.
    fn run_backend(
        &self,
        module: HloModule,
        options: &CompileOptions<'_>,
    ) -> StatusResult<Arc<dyn Executable>>;

    fn run_hlo_passes_on_module_group(
        &self,
        modules: Vec<HloModule>,
        options: &CompileOptions<'_>,
    ) -> StatusResult<Vec<HloModule>> {
        modules
            .into_iter()
            .map(|module| self.run_hlo_passes(module, options))
            .collect()
    }

    fn compile_module_group(
        &self,
        modules: Vec<HloModule>,
        options: &CompileOptions<'_>,
    ) -> StatusResult<Vec<Arc<dyn Executable>>> {
        modules
            .into_iter()
            .map(|module| self.compile(module, options))
            .collect()
    }

    fn compile(&self, module: HloModule, options: &CompileOptions<'_>) -> StatusResult<Arc<dyn Executable>> {
        let module = self.run_hlo_passes(module, options)?;
        self.run_backend(module, options)
    }

    fn shape_size_bytes(&self, shape: &Shape) -> usize {
        shape.leaves().iter().map(|(_, leaf)| leaf.byte_size()).sum()
    }
}

pub type CompilerFactory = Box<dyn Fn() -> Arc<dyn Compiler> + Send + Sync>;

struct CompilerRegistry {
    factories: RwLock<HashMap<String, CompilerFactory>>,
    instances: RwLock<HashMap<String, Arc<dyn Compiler>>>,
}

impl CompilerRegistry {
    fn new() -> Self {
        CompilerRegistry {
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<CompilerRegistry> = OnceLock::new();

fn global_registry() -> &'static CompilerRegistry {
    GLOBAL_REGISTRY.get_or_init(CompilerRegistry::new)
}

/// Registers a compiler factory for `platform`, replacing any earlier registration.
pub fn register_compiler<F>(platform: impl Into<String>, factory: F)
where
    F: Fn() -> Arc<dyn Compiler> + Send + Sync + 'static,
{
    let platform = platform.into();
    let registry = global_registry();
    registry
        .instances
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&platform);
    registry
        .factories
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(platform, Box::new(factory));
}

/// Returns the compiler for `platform`, constructing it on first use.
pub fn get_compiler(platform: &str) -> StatusResult<Arc<dyn Compiler>> {
    let registry = global_registry();
    if let Some(compiler) = registry
        .instances
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(platform)
    {
        return Ok(Arc::clone(compiler));
    }
    let compiler = {
        let factories = registry.factories.read().unwrap_or_else(PoisonError::into_inner);
        let factory = factories.get(platform).ok_or_else(|| {
            Status::not_found(format!(
                "could not find compiler for platform {platform}: no compiler registered"
            ))
        })?;
        factory()
    };
    let mut instances = registry.instances.write().unwrap_or_else(PoisonError::into_inner);
    Ok(Arc::clone(instances.entry(platform.to_string()).or_insert(compiler)))
}

pub fn registered_platforms() -> Vec<String> {
    global_registry()
        .factories
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}

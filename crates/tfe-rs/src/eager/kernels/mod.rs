//! Kernels eager ops dispatch to.
//!
//! Most ops are lowered to XLA and run through the compiled launch path; ops that manage
//! resources or produce host-memory metadata run directly on the host.

mod host_ops;
mod xla_ops;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::device::Device;
use crate::eager::attr::AttrMap;
use crate::eager::context::Context;
use crate::eager::function::FunctionBody;
use crate::eager::tensor_handle::TensorValue;
use crate::jit::xla_compiler::{XlaKernelLookup, XlaOpKernel};
use crate::status::StatusResult;
use crate::tensor::DType;

pub struct HostKernelContext<'a> {
    pub context: &'a Context,
    pub device: &'a Arc<Device>,
    pub attrs: &'a AttrMap,
    pub inputs: &'a [TensorValue],
}

/// A kernel that runs on the calling thread against ready input values.
pub trait HostKernel: Send + Sync {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>>;

    /// True when outputs live in host memory whatever device the op runs on.
    fn outputs_on_host(&self) -> bool {
        false
    }

    fn run(&self, ctx: &HostKernelContext<'_>) -> StatusResult<Vec<TensorValue>>;
}

#[derive(Clone)]
pub enum Kernel {
    Xla(Arc<dyn XlaOpKernel>),
    Host(Arc<dyn HostKernel>),
    Function(Arc<FunctionBody>),
}

impl Kernel {
    pub fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        match self {
            Kernel::Xla(kernel) => kernel.output_types(attrs, input_types),
            Kernel::Host(kernel) => kernel.output_types(attrs, input_types),
            Kernel::Function(body) => body.check_input_types(input_types).map(|()| body.output_types().to_vec()),
        }
    }

    pub fn outputs_on_host(&self) -> bool {
        match self {
            Kernel::Host(kernel) => kernel.outputs_on_host(),
            Kernel::Xla(_) | Kernel::Function(_) => false,
        }
    }
}

pub struct KernelRegistry {
    xla: RwLock<HashMap<String, Arc<dyn XlaOpKernel>>>,
    host: RwLock<HashMap<String, Arc<dyn HostKernel>>>,
}

impl KernelRegistry {
    fn with_builtins() -> Self {
        let registry = KernelRegistry {
            xla: RwLock::new(HashMap::new()),
            host: RwLock::new(HashMap::new()),
        };
        xla_ops::register_builtin(&registry);
        host_ops::register_builtin(&registry);
        registry
    }

    pub fn register_xla(&self, op: impl Into<String>, kernel: Arc<dyn XlaOpKernel>) {
        self.xla
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op.into(), kernel);
    }

    pub fn register_host(&self, op: impl Into<String>, kernel: Arc<dyn HostKernel>) {
        self.host
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op.into(), kernel);
    }

    pub fn host_kernel(&self, op: &str) -> Option<Arc<dyn HostKernel>> {
        self.host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op)
            .cloned()
    }

    /// Host kernels take precedence over XLA lowerings of the same op.
    pub fn kernel(&self, op: &str) -> Option<Kernel> {
        self.host_kernel(op)
            .map(Kernel::Host)
            .or_else(|| self.xla_kernel(op).map(Kernel::Xla))
    }

    pub fn registered_ops(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .xla
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .chain(self.host.read().unwrap_or_else(PoisonError::into_inner).keys())
            .cloned()
            .collect();
        ops.sort();
        ops.dedup();
        ops
    }
}

impl XlaKernelLookup for KernelRegistry {
    fn xla_kernel(&self, op: &str) -> Option<Arc<dyn XlaOpKernel>> {
        self.xla
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op)
            .cloned()
    }
}

static KERNEL_REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();

pub fn kernel_registry() -> &'static KernelRegistry {
    KERNEL_REGISTRY.get_or_init(KernelRegistry::with_builtins)
}

/// Registers an XLA lowering for `op`, replacing any earlier registration.
pub fn register_xla_kernel(op: impl Into<String>, kernel: Arc<dyn XlaOpKernel>) {
    kernel_registry().register_xla(op, kernel);
}

pub fn register_host_kernel(op: impl Into<String>, kernel: Arc<dyn HostKernel>) {
    kernel_registry().register_host(op, kernel);
}

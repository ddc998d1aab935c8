//! Compiling eager kernels with XLA: variables, locking, lowering and launch marshalling.

pub mod compilation_cache;
pub mod launch;
pub mod launch_context;
pub mod variable;
pub mod variable_info;
pub mod xla_compiler;
pub mod xla_tensor;

pub use compilation_cache::{CacheStats, CompilationCache, CompiledKernel};
pub use launch::launch;
pub use launch_context::{KernelInput, LaunchOutput, XlaComputationLaunchContext};
pub use variable::{ResourceHandle, ResourceMgr, Var, VarMode};
pub use variable_info::{lock_variables, snapshot_resource_variables, OptionalTensor, VariableInfo};
pub use xla_compiler::{
    compile_graph, ArgumentKind, CompilationResult, NodeInput, OutputDescription, OutputKind, ResourceUpdate,
    XlaCompilerArgument, XlaGraph, XlaKernelLookup, XlaNode, XlaOpContext, XlaOpKernel,
};
pub use xla_tensor::DeviceTensor;

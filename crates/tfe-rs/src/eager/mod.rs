//! Eager execution: contexts, ops, tensor handles and their dispatch.

pub mod attr;
pub mod context;
pub mod copy;
pub mod execute;
pub mod executor;
pub mod function;
pub mod kernels;
pub mod op;
pub mod remote;
pub mod tensor_handle;

pub use attr::{AttrMap, AttrValue};
pub use context::{Context, ContextDevicePlacementPolicy, ContextOptions};
pub use copy::copy_to_device;
pub use execute::execute;
pub use executor::{EagerNode, ExecutionQueue};
pub use function::{ArgDef, FunctionBody, FunctionDef, NodeDef, Signature};
pub use kernels::{kernel_registry, register_host_kernel, register_xla_kernel, HostKernel, HostKernelContext, Kernel};
pub use op::Op;
pub use remote::{
    ClusterDef, JobDef, LoopbackChannelFactory, LoopbackWorker, RemoteOpRequest, RemoteTensor, RemoteTensorInfo,
    RemoteWorker, ServerDef, WorkerChannelFactory,
};
pub use tensor_handle::{null_handle_error, TensorHandle, TensorValue};

//! Compile-and-run pipeline: HLO modules, passes, compilers, executables and the local client.

pub mod compiler;
pub mod executable;
pub mod hlo;
pub mod literal;
pub mod local_client;
pub mod passes;
pub mod shape;
pub mod shaped_buffer;
pub mod transfer;

pub use compiler::{get_compiler, register_compiler, CompileOptions, Compiler};
pub use executable::{Executable, ExecutionProfile, HloSnapshot, ServiceExecutableRunOptions};
pub use literal::Literal;
pub use local_client::{ExecutableBuildOptions, ExecutableRunOptions, LocalClient, LocalExecutable};
pub use shape::{Layout, Shape, ShapeIndex};
pub use shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};

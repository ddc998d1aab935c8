extern crate self as tfe_rs;

pub mod device;
pub mod eager;
mod env;
pub mod graph;
pub mod hashing;
pub mod jit;
pub mod logging;
pub mod status;
pub mod tensor;
pub mod xla;

pub use device::{Device, ParsedName};
pub use eager::{copy_to_device, execute, Context, ContextDevicePlacementPolicy, ContextOptions, Op, TensorHandle};
pub use graph::{Graph, GraphNode, Session};
pub use status::{Code, Status, StatusResult};
pub use tensor::{DType, Tensor, TensorShape};

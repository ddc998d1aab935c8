//! Host tensors, element types and shapes shared by the eager and compiled paths.

pub mod dtype;
mod host_tensor;
pub mod shape;

pub use dtype::DType;
pub use host_tensor::{Element, Tensor};
pub use shape::{PartialShape, TensorShape};

//! Host-side values of XLA shapes.

use serde::{Deserialize, Serialize};

use super::shape::{Layout, Shape};
use crate::status::{Status, StatusResult};
use crate::tensor::Tensor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Array(Tensor),
    Tuple(Vec<Literal>),
}

impl Literal {
    pub fn tuple(elements: Vec<Literal>) -> Self {
        Literal::Tuple(elements)
    }

    /// Shape with the descending layout the host representation uses.
    pub fn shape(&self) -> Shape {
        match self {
            Literal::Array(tensor) => Shape::array_with_layout(
                tensor.dtype(),
                tensor.dims().to_vec(),
                Layout::descending(tensor.dims().len()),
            ),
            Literal::Tuple(elements) => Shape::Tuple(elements.iter().map(Literal::shape).collect()),
        }
    }

    pub fn as_tensor(&self) -> StatusResult<&Tensor> {
        match self {
            Literal::Array(tensor) => Ok(tensor),
            Literal::Tuple(_) => Err(Status::invalid_argument("expected an array literal, got a tuple")),
        }
    }

    pub fn into_tensor(self) -> StatusResult<Tensor> {
        match self {
            Literal::Array(tensor) => Ok(tensor),
            Literal::Tuple(_) => Err(Status::invalid_argument("expected an array literal, got a tuple")),
        }
    }

    pub fn tuple_element(&self, index: usize) -> StatusResult<&Literal> {
        match self {
            Literal::Tuple(elements) => elements.get(index).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "tuple index {index} out of range for tuple of {} elements",
                    elements.len()
                ))
            }),
            Literal::Array(_) => Err(Status::invalid_argument("tuple index into an array literal")),
        }
    }

    /// Array leaves in depth-first order.
    pub fn leaves(&self) -> Vec<&Tensor> {
        match self {
            Literal::Array(tensor) => vec![tensor],
            Literal::Tuple(elements) => elements.iter().flat_map(Literal::leaves).collect(),
        }
    }

    pub fn decompose_tuple(self) -> Vec<Literal> {
        match self {
            Literal::Tuple(elements) => elements,
            array => vec![array],
        }
    }
}

impl From<Tensor> for Literal {
    fn from(tensor: Tensor) -> Self {
        Literal::Array(tensor)
    }
}

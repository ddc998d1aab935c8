//! Dense and partially-known tensor shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully defined dimensions of a tensor. Rank zero denotes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<usize>,
}

impl TensorShape {
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        TensorShape { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        TensorShape { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        TensorShape::new(dims.to_vec())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// Shape whose rank or individual dimensions may be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartialShape {
    dims: Option<Vec<Option<usize>>>,
}

impl PartialShape {
    pub fn unknown_rank() -> Self {
        PartialShape { dims: None }
    }

    pub fn new(dims: Vec<Option<usize>>) -> Self {
        PartialShape { dims: Some(dims) }
    }

    /// Builds from the C convention where a negative dimension is unknown and a negative
    /// rank means the rank itself is unknown.
    pub fn from_signed(dims: Option<&[i64]>) -> Self {
        match dims {
            None => PartialShape::unknown_rank(),
            Some(dims) => PartialShape::new(
                dims.iter()
                    .map(|&d| if d < 0 { None } else { Some(d as usize) })
                    .collect(),
            ),
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    pub fn dims(&self) -> Option<&[Option<usize>]> {
        self.dims.as_deref()
    }

    pub fn is_fully_defined(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|dims| dims.iter().all(Option::is_some))
    }

    pub fn is_compatible_with(&self, shape: &TensorShape) -> bool {
        match &self.dims {
            None => true,
            Some(dims) => {
                dims.len() == shape.rank()
                    && dims
                        .iter()
                        .zip(shape.dims())
                        .all(|(expected, actual)| expected.map_or(true, |d| d == *actual))
            }
        }
    }
}

impl From<&TensorShape> for PartialShape {
    fn from(shape: &TensorShape) -> Self {
        PartialShape::new(shape.dims().iter().map(|&d| Some(d)).collect())
    }
}

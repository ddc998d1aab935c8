//! XLA shapes: dense arrays with an optional physical layout, or tuples of shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::{Status, StatusResult};
use crate::tensor::{DType, TensorShape};

/// Path from the root of a (possibly nested) tuple shape to a subshape.
pub type ShapeIndex = Vec<usize>;

/// Physical dimension order, most-minor dimension first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub minor_to_major: Vec<usize>,
}

impl Layout {
    /// Row-major layout: the last logical dimension varies fastest.
    pub fn descending(rank: usize) -> Self {
        Layout {
            minor_to_major: (0..rank).rev().collect(),
        }
    }

    pub fn is_descending(&self) -> bool {
        let rank = self.minor_to_major.len();
        self.minor_to_major
            .iter()
            .enumerate()
            .all(|(pos, &dim)| dim == rank - 1 - pos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Array {
        element_type: DType,
        dims: Vec<usize>,
        layout: Option<Layout>,
    },
    Tuple(Vec<Shape>),
}

pub(crate) fn primitive_type_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f32",
        DType::F64 => "f64",
        DType::I32 => "s32",
        DType::I64 => "s64",
        DType::Bool => "pred",
        DType::Resource => "resource",
    }
}

impl Shape {
    pub fn array(element_type: DType, dims: impl Into<Vec<usize>>) -> Self {
        Shape::Array {
            element_type,
            dims: dims.into(),
            layout: None,
        }
    }

    pub fn array_with_layout(element_type: DType, dims: impl Into<Vec<usize>>, layout: Layout) -> Self {
        Shape::Array {
            element_type,
            dims: dims.into(),
            layout: Some(layout),
        }
    }

    pub fn scalar(element_type: DType) -> Self {
        Shape::array(element_type, Vec::new())
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn from_tensor_shape(element_type: DType, shape: &TensorShape) -> Self {
        Shape::array(element_type, shape.dims().to_vec())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shape::Array { .. })
    }

    pub fn element_type(&self) -> Option<DType> {
        match self {
            Shape::Array { element_type, .. } => Some(*element_type),
            Shape::Tuple(_) => None,
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            Shape::Array { dims, .. } => dims,
            Shape::Tuple(_) => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    pub fn layout(&self) -> Option<&Layout> {
        match self {
            Shape::Array { layout, .. } => layout.as_ref(),
            Shape::Tuple(_) => None,
        }
    }

    pub fn tuple_shapes(&self) -> &[Shape] {
        match self {
            Shape::Tuple(elements) => elements,
            Shape::Array { .. } => &[],
        }
    }

    pub fn element_count(&self) -> usize {
        self.dims().iter().product()
    }

    /// Bytes of dense storage for an array; zero for tuple nodes themselves.
    pub fn byte_size(&self) -> usize {
        match self {
            Shape::Array { element_type, dims, .. } => {
                dims.iter().product::<usize>() * element_type.size_in_bytes()
            }
            Shape::Tuple(_) => 0,
        }
    }

    pub fn tensor_shape(&self) -> StatusResult<TensorShape> {
        match self {
            Shape::Array { dims, .. } => Ok(TensorShape::new(dims.clone())),
            Shape::Tuple(_) => Err(Status::invalid_argument(format!(
                "expected an array shape, got {}",
                self
            ))),
        }
    }

    pub fn subshape(&self, index: &[usize]) -> StatusResult<&Shape> {
        let mut current = self;
        for &i in index {
            current = current.tuple_shapes().get(i).ok_or_else(|| {
                Status::invalid_argument(format!("invalid shape index {index:?} into {self}"))
            })?;
        }
        Ok(current)
    }

    /// Every array leaf with its index, in depth-first order.
    pub fn leaves(&self) -> Vec<(ShapeIndex, &Shape)> {
        fn walk<'a>(shape: &'a Shape, index: &mut ShapeIndex, out: &mut Vec<(ShapeIndex, &'a Shape)>) {
            match shape {
                Shape::Array { .. } => out.push((index.clone(), shape)),
                Shape::Tuple(elements) => {
                    for (i, element) in elements.iter().enumerate() {
                        index.push(i);
                        walk(element, index, out);
                        index.pop();
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut Vec::new(), &mut out);
        out
    }

    /// Same element types and dimensions, ignoring layouts.
    pub fn compatible(&self, other: &Shape) -> bool {
        match (self, other) {
            (
                Shape::Array { element_type: a, dims: da, .. },
                Shape::Array { element_type: b, dims: db, .. },
            ) => a == b && da == db,
            (Shape::Tuple(a), Shape::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(y))
            }
            _ => false,
        }
    }

    /// Compatible, and layouts agree wherever both sides carry one.
    pub fn compatible_with_layout(&self, other: &Shape) -> bool {
        match (self, other) {
            (Shape::Array { layout: la, .. }, Shape::Array { layout: lb, .. }) => {
                self.compatible(other)
                    && match (la, lb) {
                        (Some(a), Some(b)) => a == b,
                        _ => true,
                    }
            }
            (Shape::Tuple(a), Shape::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible_with_layout(y))
            }
            _ => false,
        }
    }

    pub fn has_layout(&self) -> bool {
        match self {
            Shape::Array { layout, .. } => layout.is_some(),
            Shape::Tuple(elements) => elements.iter().all(Shape::has_layout),
        }
    }

    /// Assigns the descending layout to every array lacking one. Returns whether anything changed.
    pub fn set_default_layout(&mut self) -> bool {
        match self {
            Shape::Array { dims, layout, .. } => {
                if layout.is_none() {
                    *layout = Some(Layout::descending(dims.len()));
                    true
                } else {
                    false
                }
            }
            Shape::Tuple(elements) => elements
                .iter_mut()
                .fold(false, |changed, element| element.set_default_layout() || changed),
        }
    }

    pub fn without_layout(&self) -> Shape {
        match self {
            Shape::Array { element_type, dims, .. } => Shape::array(*element_type, dims.clone()),
            Shape::Tuple(elements) => Shape::Tuple(elements.iter().map(Shape::without_layout).collect()),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array { element_type, dims, layout } => {
                write!(f, "{}[", primitive_type_name(*element_type))?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{d}")?;
                }
                f.write_str("]")?;
                if let Some(layout) = layout {
                    if !dims.is_empty() {
                        f.write_str("{")?;
                        for (i, d) in layout.minor_to_major.iter().enumerate() {
                            if i > 0 {
                                f.write_str(",")?;
                            }
                            write!(f, "{d}")?;
                        }
                        f.write_str("}")?;
                    }
                }
                Ok(())
            }
            Shape::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
        }
    }
}

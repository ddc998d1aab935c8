//! Host-resident tensor value with a shared, immutable byte buffer.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{dtype::DType, shape::TensorShape};
use crate::status::{Status, StatusResult};

/// Scalar types that can be stored in a [`Tensor`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
    const SIZE: usize;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! numeric_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

numeric_element!(f32, DType::F32);
numeric_element!(f64, DType::F64);
numeric_element!(i32, DType::I32);
numeric_element!(i64, DType::I64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;
    const SIZE: usize = 1;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Dense host tensor. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: TensorShape,
    data: Arc<[u8]>,
}

impl Tensor {
    /// Wraps raw little-endian bytes, validating the length against `dtype` and `shape`.
    pub fn from_bytes(dtype: DType, shape: TensorShape, bytes: Vec<u8>) -> StatusResult<Self> {
        Self::from_shared_bytes(dtype, shape, Arc::from(bytes))
    }

    pub fn from_shared_bytes(
        dtype: DType,
        shape: TensorShape,
        data: Arc<[u8]>,
    ) -> StatusResult<Self> {
        if dtype == DType::Resource {
            return Err(Status::invalid_argument(
                "resource tensors have no dense host representation",
            ));
        }
        let expected = shape.num_elements() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Status::invalid_argument(format!(
                "tensor of type {dtype} and shape {shape} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Tensor { dtype, shape, data })
    }

    /// Builds a tensor from typed values, validating the element count.
    pub fn from_vec<T: Element>(shape: TensorShape, values: Vec<T>) -> StatusResult<Self> {
        if values.len() != shape.num_elements() {
            return Err(Status::invalid_argument(format!(
                "tensor data length ({}) does not match shape {shape}",
                values.len()
            )));
        }
        let mut bytes = Vec::with_capacity(values.len() * T::SIZE);
        for value in values {
            value.write_le(&mut bytes);
        }
        Ok(Tensor {
            dtype: T::DTYPE,
            shape,
            data: Arc::from(bytes),
        })
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        let mut bytes = Vec::with_capacity(T::SIZE);
        value.write_le(&mut bytes);
        Tensor {
            dtype: T::DTYPE,
            shape: TensorShape::scalar(),
            data: Arc::from(bytes),
        }
    }

    pub fn zeros(dtype: DType, shape: TensorShape) -> StatusResult<Self> {
        let len = shape.num_elements() * dtype.size_in_bytes();
        Self::from_bytes(dtype, shape, vec![0u8; len])
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Decodes the payload as `T`, failing if the dtype differs.
    pub fn to_vec<T: Element>(&self) -> StatusResult<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Status::invalid_argument(format!(
                "tensor has type {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self.data.chunks_exact(T::SIZE).map(T::read_le).collect())
    }

    /// Reshapes without copying; the element count must be preserved.
    pub fn reshaped(&self, shape: TensorShape) -> StatusResult<Self> {
        if shape.num_elements() != self.num_elements() {
            return Err(Status::invalid_argument(format!(
                "cannot reshape tensor of shape {} into {shape}",
                self.shape
            )));
        }
        Ok(Tensor {
            dtype: self.dtype,
            shape,
            data: Arc::clone(&self.data),
        })
    }

    /// True when both tensors are views of the same allocation.
    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Returns a tensor with its own freshly allocated buffer.
    pub fn deep_copy(&self) -> Self {
        Tensor {
            dtype: self.dtype,
            shape: self.shape.clone(),
            data: Arc::from(self.data.to_vec()),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct TensorRepr {
    dtype: DType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

impl Serialize for Tensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TensorRepr {
            dtype: self.dtype,
            dims: self.shape.dims().to_vec(),
            data: self.data.to_vec(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = TensorRepr::deserialize(deserializer)?;
        Tensor::from_bytes(repr.dtype, TensorShape::new(repr.dims), repr.data)
            .map_err(serde::de::Error::custom)
    }
}

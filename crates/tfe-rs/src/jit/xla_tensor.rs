//! Tensors whose storage lives in device memory.

use std::sync::Arc;

use crate::device::{DefinitionEvent, DeviceAllocator, DeviceMemory, Event};
use crate::status::StatusResult;
use crate::tensor::{DType, Tensor, TensorShape};
use crate::xla::shape::{Layout, Shape};
use crate::xla::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};

/// A dense tensor in device memory, valid once its definition event has completed.
///
/// Clones alias the same memory and the same definition event slot.
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    dtype: DType,
    shape: TensorShape,
    memory: DeviceMemory,
    definition_event: Arc<DefinitionEvent>,
}

impl DeviceTensor {
    /// A tensor whose contents are valid immediately.
    pub fn new(dtype: DType, shape: TensorShape, memory: DeviceMemory) -> Self {
        DeviceTensor {
            dtype,
            shape,
            memory,
            definition_event: Arc::new(DefinitionEvent::default()),
        }
    }

    /// A tensor whose contents become valid once `event` completes.
    pub fn defined_by(dtype: DType, shape: TensorShape, memory: DeviceMemory, event: Event) -> StatusResult<Self> {
        let tensor = DeviceTensor::new(dtype, shape, memory);
        tensor.set_definition_event(event)?;
        Ok(tensor)
    }

    /// Allocates device memory already holding `tensor`'s bytes.
    pub fn from_host(tensor: &Tensor, allocator: &Arc<DeviceAllocator>) -> StatusResult<Self> {
        let memory = allocator.allocate_with(tensor.shared_bytes())?;
        Ok(DeviceTensor::new(tensor.dtype(), tensor.shape().clone(), memory))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn definition_event(&self) -> &DefinitionEvent {
        &self.definition_event
    }

    /// Moves the definition point forward to `event`, shared by every clone of this tensor.
    pub fn set_definition_event(&self, event: Event) -> StatusResult<()> {
        self.definition_event.reset(event)
    }

    pub fn wait_defined(&self) -> StatusResult<()> {
        self.definition_event.wait()
    }

    /// Waits for the defining work and copies the contents to the host.
    pub fn to_host(&self) -> StatusResult<Tensor> {
        self.wait_defined()?;
        Tensor::from_shared_bytes(self.dtype, self.shape.clone(), self.memory.read()?)
    }

    /// A defined copy in fresh memory from the same allocator.
    pub fn deep_copy(&self) -> StatusResult<DeviceTensor> {
        self.wait_defined()?;
        let bytes: Arc<[u8]> = Arc::from(self.memory.read()?.to_vec());
        let memory = self.memory.allocator().allocate_with(bytes)?;
        Ok(DeviceTensor::new(self.dtype, self.shape.clone(), memory))
    }

    pub fn xla_shape(&self) -> Shape {
        Shape::array_with_layout(
            self.dtype,
            self.shape.dims().to_vec(),
            Layout::descending(self.shape.rank()),
        )
    }

    /// Borrowed view for passing as an executable argument.
    pub fn shaped_buffer(&self, device_ordinal: usize) -> StatusResult<ShapedBuffer> {
        let scoped = ScopedShapedBuffer::from_array(self.xla_shape(), self.memory.clone(), device_ordinal)?;
        Ok(scoped.as_shaped_buffer())
    }

    pub fn shares_memory_with(&self, other: &DeviceTensor) -> bool {
        self.memory.same_allocation(&other.memory)
    }
}

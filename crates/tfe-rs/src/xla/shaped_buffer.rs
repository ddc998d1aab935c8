//! Device buffers laid out according to an XLA shape.
//!
//! Only array leaves own memory; tuple nodes are purely structural.

use std::sync::Arc;

use crate::device::{DeviceAllocator, DeviceMemory, DeviceMemoryBase};
use crate::status::{Status, StatusResult};
use crate::xla::shape::{Shape, ShapeIndex};

/// Non-owning view of device buffers. The memory must outlive every use of the view.
#[derive(Debug, Clone)]
pub struct ShapedBuffer {
    on_host_shape: Shape,
    on_device_shape: Shape,
    device_ordinal: usize,
    buffers: Vec<(ShapeIndex, DeviceMemoryBase)>,
}

impl ShapedBuffer {
    pub fn on_host_shape(&self) -> &Shape {
        &self.on_host_shape
    }

    pub fn on_device_shape(&self) -> &Shape {
        &self.on_device_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn buffer(&self, index: &[usize]) -> Option<&DeviceMemoryBase> {
        self.buffers
            .iter()
            .find(|(i, _)| i.as_slice() == index)
            .map(|(_, buffer)| buffer)
    }

    pub fn buffers(&self) -> &[(ShapeIndex, DeviceMemoryBase)] {
        &self.buffers
    }
}

/// Owning shaped buffer: its device memory is released when it is dropped.
#[derive(Debug)]
pub struct ScopedShapedBuffer {
    on_host_shape: Shape,
    on_device_shape: Shape,
    device_ordinal: usize,
    allocator: Arc<DeviceAllocator>,
    buffers: Vec<(ShapeIndex, DeviceMemory)>,
}

impl ScopedShapedBuffer {
    /// Allocates undefined memory for every array leaf of `shape`.
    pub fn allocate(
        shape: &Shape,
        allocator: &Arc<DeviceAllocator>,
        device_ordinal: usize,
    ) -> StatusResult<Self> {
        let mut buffers = Vec::new();
        for (index, leaf) in shape.leaves() {
            buffers.push((index, allocator.allocate(leaf.byte_size())?));
        }
        Ok(ScopedShapedBuffer {
            on_host_shape: shape.clone(),
            on_device_shape: shape.clone(),
            device_ordinal,
            allocator: Arc::clone(allocator),
            buffers,
        })
    }

    /// Adopts existing device memory for an array shape.
    pub fn from_array(
        shape: Shape,
        memory: DeviceMemory,
        device_ordinal: usize,
    ) -> StatusResult<Self> {
        if !shape.is_array() {
            return Err(Status::internal(format!("from_array called with tuple shape {shape}")));
        }
        if memory.size() != shape.byte_size() {
            return Err(Status::internal(format!(
                "buffer of {} bytes cannot hold {shape}",
                memory.size()
            )));
        }
        Ok(ScopedShapedBuffer {
            on_host_shape: shape.clone(),
            on_device_shape: shape,
            device_ordinal,
            allocator: Arc::clone(memory.allocator()),
            buffers: vec![(Vec::new(), memory)],
        })
    }

    pub fn on_host_shape(&self) -> &Shape {
        &self.on_host_shape
    }

    pub fn on_device_shape(&self) -> &Shape {
        &self.on_device_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    pub fn buffer(&self, index: &[usize]) -> Option<&DeviceMemory> {
        self.buffers
            .iter()
            .find(|(i, _)| i.as_slice() == index)
            .map(|(_, buffer)| buffer)
    }

    pub fn buffers(&self) -> &[(ShapeIndex, DeviceMemory)] {
        &self.buffers
    }

    pub fn as_shaped_buffer(&self) -> ShapedBuffer {
        ShapedBuffer {
            on_host_shape: self.on_host_shape.clone(),
            on_device_shape: self.on_device_shape.clone(),
            device_ordinal: self.device_ordinal,
            buffers: self
                .buffers
                .iter()
                .map(|(index, memory)| (index.clone(), memory.downgrade()))
                .collect(),
        }
    }

    /// Wraps a non-tuple result into a one-element tuple; tuples are returned unchanged.
    pub fn into_tuple(self) -> ScopedShapedBuffer {
        if self.on_host_shape.is_tuple() {
            return self;
        }
        ScopedShapedBuffer {
            on_host_shape: Shape::tuple(vec![self.on_host_shape]),
            on_device_shape: Shape::tuple(vec![self.on_device_shape]),
            device_ordinal: self.device_ordinal,
            allocator: self.allocator,
            buffers: self
                .buffers
                .into_iter()
                .map(|(mut index, memory)| {
                    index.insert(0, 0);
                    (index, memory)
                })
                .collect(),
        }
    }

    /// Moves ownership of the subtree at `index` into a new scoped buffer.
    pub fn take_sub_tree(&mut self, index: &[usize]) -> StatusResult<ScopedShapedBuffer> {
        let host = self.on_host_shape.subshape(index)?.clone();
        let device = self.on_device_shape.subshape(index)?.clone();
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for (buffer_index, memory) in self.buffers.drain(..) {
            if buffer_index.starts_with(index) {
                taken.push((buffer_index[index.len()..].to_vec(), memory));
            } else {
                kept.push((buffer_index, memory));
            }
        }
        self.buffers = kept;
        Ok(ScopedShapedBuffer {
            on_host_shape: host,
            on_device_shape: device,
            device_ordinal: self.device_ordinal,
            allocator: Arc::clone(&self.allocator),
            buffers: taken,
        })
    }

    /// The memory of an array-shaped buffer.
    pub fn into_array_memory(mut self) -> StatusResult<DeviceMemory> {
        if !self.on_host_shape.is_array() {
            return Err(Status::internal(format!(
                "expected an array buffer, got {}",
                self.on_host_shape
            )));
        }
        self.buffers
            .pop()
            .map(|(_, memory)| memory)
            .ok_or_else(|| Status::internal("array buffer has no memory"))
    }
}

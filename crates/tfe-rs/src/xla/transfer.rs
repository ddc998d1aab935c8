//! Moving literals between host memory and shaped device buffers.

use std::sync::Arc;

use crate::device::{DeviceAllocator, Stream};
use crate::status::{Status, StatusResult};
use crate::tensor::Tensor;
use crate::xla::literal::Literal;
use crate::xla::shape::Shape;
use crate::xla::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};

/// Enqueues writes of every leaf of `literal` into `buffer` on `stream`.
pub fn transfer_literal_to_device(
    stream: &Stream,
    literal: &Literal,
    buffer: &ShapedBuffer,
) -> StatusResult<()> {
    if !literal.shape().compatible(buffer.on_host_shape()) {
        return Err(Status::invalid_argument(format!(
            "cannot transfer literal of shape {} into buffer of shape {}",
            literal.shape(),
            buffer.on_host_shape()
        )));
    }
    let leaves = literal.leaves();
    for ((_, base), tensor) in buffer.buffers().iter().zip(leaves) {
        let memory = base.upgrade()?;
        let bytes = tensor.shared_bytes();
        stream.enqueue_fn(move || memory.write(bytes));
    }
    Ok(())
}

/// Allocates device buffers for `literal` and enqueues the copy.
pub fn literal_to_scoped_buffer(
    stream: &Stream,
    literal: &Literal,
    allocator: &Arc<DeviceAllocator>,
    device_ordinal: usize,
) -> StatusResult<ScopedShapedBuffer> {
    let buffer = ScopedShapedBuffer::allocate(&literal.shape(), allocator, device_ordinal)?;
    transfer_literal_to_device(stream, literal, &buffer.as_shaped_buffer())?;
    Ok(buffer)
}

/// Waits for `stream` and reads `buffer` back into a literal.
pub fn transfer_literal_from_device(stream: &Stream, buffer: &ShapedBuffer) -> StatusResult<Literal> {
    stream.block_host_until_done()?;
    read_defined_literal(buffer)
}

/// Reads `buffer` without synchronizing. Every leaf must already be defined.
pub fn read_defined_literal(buffer: &ShapedBuffer) -> StatusResult<Literal> {
    read_literal(buffer.on_host_shape(), &mut Vec::new(), buffer)
}

fn read_literal(shape: &Shape, index: &mut Vec<usize>, buffer: &ShapedBuffer) -> StatusResult<Literal> {
    match shape {
        Shape::Tuple(elements) => {
            let mut out = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                index.push(i);
                out.push(read_literal(element, index, buffer)?);
                index.pop();
            }
            Ok(Literal::Tuple(out))
        }
        Shape::Array { element_type, .. } => {
            let memory = buffer
                .buffer(index)
                .ok_or_else(|| Status::internal(format!("no buffer at shape index {index:?}")))?
                .upgrade()?;
            let tensor = Tensor::from_shared_bytes(*element_type, shape.tensor_shape()?, memory.read()?)?;
            Ok(Literal::Array(tensor))
        }
    }
}

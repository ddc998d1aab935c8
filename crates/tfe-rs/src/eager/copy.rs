//! Moving tensor values between devices and processes.

use std::sync::Arc;

use crate::device::{Device, DeviceKind};
use crate::eager::context::Context;
use crate::eager::remote::RemoteTensor;
use crate::eager::tensor_handle::{TensorHandle, TensorValue};
use crate::jit::xla_tensor::DeviceTensor;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, Tensor};

/// Returns a handle holding `handle`'s value on `device_name`.
///
/// A copy to the device that already holds the value shares its storage. Names are resolved
/// against the context's current topology.
pub fn copy_to_device(handle: &TensorHandle, context: &Context, device_name: &str) -> StatusResult<TensorHandle> {
    if handle.context_id() != context.id() {
        return Err(Status::invalid_argument(
            "cannot copy a handle produced by a different context",
        ));
    }
    let target = context.find_device(device_name)?;
    copy_handle_to(handle, context, &target)
}

pub(crate) fn copy_handle_to(
    handle: &TensorHandle,
    context: &Context,
    target: &Arc<Device>,
) -> StatusResult<TensorHandle> {
    handle.device().ensure_live()?;
    handle.backing_device().ensure_live()?;
    target.ensure_live()?;
    if handle.dtype() == DType::Resource {
        return Err(Status::invalid_argument(format!(
            "Can't copy Tensor with type resource to device {}.",
            target.name()
        )));
    }
    if handle.backing_device().same_device(target) {
        if handle.device().same_device(target) {
            return Ok(handle.copy_sharing_tensor());
        }
        let value = handle.wait_value()?;
        return Ok(TensorHandle::ready(
            context.id(),
            Arc::clone(target),
            Arc::clone(target),
            value,
        ));
    }
    let value = copy_value(handle.wait_value()?, target)?;
    tracing::debug!(
        from = handle.backing_device_name(),
        to = target.name(),
        dtype = %handle.dtype(),
        "copied tensor handle"
    );
    Ok(TensorHandle::ready(
        context.id(),
        Arc::clone(target),
        Arc::clone(target),
        value,
    ))
}

/// Schedules a host-to-device write on the target's transfer stream.
fn host_to_device(tensor: &Tensor, target: &Device) -> StatusResult<DeviceTensor> {
    let local = target.local()?;
    let memory = local.allocator().allocate(tensor.byte_size())?;
    let stream = local.host_to_device_stream();
    let destination = memory.clone();
    let bytes = tensor.shared_bytes();
    stream.enqueue_fn(move || destination.write(bytes));
    DeviceTensor::defined_by(tensor.dtype(), tensor.shape().clone(), memory, stream.record_event())
}

/// Schedules a device-to-device copy ordered after the source's definition event.
fn device_to_device(source: &DeviceTensor, target: &Device) -> StatusResult<DeviceTensor> {
    let local = target.local()?;
    let memory = local.allocator().allocate(source.memory().size())?;
    let stream = local.host_to_device_stream();
    if let Some(event) = source.definition_event().get() {
        stream.wait_for_event(&event);
    }
    let from = source.memory().clone();
    let destination = memory.clone();
    stream.enqueue_fn(move || destination.write(from.read()?));
    DeviceTensor::defined_by(source.dtype(), source.shape().clone(), memory, stream.record_event())
}

fn to_host(value: &TensorValue) -> StatusResult<Tensor> {
    match value {
        TensorValue::Host(tensor) => Ok(tensor.clone()),
        TensorValue::Device(tensor) => tensor.to_host(),
        TensorValue::Remote(tensor) => tensor.fetch(),
        TensorValue::Resource(_) => Err(Status::invalid_argument(
            "resource handles have no dense value to copy",
        )),
    }
}

/// Materializes `value` on `target`.
pub(crate) fn copy_value(value: TensorValue, target: &Device) -> StatusResult<TensorValue> {
    match (&value, target.kind()) {
        (TensorValue::Resource(_), _) => Err(Status::invalid_argument(format!(
            "Can't copy Tensor with type resource to device {}.",
            target.name()
        ))),
        (TensorValue::Host(tensor), DeviceKind::Local(_)) => {
            Ok(TensorValue::Device(host_to_device(tensor, target)?))
        }
        (TensorValue::Device(tensor), DeviceKind::Local(local)) => {
            if Arc::ptr_eq(tensor.memory().allocator(), local.allocator()) {
                return Ok(value.clone());
            }
            Ok(TensorValue::Device(device_to_device(tensor, target)?))
        }
        (TensorValue::Remote(remote), DeviceKind::Local(_)) => {
            Ok(TensorValue::Device(host_to_device(&remote.fetch()?, target)?))
        }
        (TensorValue::Remote(remote), DeviceKind::Remote(worker)) if remote.worker().task_name() == worker.task_name() => {
            if remote.device() == target.name() {
                return Ok(value.clone());
            }
            let info = worker.copy_tensor(remote.id(), target.name())?;
            Ok(TensorValue::Remote(Arc::new(RemoteTensor::new(
                Arc::clone(worker),
                info,
                target.name(),
            ))))
        }
        (_, DeviceKind::Remote(worker)) => {
            let tensor = to_host(&value)?;
            let info = worker.put_tensor(target.name(), tensor)?;
            Ok(TensorValue::Remote(Arc::new(RemoteTensor::new(
                Arc::clone(worker),
                info,
                target.name(),
            ))))
        }
    }
}

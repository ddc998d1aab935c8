//! Kernels that run on the host: resource management and shape metadata.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::xla_ops::format_dims;
use super::{HostKernel, HostKernelContext, KernelRegistry};
use crate::eager::attr::AttrMap;
use crate::eager::tensor_handle::TensorValue;
use crate::jit::variable::ResourceHandle;
use crate::jit::xla_tensor::DeviceTensor;
use crate::status::{Code, Status, StatusResult};
use crate::tensor::{DType, PartialShape, Tensor, TensorShape};

static NEXT_ANONYMOUS_VAR: AtomicU64 = AtomicU64::new(0);

fn resource_input<'a>(op: &str, inputs: &'a [TensorValue], index: usize) -> StatusResult<&'a ResourceHandle> {
    match inputs.get(index) {
        Some(TensorValue::Resource(handle)) => Ok(handle),
        Some(other) => Err(Status::invalid_argument(format!(
            "input {index} of {op} must be a resource handle, got a {} tensor",
            other.dtype()
        ))),
        None => Err(Status::invalid_argument(format!("{op} has no input {index}"))),
    }
}

fn host_input(op: &str, inputs: &[TensorValue], index: usize) -> StatusResult<Tensor> {
    match inputs.get(index) {
        Some(TensorValue::Host(tensor)) => Ok(tensor.clone()),
        Some(TensorValue::Device(tensor)) => tensor.to_host(),
        Some(_) => Err(Status::invalid_argument(format!(
            "input {index} of {op} must be a dense local tensor"
        ))),
        None => Err(Status::invalid_argument(format!("{op} has no input {index}"))),
    }
}

fn expect_resource_first(op: &str, input_types: &[DType], count: usize) -> StatusResult<()> {
    if input_types.len() != count {
        return Err(Status::invalid_argument(format!(
            "{op} expects {count} inputs, got {}",
            input_types.len()
        )));
    }
    if input_types[0] != DType::Resource {
        return Err(Status::invalid_argument(format!(
            "input 0 of {op} must be a resource handle, got {}",
            input_types[0]
        )));
    }
    Ok(())
}

struct VarHandle;

impl HostKernel for VarHandle {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        if !input_types.is_empty() {
            return Err(Status::invalid_argument("VarHandleOp takes no inputs"));
        }
        attrs.required_dtype("dtype")?;
        Ok(vec![DType::Resource])
    }

    fn run(&self, ctx: &HostKernelContext<'_>) -> StatusResult<Vec<TensorValue>> {
        let shared_name = ctx.attrs.string_or("shared_name", "")?;
        let name = if shared_name.is_empty() {
            format!("_AnonymousVar{}", NEXT_ANONYMOUS_VAR.fetch_add(1, Ordering::Relaxed))
        } else {
            shared_name
        };
        let handle = ResourceHandle {
            device: ctx.device.name().to_string(),
            container: ctx.attrs.string_or("container", "")?,
            name,
            dtype: ctx.attrs.required_dtype("dtype")?,
            shape: ctx.attrs.shape("shape")?.unwrap_or_else(PartialShape::unknown_rank),
        };
        Ok(vec![TensorValue::Resource(handle)])
    }
}

struct VarIsInitialized;

impl HostKernel for VarIsInitialized {
    fn output_types(&self, _attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_resource_first("VarIsInitializedOp", input_types, 1)?;
        Ok(vec![DType::Bool])
    }

    fn outputs_on_host(&self) -> bool {
        true
    }

    fn run(&self, ctx: &HostKernelContext<'_>) -> StatusResult<Vec<TensorValue>> {
        let handle = resource_input("VarIsInitializedOp", ctx.inputs, 0)?;
        let initialized = match ctx.context.resource_mgr().lookup(handle) {
            Ok(var) => var.is_initialized(),
            Err(status) if status.code() == Code::NotFound => false,
            Err(status) => return Err(status),
        };
        Ok(vec![TensorValue::Host(Tensor::scalar(initialized))])
    }
}

struct DestroyResource;

impl HostKernel for DestroyResource {
    fn output_types(&self, _attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_resource_first("DestroyResourceOp", input_types, 1)?;
        Ok(Vec::new())
    }

    fn run(&self, ctx: &HostKernelContext<'_>) -> StatusResult<Vec<TensorValue>> {
        let handle = resource_input("DestroyResourceOp", ctx.inputs, 0)?;
        let ignore_lookup_error = ctx.attrs.bool_or("ignore_lookup_error", true)?;
        match ctx.context.resource_mgr().delete(handle) {
            Err(status) if status.code() == Code::NotFound && ignore_lookup_error => Ok(Vec::new()),
            other => other.map(|()| Vec::new()),
        }
    }
}

struct ShapeOp;

impl HostKernel for ShapeOp {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        if input_types.len() != 1 {
            return Err(Status::invalid_argument("Shape expects exactly one input"));
        }
        match attrs.dtype("out_type")?.unwrap_or(DType::I32) {
            dtype @ (DType::I32 | DType::I64) => Ok(vec![dtype]),
            other => Err(Status::invalid_argument(format!(
                "Shape out_type must be int32 or int64, got {other}"
            ))),
        }
    }

    fn outputs_on_host(&self) -> bool {
        true
    }

    fn run(&self, ctx: &HostKernelContext<'_>) -> StatusResult<Vec<TensorValue>> {
        let input = ctx
            .inputs
            .first()
            .ok_or_else(|| Status::invalid_argument("Shape has no input 0"))?;
        let dims = input.shape();
        let rank = TensorShape::new([dims.rank()]);
        let out = match ctx.attrs.dtype("out_type")?.unwrap_or(DType::I32) {
            DType::I64 => Tensor::from_vec(rank, dims.dims().iter().map(|&d| d as i64).collect())?,
            _ => {
                let values = dims
                    .dims()
                    .iter()
                    .map(|&d| {
                        i32::try_from(d).map_err(|_| {
                            Status::invalid_argument(format!(
                                "Shape output type int32 cannot hold dimension {d}; use int64"
                            ))
                        })
                    })
                    .collect::<StatusResult<Vec<_>>>()?;
                Tensor::from_vec(rank, values)?
            }
        };
        Ok(vec![TensorValue::Host(out)])
    }
}

/// Gathers rows of a variable. Sparse access switches the variable to copy-on-read.
struct ResourceGather;

impl HostKernel for ResourceGather {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_resource_first("ResourceGather", input_types, 2)?;
        if !input_types[1].is_integer() {
            return Err(Status::invalid_argument(format!(
                "ResourceGather indices must be int32 or int64, got {}",
                input_types[1]
            )));
        }
        Ok(vec![attrs.required_dtype("dtype")?])
    }

    fn run(&self, ctx: &HostKernelContext<'_>) -> StatusResult<Vec<TensorValue>> {
        let handle = resource_input("ResourceGather", ctx.inputs, 0)?;
        let dtype = ctx.attrs.required_dtype("dtype")?;
        let var = ctx.context.resource_mgr().lookup_or_create(handle)?;
        if var.dtype() != dtype {
            return Err(Status::invalid_argument(format!(
                "Trying to read variable with wrong dtype. Expected {} got {dtype}",
                var.dtype()
            )));
        }
        var.enable_copy_on_read();
        var.lock_shared();
        let value = var.read_value();
        var.unlock_shared();
        let params = value?
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "Error while reading resource variable {} from Container: {}. This could mean that the variable was uninitialized.",
                    handle.name, handle.container
                ))
            })?
            .to_host()?;

        let indices = host_input("ResourceGather", ctx.inputs, 1)?;
        let indices: Vec<i64> = match indices.dtype() {
            DType::I32 => indices.to_vec::<i32>()?.into_iter().map(i64::from).collect(),
            _ => indices.to_vec::<i64>()?,
        };
        let dims = params.dims();
        let Some((&rows, row_dims)) = dims.split_first() else {
            return Err(Status::invalid_argument("params must be at least 1 dimensional"));
        };
        let row_bytes = row_dims.iter().product::<usize>() * dtype.size_in_bytes();
        let mut bytes = Vec::with_capacity(indices.len() * row_bytes);
        for (i, &index) in indices.iter().enumerate() {
            let row = usize::try_from(index).ok().filter(|&row| row < rows).ok_or_else(|| {
                Status::invalid_argument(format!("indices[{i}] = {index} is not in [0, {rows})"))
            })?;
            bytes.extend_from_slice(&params.bytes()[row * row_bytes..(row + 1) * row_bytes]);
        }
        let mut out_dims = ctx.inputs[1].shape().dims().to_vec();
        out_dims.extend_from_slice(row_dims);
        let gathered = Tensor::from_bytes(dtype, TensorShape::new(out_dims), bytes)?;
        tracing::trace!(op = "ResourceGather", rows = indices.len(), shape = %format_dims(gathered.dims()), "gathered");
        let allocator = ctx.device.local()?.allocator();
        Ok(vec![TensorValue::Device(DeviceTensor::from_host(&gathered, allocator)?)])
    }
}

pub(super) fn register_builtin(registry: &KernelRegistry) {
    registry.register_host("VarHandleOp", Arc::new(VarHandle));
    registry.register_host("VarIsInitializedOp", Arc::new(VarIsInitialized));
    registry.register_host("DestroyResourceOp", Arc::new(DestroyResource));
    registry.register_host("Shape", Arc::new(ShapeOp));
    registry.register_host("ResourceGather", Arc::new(ResourceGather));
}

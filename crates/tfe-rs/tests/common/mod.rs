#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use tfe_rs::tensor::TensorShape;
use tfe_rs::{execute, Context, ContextDevicePlacementPolicy, ContextOptions, Op, Tensor, TensorHandle};

pub const HOST_CPU: &str = "/job:localhost/replica:0/task:0/device:CPU:0";
pub const XLA_CPU: &str = "/job:localhost/replica:0/task:0/device:XLA_CPU:0";

pub fn init() {
    tfe_rs_backend_interpreter::register_interpreter_compiler();
    tfe_rs::logging::init_test_logging();
}

pub fn context() -> Result<Arc<Context>> {
    context_with(ContextOptions::default())
}

pub fn async_context() -> Result<Arc<Context>> {
    context_with(ContextOptions {
        async_mode: Some(true),
        ..ContextOptions::default()
    })
}

pub fn context_with_policy(policy: ContextDevicePlacementPolicy) -> Result<Arc<Context>> {
    context_with(ContextOptions {
        placement_policy: Some(policy),
        ..ContextOptions::default()
    })
}

pub fn context_with(options: ContextOptions) -> Result<Arc<Context>> {
    init();
    Ok(Context::new(options)?)
}

pub fn floats(context: &Context, dims: &[usize], values: &[f32]) -> Result<TensorHandle> {
    let tensor = Tensor::from_vec(TensorShape::new(dims.to_vec()), values.to_vec())?;
    Ok(TensorHandle::from_tensor(context, tensor))
}

pub fn ints(context: &Context, dims: &[usize], values: &[i32]) -> Result<TensorHandle> {
    let tensor = Tensor::from_vec(TensorShape::new(dims.to_vec()), values.to_vec())?;
    Ok(TensorHandle::from_tensor(context, tensor))
}

pub fn matrix(context: &Context) -> Result<TensorHandle> {
    floats(context, &[2, 2], &[1.0, 2.0, 3.0, 4.0])
}

pub fn run(context: &Arc<Context>, name: &str, inputs: &[&TensorHandle]) -> Result<Vec<TensorHandle>> {
    let mut op = Op::new(context, name)?;
    for input in inputs {
        op.add_input(input)?;
    }
    Ok(execute(&op)?)
}

pub fn run_on(
    context: &Arc<Context>,
    name: &str,
    device: &str,
    inputs: &[&TensorHandle],
) -> tfe_rs::StatusResult<Vec<TensorHandle>> {
    let mut op = Op::new(context, name)?;
    op.set_device(device)?;
    for input in inputs {
        op.add_input(input)?;
    }
    execute(&op)
}

pub fn resolve_floats(handle: &TensorHandle) -> Result<Vec<f32>> {
    Ok(handle.resolve()?.to_vec::<f32>()?)
}

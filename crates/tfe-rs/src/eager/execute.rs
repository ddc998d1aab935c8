//! Dispatch of eager ops: placement, output inference and local or remote execution.

use std::sync::Arc;

use crate::device::Device;
use crate::eager::attr::AttrMap;
use crate::eager::context::{Context, ContextDevicePlacementPolicy};
use crate::eager::copy::copy_value;
use crate::eager::executor::EagerNode;
use crate::eager::kernels::{kernel_registry, HostKernelContext, Kernel};
use crate::eager::op::Op;
use crate::eager::remote::{RemoteOpRequest, RemoteTensor};
use crate::eager::tensor_handle::{TensorHandle, TensorValue};
use crate::jit::launch::launch;
use crate::jit::launch_context::{KernelInput, LaunchOutput};
use crate::jit::xla_compiler::XlaGraph;
use crate::status::{Status, StatusResult};
use crate::tensor::DType;

/// Runs `op` and returns its outputs.
///
/// In synchronous mode the call returns once the outputs are defined and reports kernel errors
/// directly. In async mode the op is queued on its device's execution queue and the returned
/// handles are pending; a failure is reported through them instead.
pub fn execute(op: &Op) -> StatusResult<Vec<TensorHandle>> {
    let suffix = format!(" [Op:{}]", op.name());
    let mut node = prepare(op).map_err(|status| status.with_context(&suffix))?;
    let outputs = node.outputs.clone();
    let context = Arc::clone(op.context());

    if context.is_async() {
        let queue = context.queue_for(&node.device)?;
        if let Err(status) = queue.enqueue(Box::new(node)) {
            tracing::debug!(op = op.name(), queue = queue.name(), error = %status, "queue is poisoned, op aborted");
        }
        return Ok(outputs);
    }

    if let Err(status) = node.run() {
        node.abort(&status);
        return Err(status);
    }
    for output in &outputs {
        output
            .wait_defined()
            .map_err(|status| status.with_context(&suffix))?;
    }
    Ok(outputs)
}

fn select_device(op: &Op, context: &Context) -> StatusResult<Arc<Device>> {
    if let Some(name) = op.device() {
        return context.find_device(name);
    }
    let inputs = op.inputs();
    let chosen = inputs
        .iter()
        .find(|input| input.dtype() == DType::Resource)
        .or_else(|| inputs.first())
        .map(|input| Arc::clone(input.device()));
    Ok(chosen.unwrap_or_else(|| context.host_cpu()))
}

fn check_placement(op: &Op, device: &Device, policy: ContextDevicePlacementPolicy) -> StatusResult<()> {
    for (index, input) in op.inputs().iter().enumerate() {
        if input.dtype() == DType::Resource || input.backing_device().same_device(device) {
            continue;
        }
        let copy_allowed = match policy {
            ContextDevicePlacementPolicy::Explicit => false,
            ContextDevicePlacementPolicy::SilentForInt32 => input.dtype() == DType::I32,
            ContextDevicePlacementPolicy::Warn => {
                tracing::warn!(
                    op = op.name(),
                    input = index,
                    from = input.backing_device_name(),
                    to = device.name(),
                    "copying input to the op's device"
                );
                true
            }
            ContextDevicePlacementPolicy::Silent => true,
        };
        if !copy_allowed {
            return Err(Status::invalid_argument(format!(
                "Tensors on conflicting devices: cannot compute {} as input #{index} was expected to be on {} but is actually on {} (operation running on {}). Tensors can be copied explicitly with CopyToDevice, or transparently by using a silent device placement policy.",
                op.name(),
                device.name(),
                input.backing_device_name(),
                device.name()
            )));
        }
    }
    Ok(())
}

fn prepare(op: &Op) -> StatusResult<ExecuteNode> {
    let context = op.context();
    let kernel = op.kernel()?;
    for input in op.inputs() {
        input.device().ensure_live()?;
        input.backing_device().ensure_live()?;
    }
    let device = select_device(op, context)?;
    device.ensure_live()?;
    check_placement(op, &device, context.placement_policy())?;

    let input_types: Vec<DType> = op.inputs().iter().map(TensorHandle::dtype).collect();
    let output_types = kernel.output_types(op.attrs(), &input_types)?;
    let backing = if kernel.outputs_on_host() && device.is_local() {
        context.host_cpu()
    } else {
        Arc::clone(&device)
    };
    let outputs = output_types
        .into_iter()
        .map(|dtype| TensorHandle::pending(context.id(), dtype, Arc::clone(&device), Arc::clone(&backing)))
        .collect();
    tracing::debug!(op = op.name(), device = device.name(), async_mode = context.is_async(), "dispatching op");
    Ok(ExecuteNode {
        context: Arc::clone(context),
        name: op.name().to_string(),
        kernel,
        attrs: op.attrs().clone(),
        device,
        inputs: op.inputs().to_vec(),
        outputs,
    })
}

/// One op bound to its device, inputs and pending outputs.
struct ExecuteNode {
    context: Arc<Context>,
    name: String,
    kernel: Kernel,
    attrs: AttrMap,
    device: Arc<Device>,
    inputs: Vec<TensorHandle>,
    outputs: Vec<TensorHandle>,
}

impl ExecuteNode {
    fn input_values(&self) -> StatusResult<Vec<TensorValue>> {
        self.inputs.iter().map(TensorHandle::wait_value).collect()
    }

    fn run_remote(&self, values: Vec<TensorValue>) -> StatusResult<Vec<TensorValue>> {
        let worker = self
            .device
            .remote_worker()
            .ok_or_else(|| Status::internal(format!("{} is not a remote device", self.device.name())))?;
        let mut remote_inputs = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let remote = match value {
                TensorValue::Remote(remote) if remote.worker().task_name() == worker.task_name() => remote,
                TensorValue::Resource(_) => {
                    return Err(Status::invalid_argument(format!(
                        "input #{index} is a resource handle local to this process and cannot be used on {}",
                        self.device.name()
                    )))
                }
                other => match copy_value(other, &self.device)? {
                    TensorValue::Remote(remote) => remote,
                    _ => return Err(Status::internal("copy to a remote device produced a local value")),
                },
            };
            remote_inputs.push(remote);
        }
        let request = RemoteOpRequest {
            op: self.name.clone(),
            device: self.device.name().to_string(),
            attrs: self.attrs.clone(),
            inputs: remote_inputs.iter().map(|remote| remote.id()).collect(),
        };
        let results = worker.execute(&request)?;
        Ok(results
            .into_iter()
            .map(|info| TensorValue::Remote(Arc::new(RemoteTensor::new(Arc::clone(worker), info, self.device.name()))))
            .collect())
    }

    fn run_compiled(&self, graph: &XlaGraph, values: Vec<TensorValue>) -> StatusResult<Vec<TensorValue>> {
        let mut inputs = Vec::with_capacity(values.len());
        for value in &values {
            inputs.push(match value {
                TensorValue::Resource(handle) => {
                    KernelInput::Resource(self.context.resource_mgr().lookup_or_create(handle)?)
                }
                dense => match copy_value(dense.clone(), &self.device)? {
                    TensorValue::Device(tensor) => KernelInput::Tensor(tensor),
                    _ => return Err(Status::internal("copy to a local device produced a non-device value")),
                },
            });
        }
        let launched = launch(
            &self.device,
            graph,
            &inputs,
            kernel_registry(),
            self.context.compilation_cache(),
        )?;
        launched
            .into_iter()
            .map(|output| match output {
                LaunchOutput::Tensor(tensor) => Ok(TensorValue::Device(tensor)),
                LaunchOutput::Resource(index) => values
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Status::internal(format!("no kernel input {index} to pass through"))),
            })
            .collect()
    }

    fn run_host(&self, values: Vec<TensorValue>) -> StatusResult<Vec<TensorValue>> {
        let Kernel::Host(kernel) = &self.kernel else {
            return Err(Status::internal(format!("{} has no host kernel", self.name)));
        };
        let values = values
            .into_iter()
            .map(|value| match value {
                TensorValue::Remote(remote) => Ok(TensorValue::Host(remote.fetch()?)),
                other => Ok(other),
            })
            .collect::<StatusResult<Vec<_>>>()?;
        kernel.run(&HostKernelContext {
            context: &self.context,
            device: &self.device,
            attrs: &self.attrs,
            inputs: &values,
        })
    }

    fn run_inner(&self) -> StatusResult<()> {
        self.device.ensure_live()?;
        let values = self.input_values()?;
        let results = if !self.device.is_local() {
            self.run_remote(values)?
        } else {
            match &self.kernel {
                Kernel::Xla(_) => {
                    let graph = XlaGraph::single_op(&self.name, &self.attrs, values.len(), self.outputs.len());
                    self.run_compiled(&graph, values)?
                }
                Kernel::Function(body) => self.run_compiled(body.graph(), values)?,
                Kernel::Host(_) => self.run_host(values)?,
            }
        };
        if results.len() != self.outputs.len() {
            return Err(Status::internal(format!(
                "{} produced {} outputs, expected {}",
                self.name,
                results.len(),
                self.outputs.len()
            )));
        }
        for (handle, value) in self.outputs.iter().zip(results) {
            if value.dtype() != handle.dtype() {
                return Err(Status::internal(format!(
                    "{} produced a {} output where {} was inferred",
                    self.name,
                    value.dtype(),
                    handle.dtype()
                )));
            }
            handle.set_value(value);
        }
        Ok(())
    }
}

impl EagerNode for ExecuteNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> StatusResult<()> {
        self.run_inner()
            .map_err(|status| status.with_context(format!(" [Op:{}]", self.name)))
    }

    fn abort(&mut self, status: &Status) {
        for output in &self.outputs {
            output.poison(status.clone());
        }
    }
}

//! Marshalling kernel inputs into executable arguments and results back into tensors and
//! variables.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::LocalDevice;
use crate::jit::variable::Var;
use crate::jit::variable_info::{lock_variables, OptionalTensor, VariableInfo};
use crate::jit::xla_compiler::{ArgumentKind, CompilationResult, OutputKind, XlaCompilerArgument};
use crate::jit::xla_tensor::DeviceTensor;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, Tensor, TensorShape};
use crate::xla::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};

/// A kernel input as seen by the launch path.
#[derive(Debug, Clone)]
pub enum KernelInput {
    Tensor(DeviceTensor),
    Resource(Arc<Var>),
}

impl KernelInput {
    pub fn dtype(&self) -> DType {
        match self {
            KernelInput::Tensor(tensor) => tensor.dtype(),
            KernelInput::Resource(_) => DType::Resource,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LaunchOutput {
    Tensor(DeviceTensor),
    /// Pass-through of the resource handle at this kernel input index.
    Resource(usize),
}

/// Builds executable arguments for one device and turns results back into tensors.
pub struct XlaComputationLaunchContext<'a> {
    device: &'a LocalDevice,
    device_ordinal: usize,
}

impl<'a> XlaComputationLaunchContext<'a> {
    pub fn new(device: &'a LocalDevice, device_ordinal: usize) -> Self {
        XlaComputationLaunchContext {
            device,
            device_ordinal,
        }
    }

    /// Describes each kernel input for the compiler. Resources are described by their
    /// snapshotted value; empty tensors are folded as constants.
    pub fn build_compiler_arguments(
        inputs: &[KernelInput],
        variables: &BTreeMap<usize, OptionalTensor>,
    ) -> StatusResult<Vec<XlaCompilerArgument>> {
        inputs
            .iter()
            .enumerate()
            .map(|(index, input)| match input {
                KernelInput::Tensor(tensor) if tensor.shape().num_elements() == 0 => Ok(XlaCompilerArgument {
                    kind: ArgumentKind::Constant(Tensor::zeros(tensor.dtype(), tensor.shape().clone())?),
                    dtype: tensor.dtype(),
                    shape: tensor.shape().clone(),
                }),
                KernelInput::Tensor(tensor) => Ok(XlaCompilerArgument {
                    kind: ArgumentKind::Parameter,
                    dtype: tensor.dtype(),
                    shape: tensor.shape().clone(),
                }),
                KernelInput::Resource(var) => {
                    let snapshot = variables.get(&index).ok_or_else(|| {
                        Status::internal(format!("no snapshot for resource input {index}"))
                    })?;
                    Ok(match &snapshot.value {
                        Some(value) => XlaCompilerArgument {
                            kind: ArgumentKind::Resource { initialized: true },
                            dtype: value.dtype(),
                            shape: value.shape().clone(),
                        },
                        None => XlaCompilerArgument {
                            kind: ArgumentKind::Resource { initialized: false },
                            dtype: var.dtype(),
                            shape: TensorShape::scalar(),
                        },
                    })
                }
            })
            .collect()
    }

    /// Argument views for the executable, in parameter order.
    ///
    /// The compute stream is ordered after the definition of every argument. The tensors behind
    /// the views must stay alive until the run has been enqueued.
    pub fn populate_inputs(
        &self,
        compiled: &CompilationResult,
        inputs: &[KernelInput],
        variables: &BTreeMap<usize, OptionalTensor>,
    ) -> StatusResult<Vec<ShapedBuffer>> {
        let compute = self.device.compute_stream();
        let mut arguments = Vec::with_capacity(compiled.input_mapping.len());
        for (param, &index) in compiled.input_mapping.iter().enumerate() {
            let tensor = match inputs.get(index) {
                Some(KernelInput::Tensor(tensor)) => tensor,
                Some(KernelInput::Resource(_)) => variables
                    .get(&index)
                    .and_then(|snapshot| snapshot.value.as_ref())
                    .ok_or_else(|| {
                        Status::internal(format!("parameter {param} maps to uninitialized variable {index}"))
                    })?,
                None => {
                    return Err(Status::internal(format!(
                        "parameter {param} maps to missing input {index}"
                    )))
                }
            };
            if let Some(event) = tensor.definition_event().get() {
                compute.wait_for_event(&event);
            }
            arguments.push(tensor.shaped_buffer(self.device_ordinal)?);
        }
        Ok(arguments)
    }

    /// Splits the executable's result into kernel outputs and writes variable updates back.
    pub fn populate_outputs(
        &self,
        compiled: &CompilationResult,
        result: ScopedShapedBuffer,
        inputs: &[KernelInput],
    ) -> StatusResult<Vec<LaunchOutput>> {
        let compute = self.device.compute_stream();
        let mut result = result.into_tuple();
        let definition_event = compute.record_event();

        let mut outputs = Vec::with_capacity(compiled.outputs.len());
        for description in &compiled.outputs {
            let output = match &description.kind {
                OutputKind::Computed { tuple_index } => {
                    let memory = result.take_sub_tree(&[*tuple_index])?.into_array_memory()?;
                    LaunchOutput::Tensor(DeviceTensor::defined_by(
                        description.dtype,
                        description.shape.clone(),
                        memory,
                        definition_event.clone(),
                    )?)
                }
                OutputKind::Constant(value) => LaunchOutput::Tensor(self.materialize_constant(value)?),
                OutputKind::Resource { input_index } => LaunchOutput::Resource(*input_index),
            };
            outputs.push(output);
        }

        if compiled.resource_updates.is_empty() {
            return Ok(outputs);
        }
        let mut variables = compiled
            .resource_updates
            .iter()
            .map(|update| match inputs.get(update.input_index) {
                Some(KernelInput::Resource(var)) => Ok(VariableInfo::new(update.input_index, Some(Arc::clone(var)))),
                _ => Err(Status::internal("Invalid input index for variable write.")),
            })
            .collect::<StatusResult<Vec<_>>>()?;
        lock_variables(&mut variables)?;
        for (update, info) in compiled.resource_updates.iter().zip(&variables) {
            let var = info
                .var()
                .ok_or_else(|| Status::internal("Invalid input index for variable write."))?;
            if var.dtype() != update.dtype {
                return Err(Status::internal("Mismatched type in variable write"));
            }
            let memory = result.take_sub_tree(&[update.tuple_index])?.into_array_memory()?;
            info.write(DeviceTensor::defined_by(
                update.dtype,
                update.shape.clone(),
                memory,
                definition_event.clone(),
            )?)?;
        }
        Ok(outputs)
    }

    /// Copies a compile-time constant to the device on the host-to-device stream. With a
    /// separate transfer stream the compute stream waits for the copy.
    fn materialize_constant(&self, value: &Tensor) -> StatusResult<DeviceTensor> {
        let memory = self.device.allocator().allocate(value.byte_size())?;
        let transfer = self.device.host_to_device_stream();
        let target = memory.clone();
        let bytes = value.shared_bytes();
        transfer.enqueue_fn(move || target.write(bytes));
        let compute = self.device.compute_stream();
        if self.device.use_multiple_streams() {
            compute.wait_for(transfer);
        }
        DeviceTensor::defined_by(value.dtype(), value.shape().clone(), memory, compute.record_event())
    }
}

//! Lowering of eager ops and function bodies into HLO modules.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::eager::attr::AttrMap;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, Tensor, TensorShape};
use crate::xla::hlo::{HloComputationBuilder, HloModule, InstructionId};
use crate::xla::literal::Literal;
use crate::xla::shape::{Layout, Shape};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgumentKind {
    /// Passed to the computation as a runtime parameter.
    Parameter,
    /// Folded into the computation; never transferred.
    Constant(Tensor),
    /// A resource variable; its value is a parameter only when initialized.
    Resource { initialized: bool },
}

/// Compile-time description of one kernel input.
///
/// For resources `dtype` and `shape` describe the variable's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XlaCompilerArgument {
    pub kind: ArgumentKind,
    pub dtype: DType,
    pub shape: TensorShape,
}

impl XlaCompilerArgument {
    pub fn is_resource(&self) -> bool {
        matches!(self.kind, ArgumentKind::Resource { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeInput {
    Arg(usize),
    Node { node: usize, output: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XlaNode {
    pub op: String,
    pub attrs: AttrMap,
    pub inputs: Vec<NodeInput>,
}

/// A dataflow graph of ops to be compiled into one computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XlaGraph {
    pub name: String,
    pub nodes: Vec<XlaNode>,
    pub outputs: Vec<NodeInput>,
}

impl XlaGraph {
    /// Graph of a single op whose inputs are the graph arguments, in order.
    pub fn single_op(op: &str, attrs: &AttrMap, num_inputs: usize, num_outputs: usize) -> Self {
        XlaGraph {
            name: op.to_string(),
            nodes: vec![XlaNode {
                op: op.to_string(),
                attrs: attrs.clone(),
                inputs: (0..num_inputs).map(NodeInput::Arg).collect(),
            }],
            outputs: (0..num_outputs)
                .map(|output| NodeInput::Node { node: 0, output })
                .collect(),
        }
    }
}

/// Lowers one op into HLO instructions.
pub trait XlaOpKernel: Send + Sync {
    /// Output types from attributes and input types alone, without lowering.
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>>;

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()>;
}

pub trait XlaKernelLookup {
    fn xla_kernel(&self, op: &str) -> Option<Arc<dyn XlaOpKernel>>;
}

#[derive(Debug, Clone)]
enum XlaExpression {
    Value(InstructionId),
    Constant(Tensor),
    Resource(usize),
}

#[derive(Debug)]
struct ResourceState {
    dtype: DType,
    current: Option<InstructionId>,
    modified: bool,
}

pub struct XlaOpContext<'a> {
    op: &'a str,
    attrs: &'a AttrMap,
    builder: &'a mut HloComputationBuilder,
    resources: &'a mut BTreeMap<usize, ResourceState>,
    inputs: Vec<XlaExpression>,
    outputs: Vec<Option<XlaExpression>>,
}

impl<'a> XlaOpContext<'a> {
    pub fn op_name(&self) -> &str {
        self.op
    }

    pub fn attrs(&self) -> &AttrMap {
        self.attrs
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn builder(&mut self) -> &mut HloComputationBuilder {
        self.builder
    }

    fn expression(&self, index: usize) -> StatusResult<&XlaExpression> {
        self.inputs.get(index).ok_or_else(|| {
            Status::invalid_argument(format!("{} has no input {index}", self.op))
        })
    }

    pub fn input_type(&self, index: usize) -> StatusResult<DType> {
        match self.expression(index)? {
            XlaExpression::Value(id) => self
                .builder
                .shape_of(*id)?
                .element_type()
                .ok_or_else(|| Status::internal(format!("input {index} of {} is a tuple", self.op))),
            XlaExpression::Constant(tensor) => Ok(tensor.dtype()),
            XlaExpression::Resource(_) => Ok(DType::Resource),
        }
    }

    pub fn input_shape(&self, index: usize) -> StatusResult<TensorShape> {
        match self.expression(index)? {
            XlaExpression::Value(id) => self.builder.shape_of(*id)?.tensor_shape(),
            XlaExpression::Constant(tensor) => Ok(tensor.shape().clone()),
            XlaExpression::Resource(_) => Ok(TensorShape::scalar()),
        }
    }

    /// The value of a dense input, materializing compile-time constants.
    pub fn input(&mut self, index: usize) -> StatusResult<InstructionId> {
        match self.expression(index)?.clone() {
            XlaExpression::Value(id) => Ok(id),
            XlaExpression::Constant(tensor) => Ok(self.builder.constant(Literal::Array(tensor))),
            XlaExpression::Resource(_) => Err(Status::invalid_argument(format!(
                "input {index} of {} is a resource handle, expected a tensor",
                self.op
            ))),
        }
    }

    pub fn constant_input(&self, index: usize) -> Option<&Tensor> {
        match self.inputs.get(index) {
            Some(XlaExpression::Constant(tensor)) => Some(tensor),
            _ => None,
        }
    }

    fn resource_argument(&self, index: usize) -> StatusResult<usize> {
        match self.expression(index)? {
            XlaExpression::Resource(arg) => Ok(*arg),
            _ => Err(Status::invalid_argument(format!(
                "input {index} of {} must be a resource handle",
                self.op
            ))),
        }
    }

    pub fn read_variable(&mut self, index: usize, dtype: DType) -> StatusResult<InstructionId> {
        let arg = self.resource_argument(index)?;
        let state = self
            .resources
            .get(&arg)
            .ok_or_else(|| Status::internal(format!("argument {arg} is not a resource")))?;
        if state.dtype != dtype {
            return Err(Status::invalid_argument(format!(
                "Trying to read variable with wrong dtype. Expected {} got {dtype}",
                state.dtype
            )));
        }
        state.current.ok_or_else(|| {
            Status::failed_precondition(format!(
                "Read of uninitialized variable passed as input {arg}"
            ))
        })
    }

    pub fn assign_variable(&mut self, index: usize, value: InstructionId) -> StatusResult<()> {
        let arg = self.resource_argument(index)?;
        let value_type = self.builder.shape_of(value)?.element_type();
        let state = self
            .resources
            .get_mut(&arg)
            .ok_or_else(|| Status::internal(format!("argument {arg} is not a resource")))?;
        if value_type != Some(state.dtype) {
            return Err(Status::invalid_argument(format!(
                "Trying to assign variable with wrong dtype. Expected {} got {}",
                state.dtype,
                value_type.map_or_else(|| "tuple".to_string(), |t| t.to_string())
            )));
        }
        state.current = Some(value);
        state.modified = true;
        Ok(())
    }

    fn output_slot(&mut self, index: usize) -> StatusResult<&mut Option<XlaExpression>> {
        let op = self.op;
        self.outputs
            .get_mut(index)
            .ok_or_else(|| Status::internal(format!("{op} has no output {index}")))
    }

    pub fn set_output(&mut self, index: usize, value: InstructionId) -> StatusResult<()> {
        *self.output_slot(index)? = Some(XlaExpression::Value(value));
        Ok(())
    }

    pub fn set_constant_output(&mut self, index: usize, value: Tensor) -> StatusResult<()> {
        *self.output_slot(index)? = Some(XlaExpression::Constant(value));
        Ok(())
    }

    /// Passes an input through unchanged, whatever kind of value it is.
    pub fn forward_input(&mut self, input: usize, output: usize) -> StatusResult<()> {
        let expression = self.expression(input)?.clone();
        *self.output_slot(output)? = Some(expression);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    /// Element `tuple_index` of the computation's result tuple.
    Computed { tuple_index: usize },
    /// Known at compile time; materialized on the device after the run.
    Constant(Tensor),
    /// The resource handle passed as kernel input `input_index`.
    Resource { input_index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDescription {
    pub dtype: DType,
    pub shape: TensorShape,
    pub kind: OutputKind,
}

/// A variable the computation writes; the new value is element `tuple_index` of the result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub input_index: usize,
    pub dtype: DType,
    pub shape: TensorShape,
    pub tuple_index: usize,
}

#[derive(Debug, Clone)]
pub struct CompilationResult {
    /// Kernel input index for each computation parameter.
    pub input_mapping: Vec<usize>,
    pub xla_input_shapes: Vec<Shape>,
    pub outputs: Vec<OutputDescription>,
    pub resource_updates: Vec<ResourceUpdate>,
    pub xla_output_shape: Shape,
    pub module: HloModule,
}

fn parameter_shape(dtype: DType, shape: &TensorShape) -> Shape {
    Shape::array_with_layout(dtype, shape.dims().to_vec(), Layout::descending(shape.rank()))
}

fn resolve_input(
    input: &NodeInput,
    args: &[XlaExpression],
    nodes: &[Vec<XlaExpression>],
) -> StatusResult<XlaExpression> {
    match *input {
        NodeInput::Arg(index) => args
            .get(index)
            .cloned()
            .ok_or_else(|| Status::invalid_argument(format!("graph has no argument {index}"))),
        NodeInput::Node { node, output } => nodes
            .get(node)
            .and_then(|outputs| outputs.get(output))
            .cloned()
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "input refers to output {output} of node {node}, which is not available"
                ))
            }),
    }
}

fn expression_type(builder: &HloComputationBuilder, expression: &XlaExpression) -> StatusResult<DType> {
    match expression {
        XlaExpression::Value(id) => builder
            .shape_of(*id)?
            .element_type()
            .ok_or_else(|| Status::internal("tuple-shaped value flowing between ops")),
        XlaExpression::Constant(tensor) => Ok(tensor.dtype()),
        XlaExpression::Resource(_) => Ok(DType::Resource),
    }
}

/// Lowers `graph` into a module whose root is a tuple of the computed outputs followed by the
/// new values of every variable the graph assigns.
pub fn compile_graph(
    graph: &XlaGraph,
    args: &[XlaCompilerArgument],
    kernels: &dyn XlaKernelLookup,
) -> StatusResult<CompilationResult> {
    let mut builder = HloComputationBuilder::new(graph.name.clone());
    let mut input_mapping = Vec::new();
    let mut xla_input_shapes = Vec::new();
    let mut arg_expressions = Vec::with_capacity(args.len());
    let mut resources = BTreeMap::new();

    for (index, arg) in args.iter().enumerate() {
        match &arg.kind {
            ArgumentKind::Constant(tensor) => arg_expressions.push(XlaExpression::Constant(tensor.clone())),
            ArgumentKind::Parameter => {
                let shape = parameter_shape(arg.dtype, &arg.shape);
                let param = builder.parameter(input_mapping.len(), shape.clone());
                input_mapping.push(index);
                xla_input_shapes.push(shape);
                arg_expressions.push(XlaExpression::Value(param));
            }
            ArgumentKind::Resource { initialized } => {
                let current = if *initialized {
                    let shape = parameter_shape(arg.dtype, &arg.shape);
                    let param = builder.parameter(input_mapping.len(), shape.clone());
                    input_mapping.push(index);
                    xla_input_shapes.push(shape);
                    Some(param)
                } else {
                    None
                };
                resources.insert(
                    index,
                    ResourceState {
                        dtype: arg.dtype,
                        current,
                        modified: false,
                    },
                );
                arg_expressions.push(XlaExpression::Resource(index));
            }
        }
    }

    let mut node_outputs: Vec<Vec<XlaExpression>> = Vec::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        let kernel = kernels.xla_kernel(&node.op).ok_or_else(|| {
            Status::not_found(format!("No registered '{}' OpKernel for XLA devices", node.op))
        })?;
        let inputs = node
            .inputs
            .iter()
            .map(|input| resolve_input(input, &arg_expressions, &node_outputs))
            .collect::<StatusResult<Vec<_>>>()?;
        let input_types = inputs
            .iter()
            .map(|expression| expression_type(&builder, expression))
            .collect::<StatusResult<Vec<_>>>()?;
        let num_outputs = kernel.output_types(&node.attrs, &input_types)?.len();

        let mut ctx = XlaOpContext {
            op: &node.op,
            attrs: &node.attrs,
            builder: &mut builder,
            resources: &mut resources,
            inputs,
            outputs: vec![None; num_outputs],
        };
        kernel.compile(&mut ctx)?;
        let outputs = ctx
            .outputs
            .into_iter()
            .enumerate()
            .map(|(index, output)| {
                output.ok_or_else(|| Status::internal(format!("{} did not set output {index}", node.op)))
            })
            .collect::<StatusResult<Vec<_>>>()?;
        node_outputs.push(outputs);
    }

    let mut computed = Vec::new();
    let mut outputs = Vec::with_capacity(graph.outputs.len());
    for output in &graph.outputs {
        let description = match resolve_input(output, &arg_expressions, &node_outputs)? {
            XlaExpression::Value(id) => {
                let shape = builder.shape_of(id)?;
                let description = OutputDescription {
                    dtype: expression_type(&builder, &XlaExpression::Value(id))?,
                    shape: shape.tensor_shape()?,
                    kind: OutputKind::Computed {
                        tuple_index: computed.len(),
                    },
                };
                computed.push(id);
                description
            }
            XlaExpression::Constant(tensor) => OutputDescription {
                dtype: tensor.dtype(),
                shape: tensor.shape().clone(),
                kind: OutputKind::Constant(tensor),
            },
            XlaExpression::Resource(input_index) => OutputDescription {
                dtype: DType::Resource,
                shape: TensorShape::scalar(),
                kind: OutputKind::Resource { input_index },
            },
        };
        outputs.push(description);
    }

    let mut resource_updates = Vec::new();
    for (&input_index, state) in &resources {
        let Some(value) = state.current.filter(|_| state.modified) else {
            continue;
        };
        resource_updates.push(ResourceUpdate {
            input_index,
            dtype: state.dtype,
            shape: builder.shape_of(value)?.tensor_shape()?,
            tuple_index: computed.len(),
        });
        computed.push(value);
    }

    let root = builder.tuple(computed)?;
    let entry = builder.build(root)?;
    let xla_output_shape = entry.root_instruction()?.shape.clone();
    tracing::trace!(
        graph = %graph.name,
        parameters = input_mapping.len(),
        outputs = outputs.len(),
        updates = resource_updates.len(),
        "lowered graph"
    );
    Ok(CompilationResult {
        input_mapping,
        xla_input_shapes,
        outputs,
        resource_updates,
        xla_output_shape,
        module: HloModule::new(graph.name.clone(), entry),
    })
}

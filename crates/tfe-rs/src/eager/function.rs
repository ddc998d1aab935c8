//! Function definitions that can be invoked by name like primitive ops.
//!
//! A function body is lowered as a whole into one compiled computation, so every node must be
//! an op with an XLA lowering.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::eager::attr::AttrMap;
use crate::eager::context::Context;
use crate::eager::kernels::{kernel_registry, Kernel};
use crate::jit::xla_compiler::{NodeInput, XlaGraph, XlaNode};
use crate::status::{Status, StatusResult};
use crate::tensor::DType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDef {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    #[serde(default)]
    pub input_arg: Vec<ArgDef>,
    #[serde(default)]
    pub output_arg: Vec<ArgDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    /// `arg`, `node`, `node:index` or `node:output:index`; `^node` marks a control input.
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub attr: AttrMap,
    #[serde(default)]
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub signature: Signature,
    #[serde(default)]
    pub node_def: Vec<NodeDef>,
    /// Output argument name to the node output producing it.
    #[serde(default)]
    pub ret: BTreeMap<String, String>,
}

impl FunctionDef {
    pub fn from_json_slice(bytes: &[u8]) -> StatusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_string(&self) -> StatusResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Arg(usize),
    Node { node: usize, output: usize },
}

fn parse_input(
    function: &str,
    reference: &str,
    args: &HashMap<&str, usize>,
    nodes: &HashMap<&str, usize>,
) -> StatusResult<Source> {
    let malformed = || Status::invalid_argument(format!("Malformed input '{reference}' in function {function}"));
    let mut parts = reference.split(':');
    let head = parts.next().ok_or_else(malformed)?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        if let Some(&arg) = args.get(head) {
            return Ok(Source::Arg(arg));
        }
    }
    let &node = nodes.get(head).ok_or_else(|| {
        Status::invalid_argument(format!("Input '{reference}' of function {function} refers to an unknown node"))
    })?;
    let output = match rest.as_slice() {
        [] => 0,
        [index] | [_, index] => index.parse().map_err(|_| malformed())?,
        _ => return Err(malformed()),
    };
    Ok(Source::Node { node, output })
}

/// A validated, lowered function.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    def: FunctionDef,
    graph: XlaGraph,
    input_types: Vec<DType>,
    output_types: Vec<DType>,
}

impl FunctionBody {
    /// Orders the nodes topologically, infers types and builds the lowered graph.
    pub fn instantiate(def: FunctionDef, context: &Context) -> StatusResult<Self> {
        let function = def.signature.name.as_str();
        let mut args = HashMap::new();
        for (index, arg) in def.signature.input_arg.iter().enumerate() {
            if args.insert(arg.name.as_str(), index).is_some() {
                return Err(Status::invalid_argument(format!(
                    "Duplicate input argument '{}' in function {function}",
                    arg.name
                )));
            }
        }
        let mut names = HashMap::new();
        for (index, node) in def.node_def.iter().enumerate() {
            if args.contains_key(node.name.as_str()) || names.insert(node.name.as_str(), index).is_some() {
                return Err(Status::invalid_argument(format!(
                    "Duplicate node name '{}' in function {function}",
                    node.name
                )));
            }
        }

        let mut sources = Vec::with_capacity(def.node_def.len());
        let mut dependents = vec![Vec::new(); def.node_def.len()];
        let mut pending = vec![0usize; def.node_def.len()];
        for (index, node) in def.node_def.iter().enumerate() {
            let mut node_sources = Vec::new();
            for reference in &node.input {
                if let Some(control) = reference.strip_prefix('^') {
                    if !names.contains_key(control) {
                        return Err(Status::invalid_argument(format!(
                            "Control input '{reference}' of function {function} refers to an unknown node"
                        )));
                    }
                    continue;
                }
                let source = parse_input(function, reference, &args, &names)?;
                if let Source::Node { node: producer, .. } = source {
                    dependents[producer].push(index);
                    pending[index] += 1;
                }
                node_sources.push(source);
            }
            sources.push(node_sources);
        }

        let mut ready: VecDeque<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(pending.len());
        while let Some(index) = ready.pop_front() {
            order.push(index);
            for &dependent in &dependents[index] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        if order.len() != def.node_def.len() {
            return Err(Status::invalid_argument(format!("Function {function} contains a cycle")));
        }

        let input_types: Vec<DType> = def.signature.input_arg.iter().map(|arg| arg.dtype).collect();
        let mut position = vec![0usize; def.node_def.len()];
        let mut node_types: Vec<Vec<DType>> = vec![Vec::new(); def.node_def.len()];
        let mut nodes = Vec::with_capacity(order.len());
        let resolve = |source: Source, position: &[usize], node_types: &[Vec<DType>]| -> StatusResult<(NodeInput, DType)> {
            match source {
                Source::Arg(index) => Ok((NodeInput::Arg(index), input_types[index])),
                Source::Node { node, output } => {
                    let dtype = node_types[node].get(output).copied().ok_or_else(|| {
                        Status::invalid_argument(format!(
                            "Node '{}' of function {function} has no output {output}",
                            def.node_def[node].name
                        ))
                    })?;
                    Ok((
                        NodeInput::Node {
                            node: position[node],
                            output,
                        },
                        dtype,
                    ))
                }
            }
        };
        for &index in &order {
            let node = &def.node_def[index];
            let kernel = match kernel_registry().kernel(&node.op) {
                Some(Kernel::Xla(kernel)) => kernel,
                Some(_) => {
                    return Err(Status::unimplemented(format!(
                        "Op {} runs on the host and cannot be used inside function {function}",
                        node.op
                    )))
                }
                None if context.function(&node.op).is_some() => {
                    return Err(Status::unimplemented(format!(
                        "Function {function} calls function {}; nested function calls are not supported",
                        node.op
                    )))
                }
                None => {
                    return Err(Status::not_found(format!(
                        "Op type not registered '{}' in function {function}",
                        node.op
                    )))
                }
            };
            let mut inputs = Vec::with_capacity(sources[index].len());
            let mut types = Vec::with_capacity(sources[index].len());
            for &source in &sources[index] {
                let (input, dtype) = resolve(source, &position, &node_types)?;
                inputs.push(input);
                types.push(dtype);
            }
            node_types[index] = kernel
                .output_types(&node.attr, &types)
                .map_err(|status| status.with_context(format!(" (node {} in function {function})", node.name)))?;
            position[index] = nodes.len();
            nodes.push(XlaNode {
                op: node.op.clone(),
                attrs: node.attr.clone(),
                inputs,
            });
        }

        let mut outputs = Vec::with_capacity(def.signature.output_arg.len());
        let mut output_types = Vec::with_capacity(def.signature.output_arg.len());
        for arg in &def.signature.output_arg {
            let reference = def.ret.get(&arg.name).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "Return value {} missing from function {function}",
                    arg.name
                ))
            })?;
            let (output, dtype) = resolve(parse_input(function, reference, &args, &names)?, &position, &node_types)?;
            if dtype != arg.dtype {
                return Err(Status::invalid_argument(format!(
                    "Return value {} of function {function} has type {dtype} but the signature declares {}",
                    arg.name, arg.dtype
                )));
            }
            outputs.push(output);
            output_types.push(dtype);
        }

        let graph = XlaGraph {
            name: function.to_string(),
            nodes,
            outputs,
        };
        Ok(FunctionBody {
            def,
            graph,
            input_types,
            output_types,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.signature.name
    }

    pub fn def(&self) -> &FunctionDef {
        &self.def
    }

    pub fn graph(&self) -> &XlaGraph {
        &self.graph
    }

    pub fn input_types(&self) -> &[DType] {
        &self.input_types
    }

    pub fn output_types(&self) -> &[DType] {
        &self.output_types
    }

    pub fn check_input_types(&self, types: &[DType]) -> StatusResult<()> {
        if types.len() != self.input_types.len() {
            return Err(Status::invalid_argument(format!(
                "Function {} expects {} inputs, got {}",
                self.name(),
                self.input_types.len(),
                types.len()
            )));
        }
        for (index, (&expected, &actual)) in self.input_types.iter().zip(types).enumerate() {
            if expected != actual {
                return Err(Status::invalid_argument(format!(
                    "Expected input #{index} of {} to be {expected} but got {actual}",
                    self.name()
                )));
            }
        }
        Ok(())
    }
}

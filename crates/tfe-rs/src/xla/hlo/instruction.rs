use std::fmt;

use serde::{Deserialize, Serialize};

use crate::xla::literal::Literal;
use crate::xla::shape::Shape;

/// Identifier of an instruction, unique within its computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionId(pub u32);

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HloOpcode {
    Parameter { number: usize },
    Constant { literal: Literal },
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Negate,
    Abs,
    Exp,
    Tanh,
    /// Element type conversion to the instruction's output element type.
    Convert,
    /// Rank-2 contraction over one dimension of each operand.
    Dot {
        lhs_contracting: usize,
        rhs_contracting: usize,
    },
    Transpose { permutation: Vec<usize> },
    Reshape,
    /// `dimensions[i]` is the output dimension operand dimension `i` maps to.
    Broadcast { dimensions: Vec<usize> },
    Tuple,
    GetTupleElement { index: usize },
    Call { computation: String },
    CustomCall { target: String, has_side_effect: bool },
}

impl HloOpcode {
    pub fn name(&self) -> &'static str {
        match self {
            HloOpcode::Parameter { .. } => "parameter",
            HloOpcode::Constant { .. } => "constant",
            HloOpcode::Add => "add",
            HloOpcode::Subtract => "subtract",
            HloOpcode::Multiply => "multiply",
            HloOpcode::Divide => "divide",
            HloOpcode::Maximum => "maximum",
            HloOpcode::Minimum => "minimum",
            HloOpcode::Negate => "negate",
            HloOpcode::Abs => "abs",
            HloOpcode::Exp => "exponential",
            HloOpcode::Tanh => "tanh",
            HloOpcode::Convert => "convert",
            HloOpcode::Dot { .. } => "dot",
            HloOpcode::Transpose { .. } => "transpose",
            HloOpcode::Reshape => "reshape",
            HloOpcode::Broadcast { .. } => "broadcast",
            HloOpcode::Tuple => "tuple",
            HloOpcode::GetTupleElement { .. } => "get-tuple-element",
            HloOpcode::Call { .. } => "call",
            HloOpcode::CustomCall { .. } => "custom-call",
        }
    }

    pub fn is_elementwise_binary(&self) -> bool {
        matches!(
            self,
            HloOpcode::Add
                | HloOpcode::Subtract
                | HloOpcode::Multiply
                | HloOpcode::Divide
                | HloOpcode::Maximum
                | HloOpcode::Minimum
        )
    }

    pub fn is_elementwise_unary(&self) -> bool {
        matches!(
            self,
            HloOpcode::Negate | HloOpcode::Abs | HloOpcode::Exp | HloOpcode::Tanh
        )
    }

    /// Side effects of this opcode alone, not of any computation it calls.
    pub fn has_side_effect_no_recurse(&self) -> bool {
        matches!(
            self,
            HloOpcode::CustomCall {
                has_side_effect: true,
                ..
            }
        )
    }

    pub fn called_computation(&self) -> Option<&str> {
        match self {
            HloOpcode::Call { computation } => Some(computation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HloInstruction {
    pub id: InstructionId,
    pub name: String,
    pub opcode: HloOpcode,
    pub operands: Vec<InstructionId>,
    pub shape: Shape,
}

impl HloInstruction {
    pub fn parameter_number(&self) -> Option<usize> {
        match self.opcode {
            HloOpcode::Parameter { number } => Some(number),
            _ => None,
        }
    }

    pub fn is_parameter(&self) -> bool {
        self.parameter_number().is_some()
    }

    fn attributes_text(&self) -> String {
        match &self.opcode {
            HloOpcode::Dot {
                lhs_contracting,
                rhs_contracting,
            } => format!(
                ", lhs_contracting_dims={{{lhs_contracting}}}, rhs_contracting_dims={{{rhs_contracting}}}"
            ),
            HloOpcode::Transpose { permutation } => format!(", dimensions={permutation:?}"),
            HloOpcode::Broadcast { dimensions } => format!(", dimensions={dimensions:?}"),
            HloOpcode::GetTupleElement { index } => format!(", index={index}"),
            HloOpcode::Call { computation } => format!(", to_apply={computation}"),
            HloOpcode::CustomCall {
                target,
                has_side_effect,
            } => format!(", custom_call_target=\"{target}\", custom_call_has_side_effect={has_side_effect}"),
            _ => String::new(),
        }
    }

    /// One line of module text, without the `ROOT` marker.
    pub fn to_text(&self, operand_names: &[&str]) -> String {
        let arguments = match &self.opcode {
            HloOpcode::Parameter { number } => number.to_string(),
            HloOpcode::Constant { literal } => match literal.as_tensor() {
                Ok(tensor) if tensor.num_elements() <= 8 => format!("{} bytes {:?}", tensor.byte_size(), tensor.bytes()),
                _ => "{...}".to_string(),
            },
            _ => operand_names
                .iter()
                .map(|name| format!("%{name}"))
                .collect::<Vec<_>>()
                .join(", "),
        };
        format!(
            "%{} = {} {}({}){}",
            self.name,
            self.shape,
            self.opcode.name(),
            arguments,
            self.attributes_text()
        )
    }
}

//! Incremental construction of computations with shape inference.

use super::computation::HloComputation;
use super::instruction::{HloInstruction, HloOpcode, InstructionId};
use crate::status::{Status, StatusResult};
use crate::tensor::DType;
use crate::xla::literal::Literal;
use crate::xla::shape::Shape;

pub struct HloComputationBuilder {
    name: String,
    instructions: Vec<HloInstruction>,
    next_id: u32,
}

impl HloComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        HloComputationBuilder {
            name: name.into(),
            instructions: Vec::new(),
            next_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, opcode: HloOpcode, operands: Vec<InstructionId>, shape: Shape) -> InstructionId {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        let name = format!("{}.{}", opcode.name(), id.0);
        self.instructions.push(HloInstruction {
            id,
            name,
            opcode,
            operands,
            shape,
        });
        id
    }

    pub fn shape_of(&self, id: InstructionId) -> StatusResult<&Shape> {
        self.instructions
            .iter()
            .find(|inst| inst.id == id)
            .map(|inst| &inst.shape)
            .ok_or_else(|| Status::internal(format!("unknown operand {id} in {}", self.name)))
    }

    fn array_operand(&self, id: InstructionId, op: &str) -> StatusResult<(DType, Vec<usize>)> {
        match self.shape_of(id)? {
            Shape::Array {
                element_type, dims, ..
            } => Ok((*element_type, dims.clone())),
            other => Err(Status::invalid_argument(format!(
                "{op} expects an array operand, got {other}"
            ))),
        }
    }

    pub fn parameter(&mut self, number: usize, shape: Shape) -> InstructionId {
        self.push(HloOpcode::Parameter { number }, Vec::new(), shape)
    }

    pub fn constant(&mut self, literal: Literal) -> InstructionId {
        let shape = literal.shape().without_layout();
        self.push(HloOpcode::Constant { literal }, Vec::new(), shape)
    }

    pub fn binary(&mut self, opcode: HloOpcode, lhs: InstructionId, rhs: InstructionId) -> StatusResult<InstructionId> {
        if !opcode.is_elementwise_binary() {
            return Err(Status::internal(format!("{} is not a binary op", opcode.name())));
        }
        let (lt, ld) = self.array_operand(lhs, opcode.name())?;
        let (rt, rd) = self.array_operand(rhs, opcode.name())?;
        if lt != rt {
            return Err(Status::invalid_argument(format!(
                "{}: operand types differ ({} vs {})",
                opcode.name(),
                lt,
                rt
            )));
        }
        if ld != rd {
            return Err(Status::invalid_argument(format!(
                "{}: operand shapes differ ({:?} vs {:?})",
                opcode.name(),
                ld,
                rd
            )));
        }
        Ok(self.push(opcode, vec![lhs, rhs], Shape::array(lt, ld)))
    }

    pub fn unary(&mut self, opcode: HloOpcode, operand: InstructionId) -> StatusResult<InstructionId> {
        if !opcode.is_elementwise_unary() {
            return Err(Status::internal(format!("{} is not a unary op", opcode.name())));
        }
        let (ty, dims) = self.array_operand(operand, opcode.name())?;
        if matches!(opcode, HloOpcode::Exp | HloOpcode::Tanh) && !ty.is_floating() {
            return Err(Status::invalid_argument(format!(
                "{} requires a floating point operand, got {ty}",
                opcode.name()
            )));
        }
        Ok(self.push(opcode, vec![operand], Shape::array(ty, dims)))
    }

    pub fn convert(&mut self, operand: InstructionId, to: DType) -> StatusResult<InstructionId> {
        let (_, dims) = self.array_operand(operand, "convert")?;
        Ok(self.push(HloOpcode::Convert, vec![operand], Shape::array(to, dims)))
    }

    pub fn dot(
        &mut self,
        lhs: InstructionId,
        rhs: InstructionId,
        lhs_contracting: usize,
        rhs_contracting: usize,
    ) -> StatusResult<InstructionId> {
        let (lt, ld) = self.array_operand(lhs, "dot")?;
        let (rt, rd) = self.array_operand(rhs, "dot")?;
        if lt != rt {
            return Err(Status::invalid_argument(format!(
                "dot: operand types differ ({lt} vs {rt})"
            )));
        }
        if ld.len() != 2 || rd.len() != 2 || lhs_contracting > 1 || rhs_contracting > 1 {
            return Err(Status::unimplemented(format!(
                "dot only supports rank-2 operands, got {ld:?} and {rd:?}"
            )));
        }
        if ld[lhs_contracting] != rd[rhs_contracting] {
            return Err(Status::invalid_argument(format!(
                "dot: contracting dimensions differ ({} vs {})",
                ld[lhs_contracting], rd[rhs_contracting]
            )));
        }
        let dims = vec![ld[1 - lhs_contracting], rd[1 - rhs_contracting]];
        Ok(self.push(
            HloOpcode::Dot {
                lhs_contracting,
                rhs_contracting,
            },
            vec![lhs, rhs],
            Shape::array(lt, dims),
        ))
    }

    pub fn transpose(&mut self, operand: InstructionId, permutation: Vec<usize>) -> StatusResult<InstructionId> {
        let (ty, dims) = self.array_operand(operand, "transpose")?;
        let mut sorted = permutation.clone();
        sorted.sort_unstable();
        if sorted != (0..dims.len()).collect::<Vec<_>>() {
            return Err(Status::invalid_argument(format!(
                "transpose: {permutation:?} is not a permutation of rank {}",
                dims.len()
            )));
        }
        let out: Vec<usize> = permutation.iter().map(|&p| dims[p]).collect();
        Ok(self.push(HloOpcode::Transpose { permutation }, vec![operand], Shape::array(ty, out)))
    }

    pub fn reshape(&mut self, operand: InstructionId, dims: Vec<usize>) -> StatusResult<InstructionId> {
        let (ty, current) = self.array_operand(operand, "reshape")?;
        if current.iter().product::<usize>() != dims.iter().product::<usize>() {
            return Err(Status::invalid_argument(format!(
                "reshape: cannot reshape {current:?} into {dims:?}"
            )));
        }
        Ok(self.push(HloOpcode::Reshape, vec![operand], Shape::array(ty, dims)))
    }

    pub fn broadcast(
        &mut self,
        operand: InstructionId,
        out_dims: Vec<usize>,
        dimensions: Vec<usize>,
    ) -> StatusResult<InstructionId> {
        let (ty, dims) = self.array_operand(operand, "broadcast")?;
        if dimensions.len() != dims.len()
            || dimensions
                .iter()
                .zip(&dims)
                .any(|(&target, &size)| out_dims.get(target) != Some(&size))
        {
            return Err(Status::invalid_argument(format!(
                "broadcast: cannot map {dims:?} into {out_dims:?} with {dimensions:?}"
            )));
        }
        Ok(self.push(HloOpcode::Broadcast { dimensions }, vec![operand], Shape::array(ty, out_dims)))
    }

    pub fn tuple(&mut self, elements: Vec<InstructionId>) -> StatusResult<InstructionId> {
        let shapes = elements
            .iter()
            .map(|&id| self.shape_of(id).cloned())
            .collect::<StatusResult<Vec<_>>>()?;
        Ok(self.push(HloOpcode::Tuple, elements, Shape::Tuple(shapes)))
    }

    pub fn get_tuple_element(&mut self, operand: InstructionId, index: usize) -> StatusResult<InstructionId> {
        let shape = self
            .shape_of(operand)?
            .tuple_shapes()
            .get(index)
            .cloned()
            .ok_or_else(|| Status::invalid_argument(format!("get-tuple-element index {index} out of range")))?;
        Ok(self.push(HloOpcode::GetTupleElement { index }, vec![operand], shape))
    }

    /// Calls `callee`, which must be added to the same module before the module is verified.
    pub fn call(&mut self, callee: &HloComputation, operands: Vec<InstructionId>) -> StatusResult<InstructionId> {
        let params = callee.parameter_instructions();
        if params.len() != operands.len() {
            return Err(Status::invalid_argument(format!(
                "call to {} expects {} operands, got {}",
                callee.name(),
                params.len(),
                operands.len()
            )));
        }
        for (param, &operand) in params.iter().zip(&operands) {
            if !param.shape.compatible(self.shape_of(operand)?) {
                return Err(Status::invalid_argument(format!(
                    "call to {}: operand shape {} does not match parameter {}",
                    callee.name(),
                    self.shape_of(operand)?,
                    param.shape
                )));
            }
        }
        let shape = callee.root_instruction()?.shape.clone();
        Ok(self.push(
            HloOpcode::Call {
                computation: callee.name().to_string(),
            },
            operands,
            shape,
        ))
    }

    pub fn custom_call(
        &mut self,
        target: impl Into<String>,
        operands: Vec<InstructionId>,
        shape: Shape,
        has_side_effect: bool,
    ) -> InstructionId {
        self.push(
            HloOpcode::CustomCall {
                target: target.into(),
                has_side_effect,
            },
            operands,
            shape,
        )
    }

    pub fn build(self, root: InstructionId) -> StatusResult<HloComputation> {
        let computation = HloComputation {
            name: self.name,
            instructions: self.instructions,
            root,
        };
        computation.verify()?;
        Ok(computation)
    }
}

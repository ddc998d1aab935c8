//! XLA lowerings of the builtin dense and variable ops.

use std::sync::Arc;

use super::KernelRegistry;
use crate::eager::attr::AttrMap;
use crate::jit::xla_compiler::{XlaOpContext, XlaOpKernel};
use crate::status::{Status, StatusResult};
use crate::tensor::DType;
use crate::xla::hlo::{HloComputationBuilder, HloOpcode, InstructionId};

pub(crate) fn format_dims(dims: &[usize]) -> String {
    let dims: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("[{}]", dims.join(","))
}

/// Numpy-style broadcast of two shapes, or `None` when they are incompatible.
pub(crate) fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for (axis, slot) in out.iter_mut().enumerate() {
        let l = (axis + lhs.len()).checked_sub(rank).map_or(1, |i| lhs[i]);
        let r = (axis + rhs.len()).checked_sub(rank).map_or(1, |i| rhs[i]);
        *slot = match (l, r) {
            _ if l == r => l,
            (1, _) => r,
            (_, 1) => l,
            _ => return None,
        };
    }
    Some(out)
}

/// Expands `operand` of shape `dims` to `out`, dropping the size-1 axes that get stretched.
fn broadcast_to(
    builder: &mut HloComputationBuilder,
    operand: InstructionId,
    dims: &[usize],
    out: &[usize],
) -> StatusResult<InstructionId> {
    if dims == out {
        return Ok(operand);
    }
    let offset = out.len() - dims.len();
    let mut kept = Vec::with_capacity(dims.len());
    let mut mapping = Vec::with_capacity(dims.len());
    for (axis, &size) in dims.iter().enumerate() {
        if size == out[offset + axis] {
            kept.push(size);
            mapping.push(offset + axis);
        }
    }
    let operand = if kept.len() == dims.len() {
        operand
    } else {
        builder.reshape(operand, kept)?
    };
    builder.broadcast(operand, out.to_vec(), mapping)
}

fn expect_inputs(op: &str, input_types: &[DType], count: usize) -> StatusResult<()> {
    if input_types.len() != count {
        return Err(Status::invalid_argument(format!(
            "{op} expects {count} inputs, got {}",
            input_types.len()
        )));
    }
    Ok(())
}

fn type_class(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float",
        other => other.name(),
    }
}

/// Every input must share the first input's dense type.
fn same_dense_types(op: &str, input_types: &[DType]) -> StatusResult<DType> {
    let Some(&first) = input_types.first() else {
        return Err(Status::invalid_argument(format!("{op} expects at least one input")));
    };
    for (index, &dtype) in input_types.iter().enumerate() {
        if dtype == DType::Resource || dtype == DType::Bool {
            return Err(Status::invalid_argument(format!(
                "cannot compute {op} as input #{index}(zero-based) is a {dtype} tensor"
            )));
        }
        if dtype != first {
            return Err(Status::invalid_argument(format!(
                "cannot compute {op} as input #{index}(zero-based) was expected to be a {} tensor but is a {} tensor",
                type_class(first),
                type_class(dtype)
            )));
        }
    }
    Ok(first)
}

struct MatMul;

impl XlaOpKernel for MatMul {
    fn output_types(&self, _attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs("MatMul", input_types, 2)?;
        Ok(vec![same_dense_types("MatMul", input_types)?])
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        let transpose_a = ctx.attrs().bool_or("transpose_a", false)?;
        let transpose_b = ctx.attrs().bool_or("transpose_b", false)?;
        let a = ctx.input_shape(0)?;
        let b = ctx.input_shape(1)?;
        for (index, shape) in [(0, &a), (1, &b)] {
            if shape.rank() != 2 {
                return Err(Status::invalid_argument(format!(
                    "In[{index}] is not a matrix. Instead it has shape {}",
                    format_dims(shape.dims())
                )));
            }
        }
        let (lhs_contracting, rhs_contracting) = (usize::from(!transpose_a), usize::from(transpose_b));
        if a.dims()[lhs_contracting] != b.dims()[rhs_contracting] {
            return Err(Status::invalid_argument(format!(
                "Matrix size-incompatible: In[0]: {}, In[1]: {}",
                format_dims(a.dims()),
                format_dims(b.dims())
            )));
        }
        let lhs = ctx.input(0)?;
        let rhs = ctx.input(1)?;
        let product = ctx.builder().dot(lhs, rhs, lhs_contracting, rhs_contracting)?;
        ctx.set_output(0, product)
    }
}

struct Binary {
    op: &'static str,
    opcode: HloOpcode,
}

impl XlaOpKernel for Binary {
    fn output_types(&self, _attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs(self.op, input_types, 2)?;
        Ok(vec![same_dense_types(self.op, input_types)?])
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        let lhs_shape = ctx.input_shape(0)?;
        let rhs_shape = ctx.input_shape(1)?;
        let out = broadcast_shapes(lhs_shape.dims(), rhs_shape.dims()).ok_or_else(|| {
            Status::invalid_argument(format!(
                "Incompatible shapes: {} vs. {}",
                format_dims(lhs_shape.dims()),
                format_dims(rhs_shape.dims())
            ))
        })?;
        let lhs = ctx.input(0)?;
        let rhs = ctx.input(1)?;
        let builder = ctx.builder();
        let lhs = broadcast_to(builder, lhs, lhs_shape.dims(), &out)?;
        let rhs = broadcast_to(builder, rhs, rhs_shape.dims(), &out)?;
        let value = builder.binary(self.opcode.clone(), lhs, rhs)?;
        ctx.set_output(0, value)
    }
}

struct Unary {
    op: &'static str,
    opcode: HloOpcode,
    float_only: bool,
}

impl XlaOpKernel for Unary {
    fn output_types(&self, _attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs(self.op, input_types, 1)?;
        let dtype = same_dense_types(self.op, input_types)?;
        if self.float_only && !dtype.is_floating() {
            return Err(Status::invalid_argument(format!(
                "{} requires a floating point input, got {dtype}",
                self.op
            )));
        }
        Ok(vec![dtype])
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        let operand = ctx.input(0)?;
        let value = ctx.builder().unary(self.opcode.clone(), operand)?;
        ctx.set_output(0, value)
    }
}

struct Identity;

impl XlaOpKernel for Identity {
    fn output_types(&self, _attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs("Identity", input_types, 1)?;
        Ok(input_types.to_vec())
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        ctx.forward_input(0, 0)
    }
}

struct Const;

impl XlaOpKernel for Const {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs("Const", input_types, 0)?;
        let value = attrs.required_tensor("value")?;
        if let Some(dtype) = attrs.dtype("dtype")? {
            if dtype != value.dtype() {
                return Err(Status::invalid_argument(format!(
                    "Type mismatch between value ({}) and dtype ({dtype})",
                    value.dtype()
                )));
            }
        }
        Ok(vec![value.dtype()])
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        let value = ctx.attrs().required_tensor("value")?;
        ctx.set_constant_output(0, value)
    }
}

struct ReadVariable;

impl XlaOpKernel for ReadVariable {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs("ReadVariableOp", input_types, 1)?;
        Ok(vec![attrs.required_dtype("dtype")?])
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        let dtype = ctx.attrs().required_dtype("dtype")?;
        let value = ctx.read_variable(0, dtype)?;
        ctx.set_output(0, value)
    }
}

/// `AssignVariableOp`, or an in-place update of the current value with `update`.
struct AssignVariable {
    op: &'static str,
    update: Option<HloOpcode>,
}

impl XlaOpKernel for AssignVariable {
    fn output_types(&self, attrs: &AttrMap, input_types: &[DType]) -> StatusResult<Vec<DType>> {
        expect_inputs(self.op, input_types, 2)?;
        if input_types[0] != DType::Resource {
            return Err(Status::invalid_argument(format!(
                "input 0 of {} must be a resource handle, got {}",
                self.op, input_types[0]
            )));
        }
        if let Some(dtype) = attrs.dtype("dtype")? {
            if dtype != input_types[1] {
                return Err(Status::invalid_argument(format!(
                    "{} expects a {dtype} value, got {}",
                    self.op, input_types[1]
                )));
            }
        }
        Ok(Vec::new())
    }

    fn compile(&self, ctx: &mut XlaOpContext<'_>) -> StatusResult<()> {
        let dtype = ctx.input_type(1)?;
        let value = ctx.input(1)?;
        let value = match &self.update {
            None => value,
            Some(opcode) => {
                let current = ctx.read_variable(0, dtype)?;
                ctx.builder().binary(opcode.clone(), current, value)?
            }
        };
        ctx.assign_variable(0, value)
    }
}

pub(super) fn register_builtin(registry: &KernelRegistry) {
    registry.register_xla("MatMul", Arc::new(MatMul));
    for (op, opcode) in [
        ("Add", HloOpcode::Add),
        ("AddV2", HloOpcode::Add),
        ("Sub", HloOpcode::Subtract),
        ("Mul", HloOpcode::Multiply),
        ("RealDiv", HloOpcode::Divide),
        ("Maximum", HloOpcode::Maximum),
        ("Minimum", HloOpcode::Minimum),
    ] {
        registry.register_xla(op, Arc::new(Binary { op, opcode }));
    }
    for (op, opcode, float_only) in [
        ("Neg", HloOpcode::Negate, false),
        ("Abs", HloOpcode::Abs, false),
        ("Exp", HloOpcode::Exp, true),
        ("Tanh", HloOpcode::Tanh, true),
    ] {
        registry.register_xla(op, Arc::new(Unary { op, opcode, float_only }));
    }
    registry.register_xla("Identity", Arc::new(Identity));
    registry.register_xla("Const", Arc::new(Const));
    registry.register_xla("ReadVariableOp", Arc::new(ReadVariable));
    for (op, update) in [
        ("AssignVariableOp", None),
        ("AssignAddVariableOp", Some(HloOpcode::Add)),
        ("AssignSubVariableOp", Some(HloOpcode::Subtract)),
    ] {
        registry.register_xla(op, Arc::new(AssignVariable { op, update }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasts_trailing_axes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[4, 1], &[1, 5]), Some(vec![4, 5]));
        assert_eq!(broadcast_shapes(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shapes(&[2, 2], &[3]), None);
    }

    #[test]
    fn formats_dims_without_spaces() {
        assert_eq!(format_dims(&[2, 2]), "[2,2]");
        assert_eq!(format_dims(&[]), "[]");
    }
}

//! Reference evaluation of HLO modules on host literals.

use std::collections::HashMap;
use std::sync::Arc;

use tfe_rs::status::{Status, StatusResult};
use tfe_rs::tensor::{DType, Tensor, TensorShape};
use tfe_rs::xla::hlo::{HloComputation, HloInstruction, HloModule, HloOpcode, InstructionId};
use tfe_rs::xla::Literal;

const MAX_CALL_DEPTH: usize = 64;

#[derive(Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    S32(Arc<[i32]>),
    S64(Arc<[i64]>),
    Pred(Arc<[bool]>),
}

macro_rules! map_data {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            TensorData::F32($values) => TensorData::F32($body),
            TensorData::F64($values) => TensorData::F64($body),
            TensorData::S32($values) => TensorData::S32($body),
            TensorData::S64($values) => TensorData::S64($body),
            TensorData::Pred($values) => TensorData::Pred($body),
        }
    };
}

impl TensorData {
    pub fn from_tensor(tensor: &Tensor) -> StatusResult<Self> {
        Ok(match tensor.dtype() {
            DType::F32 => TensorData::F32(Arc::from(tensor.to_vec::<f32>()?)),
            DType::F64 => TensorData::F64(Arc::from(tensor.to_vec::<f64>()?)),
            DType::I32 => TensorData::S32(Arc::from(tensor.to_vec::<i32>()?)),
            DType::I64 => TensorData::S64(Arc::from(tensor.to_vec::<i64>()?)),
            DType::Bool => TensorData::Pred(Arc::from(tensor.to_vec::<bool>()?)),
            DType::Resource => {
                return Err(Status::invalid_argument(
                    "resource values cannot be evaluated",
                ))
            }
        })
    }

    pub fn into_tensor(self, dims: &[usize]) -> StatusResult<Tensor> {
        let shape = TensorShape::new(dims.to_vec());
        match self {
            TensorData::F32(v) => Tensor::from_vec(shape, v.to_vec()),
            TensorData::F64(v) => Tensor::from_vec(shape, v.to_vec()),
            TensorData::S32(v) => Tensor::from_vec(shape, v.to_vec()),
            TensorData::S64(v) => Tensor::from_vec(shape, v.to_vec()),
            TensorData::Pred(v) => Tensor::from_vec(shape, v.to_vec()),
        }
    }

    /// Element `indices[i]` of the source becomes element `i` of the result.
    fn gather(&self, indices: &[usize]) -> TensorData {
        map_data!(self, values => indices.iter().map(|&i| values[i]).collect())
    }

    fn to_f64(&self) -> Vec<f64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            TensorData::F64(v) => v.to_vec(),
            TensorData::S32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            TensorData::S64(v) => v.iter().map(|&x| x as f64).collect(),
            TensorData::Pred(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    fn to_i64(&self) -> Vec<i64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::F64(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::S32(v) => v.iter().map(|&x| i64::from(x)).collect(),
            TensorData::S64(v) => v.to_vec(),
            TensorData::Pred(v) => v.iter().map(|&x| i64::from(x)).collect(),
        }
    }

    fn is_integral(&self) -> bool {
        matches!(self, TensorData::S32(_) | TensorData::S64(_) | TensorData::Pred(_))
    }

    fn convert(&self, to: DType) -> StatusResult<TensorData> {
        Ok(match to {
            DType::F32 => TensorData::F32(self.to_f64().into_iter().map(|x| x as f32).collect()),
            DType::F64 => TensorData::F64(Arc::from(self.to_f64())),
            DType::I32 if self.is_integral() => {
                TensorData::S32(self.to_i64().into_iter().map(|x| x as i32).collect())
            }
            DType::I32 => TensorData::S32(self.to_f64().into_iter().map(|x| x as i32).collect()),
            DType::I64 => TensorData::S64(Arc::from(self.to_i64())),
            DType::Bool => TensorData::Pred(self.to_f64().into_iter().map(|x| x != 0.0).collect()),
            DType::Resource => {
                return Err(Status::invalid_argument("cannot convert to a resource type"))
            }
        })
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

fn op_binary(opcode: &HloOpcode, lhs: &TensorData, rhs: &TensorData) -> StatusResult<TensorData> {
    macro_rules! float_binary {
        ($a:expr, $b:expr) => {
            $a.iter()
                .zip($b.iter())
                .map(|(&x, &y)| match opcode {
                    HloOpcode::Add => x + y,
                    HloOpcode::Subtract => x - y,
                    HloOpcode::Multiply => x * y,
                    HloOpcode::Divide => x / y,
                    HloOpcode::Maximum => x.max(y),
                    _ => x.min(y),
                })
                .collect()
        };
    }
    // Integer overflow wraps; division by zero yields -1 rather than trapping.
    macro_rules! int_binary {
        ($a:expr, $b:expr) => {
            $a.iter()
                .zip($b.iter())
                .map(|(&x, &y)| match opcode {
                    HloOpcode::Add => x.wrapping_add(y),
                    HloOpcode::Subtract => x.wrapping_sub(y),
                    HloOpcode::Multiply => x.wrapping_mul(y),
                    HloOpcode::Divide if y == 0 => -1,
                    HloOpcode::Divide => x.wrapping_div(y),
                    HloOpcode::Maximum => x.max(y),
                    _ => x.min(y),
                })
                .collect()
        };
    }
    Ok(match (lhs, rhs) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(float_binary!(a, b)),
        (TensorData::F64(a), TensorData::F64(b)) => TensorData::F64(float_binary!(a, b)),
        (TensorData::S32(a), TensorData::S32(b)) => TensorData::S32(int_binary!(a, b)),
        (TensorData::S64(a), TensorData::S64(b)) => TensorData::S64(int_binary!(a, b)),
        _ => {
            return Err(Status::invalid_argument(format!(
                "{} requires matching numeric operands",
                opcode.name()
            )))
        }
    })
}

fn op_unary(opcode: &HloOpcode, input: &TensorData) -> StatusResult<TensorData> {
    macro_rules! float_unary {
        ($v:expr) => {
            $v.iter()
                .map(|&x| match opcode {
                    HloOpcode::Negate => -x,
                    HloOpcode::Abs => x.abs(),
                    HloOpcode::Exp => x.exp(),
                    _ => x.tanh(),
                })
                .collect()
        };
    }
    macro_rules! int_unary {
        ($v:expr) => {
            match opcode {
                HloOpcode::Negate => $v.iter().map(|&x| x.wrapping_neg()).collect(),
                HloOpcode::Abs => $v.iter().map(|&x| x.wrapping_abs()).collect(),
                _ => {
                    return Err(Status::invalid_argument(format!(
                        "{} requires a floating point operand",
                        opcode.name()
                    )))
                }
            }
        };
    }
    Ok(match input {
        TensorData::F32(v) => TensorData::F32(float_unary!(v)),
        TensorData::F64(v) => TensorData::F64(float_unary!(v)),
        TensorData::S32(v) => TensorData::S32(int_unary!(v)),
        TensorData::S64(v) => TensorData::S64(int_unary!(v)),
        TensorData::Pred(_) => {
            return Err(Status::invalid_argument(format!(
                "{} is not defined for pred operands",
                opcode.name()
            )))
        }
    })
}

fn op_dot(
    lhs: &TensorData,
    lhs_dims: &[usize],
    rhs: &TensorData,
    rhs_dims: &[usize],
    lhs_contracting: usize,
    rhs_contracting: usize,
) -> StatusResult<TensorData> {
    let lhs_strides = compute_strides(lhs_dims);
    let rhs_strides = compute_strides(rhs_dims);
    let lhs_free = 1 - lhs_contracting;
    let rhs_free = 1 - rhs_contracting;
    let (m, k, n) = (lhs_dims[lhs_free], lhs_dims[lhs_contracting], rhs_dims[rhs_free]);
    if rhs_dims[rhs_contracting] != k {
        return Err(Status::invalid_argument(format!(
            "dot contracting dimensions differ: {lhs_dims:?} vs {rhs_dims:?}"
        )));
    }
    macro_rules! dot {
        ($a:expr, $b:expr, $zero:expr, $fma:expr) => {{
            let mut out = Vec::with_capacity(m * n);
            for i in 0..m {
                for j in 0..n {
                    let mut acc = $zero;
                    for c in 0..k {
                        let li = i * lhs_strides[lhs_free] + c * lhs_strides[lhs_contracting];
                        let ri = c * rhs_strides[rhs_contracting] + j * rhs_strides[rhs_free];
                        acc = $fma(acc, $a[li], $b[ri]);
                    }
                    out.push(acc);
                }
            }
            out
        }};
    }
    // Integer accumulation wraps like the elementwise ops.
    let fma_f32 = |acc: f32, x: f32, y: f32| acc + x * y;
    let fma_f64 = |acc: f64, x: f64, y: f64| acc + x * y;
    let fma_i32 = |acc: i32, x: i32, y: i32| acc.wrapping_add(x.wrapping_mul(y));
    let fma_i64 = |acc: i64, x: i64, y: i64| acc.wrapping_add(x.wrapping_mul(y));
    Ok(match (lhs, rhs) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(dot!(a, b, 0.0f32, fma_f32).into()),
        (TensorData::F64(a), TensorData::F64(b)) => TensorData::F64(dot!(a, b, 0.0f64, fma_f64).into()),
        (TensorData::S32(a), TensorData::S32(b)) => TensorData::S32(dot!(a, b, 0i32, fma_i32).into()),
        (TensorData::S64(a), TensorData::S64(b)) => TensorData::S64(dot!(a, b, 0i64, fma_i64).into()),
        _ => return Err(Status::invalid_argument("dot requires matching numeric operands")),
    })
}

fn transpose_indices(input_dims: &[usize], permutation: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let strides = compute_strides(input_dims);
    (0..out_dims.iter().product())
        .map(|idx| {
            unravel_index(idx, out_dims)
                .iter()
                .enumerate()
                .map(|(out_axis, &coord)| coord * strides[permutation[out_axis]])
                .sum()
        })
        .collect()
}

fn broadcast_indices(input_dims: &[usize], dimensions: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let strides = compute_strides(input_dims);
    (0..out_dims.iter().product())
        .map(|idx| {
            let coords = unravel_index(idx, out_dims);
            dimensions
                .iter()
                .enumerate()
                .map(|(in_axis, &out_axis)| coords[out_axis] * strides[in_axis])
                .sum()
        })
        .collect()
}

/// Walks a module's instructions in definition order, keeping every value as a literal.
pub struct HloEvaluator<'m> {
    module: &'m HloModule,
}

impl<'m> HloEvaluator<'m> {
    pub fn new(module: &'m HloModule) -> Self {
        HloEvaluator { module }
    }

    pub fn evaluate(&self, arguments: &[Literal]) -> StatusResult<Literal> {
        self.evaluate_computation(self.module.entry_computation()?, arguments, 0)
    }

    pub fn evaluate_computation(
        &self,
        computation: &HloComputation,
        arguments: &[Literal],
        depth: usize,
    ) -> StatusResult<Literal> {
        if depth > MAX_CALL_DEPTH {
            return Err(Status::invalid_argument(format!(
                "call depth exceeds {MAX_CALL_DEPTH} while evaluating {}",
                computation.name()
            )));
        }
        let mut values: HashMap<InstructionId, Literal> = HashMap::with_capacity(computation.instruction_count());
        for inst in computation.instructions() {
            let operands = inst
                .operands
                .iter()
                .map(|id| {
                    values.get(id).ok_or_else(|| {
                        Status::internal(format!("operand {id} of {} has no value", inst.name))
                    })
                })
                .collect::<StatusResult<Vec<&Literal>>>()?;
            let value = self
                .evaluate_instruction(inst, &operands, arguments, depth)
                .map_err(|err| err.with_context(format!(" (while evaluating {})", inst.name)))?;
            values.insert(inst.id, value);
        }
        values
            .remove(&computation.root_id())
            .ok_or_else(|| Status::internal(format!("root of {} was not evaluated", computation.name())))
    }

    fn evaluate_instruction(
        &self,
        inst: &HloInstruction,
        operands: &[&Literal],
        arguments: &[Literal],
        depth: usize,
    ) -> StatusResult<Literal> {
        let out_dims = inst.shape.dims();
        let array = |i: usize| -> StatusResult<(TensorData, Vec<usize>)> {
            let tensor = operands[i].as_tensor()?;
            Ok((TensorData::from_tensor(tensor)?, tensor.dims().to_vec()))
        };
        let finish = |data: TensorData| -> StatusResult<Literal> {
            Ok(Literal::Array(data.into_tensor(out_dims)?))
        };

        match &inst.opcode {
            HloOpcode::Parameter { number } => {
                let argument = arguments.get(*number).ok_or_else(|| {
                    Status::invalid_argument(format!("missing argument for parameter {number}"))
                })?;
                if !argument.shape().compatible(&inst.shape) {
                    return Err(Status::invalid_argument(format!(
                        "argument {number} has shape {}, expected {}",
                        argument.shape(),
                        inst.shape
                    )));
                }
                Ok(argument.clone())
            }
            HloOpcode::Constant { literal } => Ok(literal.clone()),
            op if op.is_elementwise_binary() => {
                let (lhs, _) = array(0)?;
                let (rhs, _) = array(1)?;
                finish(op_binary(op, &lhs, &rhs)?)
            }
            op if op.is_elementwise_unary() => {
                let (input, _) = array(0)?;
                finish(op_unary(op, &input)?)
            }
            HloOpcode::Convert => {
                let (input, _) = array(0)?;
                let to = inst
                    .shape
                    .element_type()
                    .ok_or_else(|| Status::internal("convert to a tuple shape"))?;
                finish(input.convert(to)?)
            }
            HloOpcode::Dot {
                lhs_contracting,
                rhs_contracting,
            } => {
                let (lhs, lhs_dims) = array(0)?;
                let (rhs, rhs_dims) = array(1)?;
                finish(op_dot(&lhs, &lhs_dims, &rhs, &rhs_dims, *lhs_contracting, *rhs_contracting)?)
            }
            HloOpcode::Transpose { permutation } => {
                let (input, dims) = array(0)?;
                finish(input.gather(&transpose_indices(&dims, permutation, out_dims)))
            }
            HloOpcode::Reshape => {
                let tensor = operands[0].as_tensor()?;
                Ok(Literal::Array(tensor.reshaped(TensorShape::new(out_dims.to_vec()))?))
            }
            HloOpcode::Broadcast { dimensions } => {
                let (input, dims) = array(0)?;
                finish(input.gather(&broadcast_indices(&dims, dimensions, out_dims)))
            }
            HloOpcode::Tuple => Ok(Literal::Tuple(operands.iter().map(|&l| l.clone()).collect())),
            HloOpcode::GetTupleElement { index } => Ok(operands[0].tuple_element(*index)?.clone()),
            HloOpcode::Call { computation } => {
                let callee = self.module.computation(computation).ok_or_else(|| {
                    Status::internal(format!("call to unknown computation {computation}"))
                })?;
                let args: Vec<Literal> = operands.iter().map(|&l| l.clone()).collect();
                self.evaluate_computation(callee, &args, depth + 1)
            }
            HloOpcode::CustomCall { target, .. } => Err(Status::unimplemented(format!(
                "custom-call target {target} is not supported by the interpreter"
            ))),
            other => Err(Status::unimplemented(format!(
                "opcode {} is not supported by the interpreter",
                other.name()
            ))),
        }
    }
}

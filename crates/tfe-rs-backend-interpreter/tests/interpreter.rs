use std::sync::Arc;

use anyhow::Result;
use tfe_rs::device::{DeviceAllocator, Stream};
use tfe_rs::tensor::TensorShape;
use tfe_rs::xla::hlo::{HloComputationBuilder, HloModule, HloOpcode};
use tfe_rs::xla::transfer::{literal_to_scoped_buffer, transfer_literal_from_device};
use tfe_rs::xla::{
    get_compiler, CompileOptions, Compiler, ExecutableBuildOptions, ExecutableRunOptions, Literal, LocalClient, Shape,
};
use tfe_rs::{Code, DType, Tensor};
use tfe_rs_backend_interpreter::{HloEvaluator, InterpreterCompiler, PLATFORM_NAME};

fn vector(values: &[f32]) -> Result<Literal> {
    Ok(Literal::Array(Tensor::from_vec(
        TensorShape::new([values.len()]),
        values.to_vec(),
    )?))
}

/// `tanh(x + c0) * c1` with two constant payloads.
fn module_with_constants() -> Result<HloModule> {
    let mut b = HloComputationBuilder::new("affine");
    let x = b.parameter(0, Shape::array(DType::F32, vec![2]));
    let c0 = b.constant(vector(&[0.5, -0.5])?);
    let c1 = b.constant(vector(&[2.0, 3.0])?);
    let sum = b.binary(HloOpcode::Add, x, c0)?;
    let squashed = b.unary(HloOpcode::Tanh, sum)?;
    let out = b.binary(HloOpcode::Multiply, squashed, c1)?;
    Ok(HloModule::new("affine", b.build(out)?))
}

fn client() -> Arc<LocalClient> {
    LocalClient::with_compiler(Arc::new(InterpreterCompiler::new()))
}

#[test]
fn compiles_and_runs_on_a_stream() -> Result<()> {
    let client = client();
    let allocator = DeviceAllocator::new("interpreter", 0, None);
    let stream = Stream::new("compute")?;
    let module = module_with_constants()?;
    let executable = client.compile(
        &module,
        &[Shape::array(DType::F32, vec![2])],
        &ExecutableBuildOptions::for_device(0),
        Some(&allocator),
    )?;

    let argument = literal_to_scoped_buffer(&stream, &vector(&[-0.5, 0.5])?, &allocator, 0)?;
    let result = executable.run(
        &[argument.as_shaped_buffer()],
        &ExecutableRunOptions::new(&stream, &allocator),
    )?;
    let literal = transfer_literal_from_device(&stream, &result.as_shaped_buffer())?;
    assert_eq!(literal.into_tensor()?.to_vec::<f32>()?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn compilation_takes_no_scratch_memory() -> Result<()> {
    let client = client();
    // An allocator with no capacity at all.
    let allocator = DeviceAllocator::new("empty", 0, Some(0));
    let module = module_with_constants()?;
    let executable = client.compile(
        &module,
        &[Shape::array(DType::F32, vec![2])],
        &ExecutableBuildOptions::for_device(0),
        Some(&allocator),
    )?;
    let stats = allocator.stats();
    assert_eq!(stats.num_allocs, 0);
    assert_eq!(stats.peak_bytes_in_use, 0);

    let run_allocator = DeviceAllocator::new("run", 0, None);
    let stream = Stream::new("compute")?;
    let argument = literal_to_scoped_buffer(&stream, &vector(&[-0.5, 0.5])?, &run_allocator, 0)?;
    let result = executable.run(
        &[argument.as_shaped_buffer()],
        &ExecutableRunOptions::new(&stream, &run_allocator),
    )?;
    let literal = transfer_literal_from_device(&stream, &result.as_shaped_buffer())?;
    assert_eq!(literal.into_tensor()?.to_vec::<f32>()?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn integer_arithmetic_wraps() -> Result<()> {
    let scalar = |value: i32| -> Result<Literal> {
        Ok(Literal::Array(Tensor::from_vec(TensorShape::new(Vec::new()), vec![value])?))
    };
    let int = Shape::array(DType::I32, vec![]);
    let mut b = HloComputationBuilder::new("wrap");
    let x = b.parameter(0, int.clone());
    let y = b.parameter(1, int.clone());
    let quotient = b.binary(HloOpcode::Divide, x, y)?;
    let module = HloModule::new("wrap", b.build(quotient)?);
    let evaluator = HloEvaluator::new(&module);
    let divide = |x: i32, y: i32| -> Result<Vec<i32>> {
        Ok(evaluator.evaluate(&[scalar(x)?, scalar(y)?])?.into_tensor()?.to_vec::<i32>()?)
    };
    assert_eq!(divide(i32::MIN, -1)?, vec![i32::MIN]);
    assert_eq!(divide(7, 0)?, vec![-1]);
    assert_eq!(divide(-7, 2)?, vec![-3]);

    let matrix = Shape::array(DType::I32, vec![1, 1]);
    let mut b = HloComputationBuilder::new("dot");
    let lhs = b.parameter(0, matrix.clone());
    let rhs = b.parameter(1, matrix);
    let product = b.dot(lhs, rhs, 1, 0)?;
    let module = HloModule::new("dot", b.build(product)?);
    let one_by_one = |value: i32| -> Result<Literal> {
        Ok(Literal::Array(Tensor::from_vec(TensorShape::new([1, 1]), vec![value])?))
    };
    let value = HloEvaluator::new(&module).evaluate(&[one_by_one(i32::MAX)?, one_by_one(2)?])?;
    assert_eq!(value.into_tensor()?.to_vec::<i32>()?, vec![-2]);
    Ok(())
}

#[test]
fn argument_layouts_are_checked_before_compiling() -> Result<()> {
    let client = client();
    let module = module_with_constants()?;
    let err = client
        .compile(&module, &[], &ExecutableBuildOptions::for_device(0), None)
        .err()
        .ok_or_else(|| anyhow::anyhow!("missing argument layout should be rejected"))?;
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(
        err.message(),
        "Invalid number of arguments for computation: expected 1, got 0."
    );
    Ok(())
}

#[test]
fn module_groups_are_unimplemented() -> Result<()> {
    let compiler = InterpreterCompiler::new();
    let options = CompileOptions::default();
    for err in [
        compiler
            .run_hlo_passes_on_module_group(vec![module_with_constants()?], &options)
            .err(),
        compiler
            .compile_module_group(vec![module_with_constants()?], &options)
            .err(),
    ] {
        let err = err.ok_or_else(|| anyhow::anyhow!("module groups should be rejected"))?;
        assert_eq!(err.code(), Code::Unimplemented);
        assert_eq!(
            err.message(),
            "Module group compilation is not supported on Interpreter"
        );
    }
    Ok(())
}

#[test]
fn registered_under_its_platform_name() -> Result<()> {
    tfe_rs_backend_interpreter::register_interpreter_compiler();
    let compiler = get_compiler(PLATFORM_NAME)?;
    assert_eq!(compiler.platform_name(), PLATFORM_NAME);
    Ok(())
}

#[test]
fn evaluator_handles_dot_and_calls() -> Result<()> {
    let matrix = Shape::array(DType::F32, vec![2, 2]);
    let mut callee = HloComputationBuilder::new("double");
    let p = callee.parameter(0, matrix.clone());
    let doubled = callee.binary(HloOpcode::Add, p, p)?;
    let callee = callee.build(doubled)?;

    let mut b = HloComputationBuilder::new("main");
    let x = b.parameter(0, matrix);
    let product = b.dot(x, x, 1, 0)?;
    let out = b.call(&callee, vec![product])?;
    let mut module = HloModule::new("dot", b.build(out)?);
    module.add_computation(callee)?;

    let input = Literal::Array(Tensor::from_vec(
        TensorShape::new([2, 2]),
        vec![1.0f32, 2.0, 3.0, 4.0],
    )?);
    let value = HloEvaluator::new(&module).evaluate(&[input])?;
    assert_eq!(value.into_tensor()?.to_vec::<f32>()?, vec![14.0, 20.0, 30.0, 44.0]);
    Ok(())
}

#[test]
fn evaluator_rejects_custom_calls() -> Result<()> {
    let mut b = HloComputationBuilder::new("main");
    let x = b.parameter(0, Shape::array(DType::F32, vec![2]));
    let out = b.custom_call("opaque", vec![x], Shape::array(DType::F32, vec![2]), false);
    let module = HloModule::new("custom", b.build(out)?);
    let err = HloEvaluator::new(&module)
        .evaluate(&[vector(&[1.0, 2.0])?])
        .err()
        .ok_or_else(|| anyhow::anyhow!("custom calls cannot be evaluated"))?;
    assert_eq!(err.code(), Code::Unimplemented);
    Ok(())
}

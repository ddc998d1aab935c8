use anyhow::Result;
use tfe_rs::tensor::TensorShape;
use tfe_rs::xla::hlo::{HloComputation, HloComputationBuilder, HloModule, HloOpcode};
use tfe_rs::xla::passes::{FlattenCallGraph, HloDce, HloModulePass, HloPassPipeline};
use tfe_rs::xla::{Literal, Shape};
use tfe_rs::{Code, DType, Tensor};

fn vector() -> Shape {
    Shape::array(DType::F32, vec![2])
}

fn opcode_names(computation: &HloComputation) -> Vec<&'static str> {
    computation
        .instructions()
        .iter()
        .map(|inst| inst.opcode.name())
        .collect()
}

fn square(name: &str) -> Result<HloComputation> {
    let mut b = HloComputationBuilder::new(name);
    let x = b.parameter(0, vector());
    let y = b.binary(HloOpcode::Multiply, x, x)?;
    Ok(b.build(y)?)
}

#[test]
fn dce_removes_dead_chains_and_keeps_parameters() -> Result<()> {
    let mut b = HloComputationBuilder::new("entry");
    let x = b.parameter(0, vector());
    let _unused = b.parameter(1, vector());
    let sum = b.binary(HloOpcode::Add, x, x)?;
    let negated = b.unary(HloOpcode::Negate, sum)?;
    let _dead = b.binary(HloOpcode::Multiply, negated, x)?;
    let _logged = b.custom_call("log_value", vec![x], vector(), true);
    let mut module = HloModule::new("dce", b.build(sum)?);

    assert!(HloDce.run(&mut module)?);
    let entry = module.entry_computation()?;
    assert_eq!(
        opcode_names(entry),
        vec!["parameter", "parameter", "add", "custom-call"]
    );
    assert_eq!(entry.num_parameters(), 2);

    assert!(!HloDce.run(&mut module)?);
    Ok(())
}

#[test]
fn dce_drops_unreachable_computations() -> Result<()> {
    let mut b = HloComputationBuilder::new("main");
    let x = b.parameter(0, vector());
    let mut module = HloModule::new("unreachable", b.build(x)?);
    module.add_computation(square("orphan")?)?;
    assert_eq!(module.computations().len(), 2);

    assert!(HloDce.run(&mut module)?);
    assert_eq!(module.computations().len(), 1);
    assert!(module.computation("orphan").is_none());
    Ok(())
}

#[test]
fn dce_keeps_calls_into_side_effecting_computations() -> Result<()> {
    let mut effect = HloComputationBuilder::new("effect");
    let p = effect.parameter(0, vector());
    let root = effect.custom_call("print", vec![p], vector(), true);
    let effect = effect.build(root)?;

    let pure = square("pure")?;

    let mut b = HloComputationBuilder::new("main");
    let x = b.parameter(0, vector());
    let _kept = b.call(&effect, vec![x])?;
    let _dropped = b.call(&pure, vec![x])?;
    let one = b.constant(Literal::Array(Tensor::from_vec(TensorShape::new([2]), vec![1.0f32, 1.0])?));
    let out = b.binary(HloOpcode::Add, x, one)?;
    let mut module = HloModule::new("calls", b.build(out)?);
    module.add_computation(effect)?;
    module.add_computation(pure)?;

    assert!(HloDce.run(&mut module)?);
    assert_eq!(
        opcode_names(module.entry_computation()?),
        vec!["parameter", "call", "constant", "add"]
    );
    assert!(module.computation("effect").is_some());
    assert!(module.computation("pure").is_none());
    assert!(!HloDce.run(&mut module)?);
    Ok(())
}

#[test]
fn flatten_gives_each_call_site_its_own_callee() -> Result<()> {
    let callee = square("square")?;
    let mut b = HloComputationBuilder::new("main");
    let x = b.parameter(0, vector());
    let once = b.call(&callee, vec![x])?;
    let twice = b.call(&callee, vec![once])?;
    let mut module = HloModule::new("flatten", b.build(twice)?);
    module.add_computation(callee)?;

    assert!(FlattenCallGraph.run(&mut module)?);
    let targets: Vec<String> = module
        .entry_computation()?
        .instructions()
        .iter()
        .filter_map(|inst| inst.opcode.called_computation().map(str::to_string))
        .collect();
    assert_eq!(targets, vec!["square".to_string(), "square.clone1".to_string()]);
    assert_eq!(module.computations().len(), 3);

    assert!(!FlattenCallGraph.run(&mut module)?);
    module.verify()?;
    Ok(())
}

#[test]
fn pipeline_reports_any_change_and_reaches_a_fixed_point() -> Result<()> {
    let mut b = HloComputationBuilder::new("main");
    let x = b.parameter(0, vector());
    let _dead = b.unary(HloOpcode::Exp, x)?;
    let out = b.unary(HloOpcode::Tanh, x)?;
    let mut module = HloModule::new("pipeline", b.build(out)?);

    let mut pipeline = HloPassPipeline::new("test");
    pipeline.add_fixed_point(4, |inner| {
        inner.add_pass(FlattenCallGraph).add_pass(HloDce);
    });
    assert!(pipeline.run(&mut module)?);
    assert_eq!(opcode_names(module.entry_computation()?), vec!["parameter", "tanh"]);
    assert!(!pipeline.run(&mut module)?);
    Ok(())
}

#[test]
fn removing_live_instructions_is_an_internal_error() -> Result<()> {
    let mut b = HloComputationBuilder::new("square");
    let x = b.parameter(0, vector());
    let y = b.binary(HloOpcode::Multiply, x, x)?;
    let mut computation = b.build(y)?;

    let err = computation.remove_instruction(y).unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "cannot remove root instruction of computation square");

    let err = computation.remove_instruction(x).unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().ends_with("it still has users"), "{err}");
    assert_eq!(computation.instructions().len(), 2);
    Ok(())
}

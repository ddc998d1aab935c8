mod common;

use std::cell::Cell;

use anyhow::Result;
use common::XLA_CPU;
use tfe_rs::eager::{kernel_registry, AttrMap, AttrValue};
use tfe_rs::jit::{
    compile_graph, ArgumentKind, CompilationCache, CompiledKernel, OutputKind, XlaCompilerArgument, XlaGraph,
};
use tfe_rs::tensor::TensorShape;
use tfe_rs::xla::hlo::{HloComputationBuilder, HloModule, HloOpcode};
use tfe_rs::xla::transfer::literal_to_scoped_buffer;
use tfe_rs::xla::{ExecutableBuildOptions, ExecutableRunOptions, HloSnapshot, Literal, Shape};
use tfe_rs::{Code, DType, Tensor};

fn parameter(dims: &[usize]) -> XlaCompilerArgument {
    XlaCompilerArgument {
        kind: ArgumentKind::Parameter,
        dtype: DType::F32,
        shape: TensorShape::new(dims.to_vec()),
    }
}

fn scaled_module() -> Result<HloModule> {
    let mut b = HloComputationBuilder::new("scale");
    let x = b.parameter(0, Shape::array(DType::F32, vec![2]));
    let factor = b.constant(Literal::Array(Tensor::from_vec(
        TensorShape::new([2]),
        vec![10.0f32, 100.0],
    )?));
    let out = b.binary(HloOpcode::Multiply, x, factor)?;
    Ok(HloModule::new("scale", b.build(out)?))
}

#[test]
fn single_op_graph_maps_every_parameter() -> Result<()> {
    let graph = XlaGraph::single_op("MatMul", &AttrMap::new(), 2, 1);
    let compiled = compile_graph(&graph, &[parameter(&[2, 3]), parameter(&[3, 4])], kernel_registry())?;
    assert_eq!(compiled.input_mapping, vec![0, 1]);
    assert_eq!(compiled.xla_input_shapes.len(), 2);
    assert!(compiled.resource_updates.is_empty());
    assert_eq!(compiled.outputs.len(), 1);
    assert_eq!(compiled.outputs[0].shape, TensorShape::new([2, 4]));
    assert_eq!(compiled.outputs[0].kind, OutputKind::Computed { tuple_index: 0 });
    assert!(compiled.xla_output_shape.is_tuple());
    Ok(())
}

#[test]
fn constant_arguments_are_not_parameters() -> Result<()> {
    let graph = XlaGraph::single_op("AddV2", &AttrMap::new(), 2, 1);
    let folded = XlaCompilerArgument {
        kind: ArgumentKind::Constant(Tensor::from_vec(TensorShape::new([2]), vec![1.0f32, 2.0])?),
        dtype: DType::F32,
        shape: TensorShape::new([2]),
    };
    let compiled = compile_graph(&graph, &[folded, parameter(&[2])], kernel_registry())?;
    assert_eq!(compiled.input_mapping, vec![1]);
    assert_eq!(compiled.xla_input_shapes.len(), 1);
    Ok(())
}

#[test]
fn kernel_errors_surface_from_lowering() -> Result<()> {
    let graph = XlaGraph::single_op("MatMul", &AttrMap::new(), 2, 1);
    let err = compile_graph(&graph, &[parameter(&[2, 3]), parameter(&[2, 3])], kernel_registry()).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().starts_with("Matrix size-incompatible"));

    let attrs = AttrMap::new().with("value", AttrValue::Int(3));
    let err = compile_graph(&XlaGraph::single_op("Const", &attrs, 0, 1), &[], kernel_registry()).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn device_compile_leaves_the_allocator_untouched() -> Result<()> {
    let context = common::context()?;
    let device = context.find_device(XLA_CPU)?;
    let local = device.local()?;
    let before = local.allocator().stats();

    local.client().compile(
        &scaled_module()?,
        &[Shape::array(DType::F32, vec![2])],
        &ExecutableBuildOptions::for_device(device.ordinal()),
        Some(local.allocator()),
    )?;
    let after = local.allocator().stats();
    assert_eq!(after.bytes_in_use, before.bytes_in_use);
    assert_eq!(after.num_allocs, before.num_allocs);
    Ok(())
}

#[test]
fn cache_compiles_each_signature_once() -> Result<()> {
    let context = common::context()?;
    let device = context.find_device(XLA_CPU)?;
    let local = device.local()?;
    let cache = CompilationCache::new(8);
    let graph = XlaGraph::single_op("Neg", &AttrMap::new(), 1, 1);
    let compiles = Cell::new(0);

    let compile = |args: Vec<XlaCompilerArgument>| -> Result<bool> {
        let key = CompilationCache::signature(device.name(), &graph, &args)?;
        let (_, hit) = cache.compile_if_needed(key, || {
            compiles.set(compiles.get() + 1);
            let result = compile_graph(&graph, &args, kernel_registry())?;
            let executable = local.client().compile(
                &result.module,
                &result.xla_input_shapes,
                &ExecutableBuildOptions::for_device(device.ordinal()),
                Some(local.allocator()),
            )?;
            Ok(CompiledKernel { result, executable })
        })?;
        Ok(hit)
    };

    assert!(!compile(vec![parameter(&[4])])?);
    assert!(compile(vec![parameter(&[4])])?);
    assert!(!compile(vec![parameter(&[5])])?);
    assert_eq!(compiles.get(), 2);

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.entries), (1, 2, 2));
    cache.clear();
    assert_eq!(cache.stats().entries, 0);
    Ok(())
}

#[test]
fn snapshots_record_arguments_and_result() -> Result<()> {
    let context = common::context()?;
    let device = context.find_device(XLA_CPU)?;
    let local = device.local()?;
    let dir = tempfile::tempdir()?;
    let options = ExecutableBuildOptions {
        dump_snapshots: Some(true),
        dump_dir: Some(dir.path().to_path_buf()),
        ..ExecutableBuildOptions::for_device(device.ordinal())
    };
    let executable = local.client().compile(
        &scaled_module()?,
        &[Shape::array(DType::F32, vec![2])],
        &options,
        Some(local.allocator()),
    )?;

    let input = Literal::Array(Tensor::from_vec(TensorShape::new([2]), vec![1.0f32, 2.0])?);
    let stream = local.compute_stream();
    let argument = literal_to_scoped_buffer(stream, &input, local.allocator(), device.ordinal())?;
    executable.run(
        &[argument.as_shaped_buffer()],
        &ExecutableRunOptions::new(stream, local.allocator()),
    )?;

    let snapshot = executable
        .last_snapshot()
        .ok_or_else(|| anyhow::anyhow!("no snapshot recorded"))?;
    assert_eq!(snapshot.arguments, vec![input]);
    let result = snapshot
        .result
        .clone()
        .ok_or_else(|| anyhow::anyhow!("snapshot has no result"))?;
    assert_eq!(result.into_tensor()?.to_vec::<f32>()?, vec![10.0, 200.0]);

    let dumped: Vec<_> = std::fs::read_dir(dir.path())?.collect::<std::io::Result<_>>()?;
    assert_eq!(dumped.len(), 1);
    let reloaded = HloSnapshot::from_json_str(&std::fs::read_to_string(dumped[0].path())?)?;
    assert_eq!(reloaded, snapshot);
    assert_eq!(HloSnapshot::from_bincode_bytes(&snapshot.to_bincode_bytes()?)?, snapshot);
    Ok(())
}

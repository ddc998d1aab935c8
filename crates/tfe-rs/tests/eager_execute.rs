mod common;

use anyhow::Result;
use common::{HOST_CPU, XLA_CPU};
use tfe_rs::eager::FunctionDef;
use tfe_rs::tensor::{PartialShape, TensorShape};
use tfe_rs::{copy_to_device, execute, Code, ContextDevicePlacementPolicy, DType, Op, Tensor, TensorHandle};

#[test]
fn matmul_of_square_matrix() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;
    let outputs = common::run(&context, "MatMul", &[&m, &m])?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![7.0, 10.0, 15.0, 22.0]);
    assert_eq!(outputs[0].device_name(), HOST_CPU);
    assert_eq!(outputs[0].num_dims()?, 2);
    assert_eq!(outputs[0].dim(1)?, 2);
    Ok(())
}

#[test]
fn matmul_transpose_attrs() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;
    let mut op = Op::new(&context, "MatMul")?;
    op.add_input(&m)?;
    op.add_input(&m)?;
    op.set_attr_bool("transpose_a", true);
    let outputs = execute(&op)?;
    // [[1,3],[2,4]] x [[1,2],[3,4]]
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![10.0, 14.0, 14.0, 20.0]);
    Ok(())
}

#[test]
fn int32_matmul_wraps_on_overflow() -> Result<()> {
    let context = common::context()?;
    let lhs = common::ints(&context, &[1, 2], &[i32::MAX, 1])?;
    let rhs = common::ints(&context, &[2, 1], &[2, 3])?;
    let outputs = common::run(&context, "MatMul", &[&lhs, &rhs])?;
    assert_eq!(outputs[0].resolve()?.to_vec::<i32>()?, vec![1]);
    Ok(())
}

#[test]
fn incompatible_matmul_names_the_op() -> Result<()> {
    let context = common::context()?;
    let a = common::matrix(&context)?;
    let b = common::floats(&context, &[3, 2], &[1.0; 6])?;
    let err = common::run(&context, "MatMul", &[&a, &b])
        .unwrap_err()
        .downcast::<tfe_rs::Status>()?;
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(
        err.message(),
        "Matrix size-incompatible: In[0]: [2,2], In[1]: [3,2] [Op:MatMul]"
    );
    Ok(())
}

#[test]
fn broadcasting_add_and_type_mismatch() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;
    let row = common::floats(&context, &[2], &[10.0, 20.0])?;
    let sum = common::run(&context, "AddV2", &[&m, &row])?;
    assert_eq!(common::resolve_floats(&sum[0])?, vec![11.0, 22.0, 13.0, 24.0]);

    let ints = common::ints(&context, &[2], &[1, 2])?;
    let err = common::run(&context, "Add", &[&m, &ints])
        .unwrap_err()
        .downcast::<tfe_rs::Status>()?;
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("expected to be a float tensor but is a int32 tensor"));
    Ok(())
}

#[test]
fn unregistered_op_is_not_found() -> Result<()> {
    let context = common::context()?;
    let err = Op::new(&context, "DefinitelyNotAnOp").unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), "Op type not registered 'DefinitelyNotAnOp'");
    Ok(())
}

#[test]
fn copy_to_same_device_keeps_bytes() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;

    let same = copy_to_device(&m, &context, HOST_CPU)?;
    assert!(same.shares_state_with(&m));
    assert_eq!(same.resolve()?.bytes(), m.resolve()?.bytes());

    let on_xla = copy_to_device(&m, &context, XLA_CPU)?;
    assert_eq!(on_xla.device_name(), XLA_CPU);
    assert_eq!(on_xla.backing_device_name(), XLA_CPU);
    let again = copy_to_device(&on_xla, &context, XLA_CPU)?;
    assert_eq!(again.resolve()?.bytes(), m.resolve()?.bytes());

    let back = copy_to_device(&on_xla, &context, HOST_CPU)?;
    assert_eq!(back.resolve()?.bytes(), m.resolve()?.bytes());
    Ok(())
}

#[test]
fn copy_to_unknown_device_fails() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;
    let err = copy_to_device(&m, &context, "/device:GPU:3").unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "/device:GPU:3 unknown device.");
    Ok(())
}

#[test]
fn explicit_policy_rejects_implicit_copies() -> Result<()> {
    let context = common::context_with_policy(ContextDevicePlacementPolicy::Explicit)?;
    let m = common::matrix(&context)?;
    let err = common::run_on(&context, "MatMul", XLA_CPU, &[&m, &m]).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().starts_with("Tensors on conflicting devices: cannot compute MatMul as input #0"));
    assert!(err.message().ends_with(" [Op:MatMul]"));

    let on_xla = copy_to_device(&m, &context, XLA_CPU)?;
    let outputs = common::run_on(&context, "MatMul", XLA_CPU, &[&on_xla, &on_xla])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![7.0, 10.0, 15.0, 22.0]);
    Ok(())
}

#[test]
fn silent_policy_copies_inputs() -> Result<()> {
    let context = common::context_with_policy(ContextDevicePlacementPolicy::Silent)?;
    let m = common::matrix(&context)?;
    let outputs = common::run_on(&context, "MatMul", XLA_CPU, &[&m, &m])?;
    assert_eq!(outputs[0].device_name(), XLA_CPU);
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![7.0, 10.0, 15.0, 22.0]);
    Ok(())
}

#[test]
fn silent_for_int32_only_moves_int32() -> Result<()> {
    let context = common::context_with_policy(ContextDevicePlacementPolicy::SilentForInt32)?;
    let a = common::ints(&context, &[3], &[1, 2, 3])?;
    let sum = common::run_on(&context, "Add", XLA_CPU, &[&a, &a])?;
    assert_eq!(sum[0].resolve()?.to_vec::<i32>()?, vec![2, 4, 6]);

    let m = common::matrix(&context)?;
    let err = common::run_on(&context, "Add", XLA_CPU, &[&m, &m]).unwrap_err();
    assert!(err.message().contains("Tensors on conflicting devices"));
    Ok(())
}

#[test]
fn thread_local_policy_overrides_context() -> Result<()> {
    let context = common::context_with_policy(ContextDevicePlacementPolicy::Explicit)?;
    context.set_thread_local_placement_policy(ContextDevicePlacementPolicy::Silent);
    assert_eq!(context.placement_policy(), ContextDevicePlacementPolicy::Silent);
    let m = common::matrix(&context)?;
    common::run_on(&context, "MatMul", XLA_CPU, &[&m, &m])?;

    let other = std::sync::Arc::clone(&context);
    let policy = std::thread::spawn(move || other.placement_policy()).join().unwrap();
    assert_eq!(policy, ContextDevicePlacementPolicy::Explicit);
    Ok(())
}

#[test]
fn async_errors_stick_until_cleared() -> Result<()> {
    let context = common::async_context()?;
    let a = common::matrix(&context)?;
    let b = common::floats(&context, &[3, 2], &[1.0; 6])?;

    let failed = common::run(&context, "MatMul", &[&a, &b])?;
    let later = common::run(&context, "Neg", &[&a])?;

    let first = failed[0].resolve().unwrap_err();
    assert!(first.message().contains("Matrix size-incompatible"));
    let second = later[0].resolve().unwrap_err();
    assert_eq!(second, first);
    assert_eq!(context.async_wait().unwrap_err(), first);

    let rejected = common::run(&context, "Neg", &[&a])?;
    assert_eq!(rejected[0].resolve().unwrap_err(), first);

    context.async_clear_error();
    context.async_wait()?;
    let fine = common::run(&context, "Neg", &[&a])?;
    assert_eq!(common::resolve_floats(&fine[0])?, vec![-1.0, -2.0, -3.0, -4.0]);
    Ok(())
}

#[test]
fn async_wait_reports_the_earliest_failure() -> Result<()> {
    let context = common::async_context()?;
    let a = common::matrix(&context)?;
    let tall = common::floats(&context, &[3, 2], &[1.0; 6])?;
    let row = common::floats(&context, &[1, 3], &[1.0; 3])?;

    for order in [[XLA_CPU, HOST_CPU], [HOST_CPU, XLA_CPU]] {
        let mut errors = Vec::new();
        for (device, rhs) in order.into_iter().zip([&tall, &row]) {
            let failed = common::run_on(&context, "MatMul", device, &[&a, rhs])?;
            errors.push(failed[0].resolve().unwrap_err());
        }
        assert_ne!(errors[0], errors[1]);
        assert_eq!(context.async_wait().unwrap_err(), errors[0]);
        context.async_clear_error();
        context.async_wait()?;
    }
    Ok(())
}

#[test]
fn const_output_lives_on_op_device() -> Result<()> {
    let context = common::context()?;
    let value = Tensor::from_vec(TensorShape::new([3]), vec![1.5f32, 2.5, 3.5])?;
    let mut op = Op::new(&context, "Const")?;
    op.set_device(XLA_CPU)?;
    op.set_attr_tensor("value", value.clone());
    op.set_attr_type("dtype", DType::F32);
    let outputs = execute(&op)?;
    assert_eq!(outputs[0].device_name(), XLA_CPU);
    assert_eq!(outputs[0].backing_device_name(), XLA_CPU);
    assert_eq!(outputs[0].resolve()?.bytes(), value.bytes());
    Ok(())
}

#[test]
fn shape_outputs_are_host_memory() -> Result<()> {
    let context = common::context()?;
    let m = copy_to_device(&common::matrix(&context)?, &context, XLA_CPU)?;
    let outputs = common::run_on(&context, "Shape", XLA_CPU, &[&m])?;
    assert_eq!(outputs[0].device_name(), XLA_CPU);
    assert_eq!(outputs[0].backing_device_name(), HOST_CPU);
    assert_eq!(outputs[0].dtype(), DType::I32);
    assert_eq!(outputs[0].resolve()?.to_vec::<i32>()?, vec![2, 2]);
    Ok(())
}

fn var_handle(context: &std::sync::Arc<tfe_rs::Context>, name: &str) -> Result<TensorHandle> {
    let mut op = Op::new(context, "VarHandleOp")?;
    op.set_attr_type("dtype", DType::F32);
    op.set_attr_shape("shape", PartialShape::from_signed(Some(&[2])));
    op.set_attr_string("shared_name", name);
    Ok(execute(&op)?.remove(0))
}

#[test]
fn variable_lifecycle() -> Result<()> {
    let context = common::context()?;
    let v = var_handle(&context, "weights")?;
    assert_eq!(v.dtype(), DType::Resource);
    assert!(v.resolve().is_err());

    let initialized = common::run(&context, "VarIsInitializedOp", &[&v])?;
    assert_eq!(initialized[0].resolve()?.to_vec::<bool>()?, vec![false]);

    let value = common::floats(&context, &[2], &[1.0, 2.0])?;
    assert!(common::run(&context, "AssignVariableOp", &[&v, &value])?.is_empty());
    common::run(&context, "AssignAddVariableOp", &[&v, &value])?;

    let mut read = Op::new(&context, "ReadVariableOp")?;
    read.add_input(&v)?;
    read.set_attr_type("dtype", DType::F32);
    let current = execute(&read)?;
    assert_eq!(common::resolve_floats(&current[0])?, vec![2.0, 4.0]);

    let initialized = common::run(&context, "VarIsInitializedOp", &[&v])?;
    assert_eq!(initialized[0].resolve()?.to_vec::<bool>()?, vec![true]);

    let mut gather = Op::new(&context, "ResourceGather")?;
    gather.add_input(&v)?;
    gather.add_input(&common::ints(&context, &[3], &[1, 0, 1])?)?;
    gather.set_attr_type("dtype", DType::F32);
    let rows = execute(&gather)?;
    assert_eq!(common::resolve_floats(&rows[0])?, vec![4.0, 2.0, 4.0]);

    common::run(&context, "DestroyResourceOp", &[&v])?;
    let initialized = common::run(&context, "VarIsInitializedOp", &[&v])?;
    assert_eq!(initialized[0].resolve()?.to_vec::<bool>()?, vec![false]);
    Ok(())
}

#[test]
fn resource_handles_cannot_be_copied() -> Result<()> {
    let context = common::context()?;
    let v = var_handle(&context, "copy_me")?;
    let err = copy_to_device(&v, &context, XLA_CPU).unwrap_err();
    assert_eq!(
        err.message(),
        format!("Can't copy Tensor with type resource to device {XLA_CPU}.")
    );
    Ok(())
}

fn square_def() -> Result<FunctionDef> {
    Ok(FunctionDef::from_json_slice(
        br#"{
            "signature": {
                "name": "Square",
                "input_arg": [{"name": "x", "type": "float"}],
                "output_arg": [{"name": "y", "type": "float"}]
            },
            "node_def": [{"name": "sq", "op": "Mul", "input": ["x", "x"]}],
            "ret": {"y": "sq:z:0"}
        }"#,
    )?)
}

#[test]
fn functions_run_by_name() -> Result<()> {
    let context = common::context()?;
    context.add_function_def(square_def()?)?;
    context.add_function_def(square_def()?)?;

    let x = common::floats(&context, &[3], &[1.0, -2.0, 3.0])?;
    let outputs = common::run(&context, "Square", &[&x])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![1.0, 4.0, 9.0]);

    let mut other = square_def()?;
    other.node_def[0].op = "AddV2".to_string();
    let err = context.add_function_def(other).unwrap_err();
    assert_eq!(
        err.message(),
        "Cannot add function 'Square' because a different function with the same name already exists."
    );
    Ok(())
}

#[test]
fn functions_reject_host_ops() -> Result<()> {
    let context = common::context()?;
    let mut def = square_def()?;
    def.signature.name = "ShapeOf".to_string();
    def.node_def[0].op = "Shape".to_string();
    def.node_def[0].input = vec!["x".to_string()];
    let err = context.add_function_def(def).unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    Ok(())
}

#[test]
fn compiled_kernels_are_cached() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;
    common::run(&context, "Tanh", &[&m])?[0].wait_defined()?;
    common::run(&context, "Tanh", &[&m])?[0].wait_defined()?;
    let stats = context.compilation_cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    Ok(())
}

#[test]
fn handles_from_other_contexts_are_rejected() -> Result<()> {
    let first = common::context()?;
    let second = common::context()?;
    let m = common::matrix(&first)?;
    let mut op = Op::new(&second, "Neg")?;
    assert_eq!(op.add_input(&m).unwrap_err().code(), Code::InvalidArgument);
    assert!(op.inputs().is_empty());
    Ok(())
}

#[test]
fn dim_out_of_range() -> Result<()> {
    let context = common::context()?;
    let m = common::matrix(&context)?;
    let err = m.dim(5).unwrap_err();
    assert_eq!(err.message(), "Expected a dimension index in [0, 2), got 5");
    Ok(())
}

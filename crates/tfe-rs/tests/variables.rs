mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use common::XLA_CPU;
use tfe_rs::eager::AttrMap;
use tfe_rs::jit::{
    compile_graph, lock_variables, snapshot_resource_variables, ArgumentKind, DeviceTensor, KernelInput, Var,
    VariableInfo, XlaCompilerArgument, XlaComputationLaunchContext, XlaGraph,
};
use tfe_rs::tensor::TensorShape;
use tfe_rs::xla::{ExecutableBuildOptions, ExecutableRunOptions};
use tfe_rs::{eager::kernel_registry, Code, DType, Tensor};

fn infos(vars: &[&Arc<Var>]) -> Vec<VariableInfo> {
    vars.iter()
        .enumerate()
        .map(|(index, var)| VariableInfo::new(index, Some(Arc::clone(var))))
        .collect()
}

#[test]
fn opposite_orders_do_not_deadlock() {
    let a = Var::new(DType::F32);
    let b = Var::new(DType::F32);
    let c = Var::new(DType::F32);
    let start = Arc::new(Barrier::new(2));

    let workers: Vec<_> = [vec![Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)], vec![
        Arc::clone(&c),
        Arc::clone(&b),
        Arc::clone(&a),
    ]]
    .into_iter()
    .map(|order| {
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            for _ in 0..200 {
                let mut held: Vec<VariableInfo> = order
                    .iter()
                    .enumerate()
                    .map(|(index, var)| VariableInfo::new(index, Some(Arc::clone(var))))
                    .collect();
                lock_variables(&mut held).unwrap();
                assert!(held.iter().all(VariableInfo::lock_held));
            }
        })
    })
    .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(!a.is_locked() && !b.is_locked() && !c.is_locked());
}

#[test]
fn shuffled_orders_do_not_deadlock() {
    let vars: Vec<Arc<Var>> = (0..6).map(|_| Var::new(DType::F32)).collect();
    let workers: Vec<_> = (0..4u64)
        .map(|seed| {
            let mut order = vars.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..100 {
                    order.shuffle(&mut rng);
                    let take = rng.gen_range(1..=order.len());
                    let mut held: Vec<VariableInfo> = order[..take]
                        .iter()
                        .enumerate()
                        .map(|(index, var)| VariableInfo::new(index, Some(Arc::clone(var))))
                        .collect();
                    lock_variables(&mut held).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(vars.iter().all(|var| !var.is_locked()));
}

#[test]
fn locks_are_taken_in_creation_order() {
    let first = Var::new(DType::F32);
    let second = Var::new(DType::F32);
    assert!(first.lock_key() < second.lock_key());

    // Holding `first` elsewhere must block before `second` is touched.
    first.lock_exclusive();
    let blocked = {
        let first = Arc::clone(&first);
        let second = Arc::clone(&second);
        thread::spawn(move || {
            let mut held = infos(&[&second, &first]);
            lock_variables(&mut held).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!second.is_locked());
    first.unlock_exclusive();
    blocked.join().unwrap();
    assert!(!first.is_locked() && !second.is_locked());
}

#[test]
fn duplicate_variable_leaves_nothing_locked() {
    let var = Var::new(DType::F32);
    let other = Var::new(DType::F32);
    let mut held = infos(&[&var, &other, &var]);
    let err = lock_variables(&mut held).unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "Duplicate variable passed to XLA cluster");
    assert!(!var.is_locked());
    assert!(!other.is_locked());
    assert!(held.iter().all(|info| !info.lock_held()));
}

#[test]
fn locks_release_on_drop_and_on_early_return() -> Result<()> {
    let var = Var::new(DType::F32);
    {
        let mut held = infos(&[&var]);
        lock_variables(&mut held)?;
        assert!(var.is_locked());
    }
    assert!(!var.is_locked());

    let failing = |var: &Arc<Var>| -> tfe_rs::StatusResult<()> {
        let mut held = infos(&[var]);
        lock_variables(&mut held)?;
        Err(tfe_rs::Status::aborted("bail out while holding the lock"))
    };
    assert!(failing(&var).is_err());
    assert!(!var.is_locked());
    assert!(var.try_lock_exclusive());
    var.unlock_exclusive();
    Ok(())
}

#[test]
fn write_requires_the_lock() -> Result<()> {
    common::init();
    let allocator = tfe_rs::device::DeviceAllocator::new("test", 0, None);
    let value = DeviceTensor::from_host(&Tensor::scalar(1.0f32), &allocator)?;
    let var = Var::new(DType::F32);
    let info = VariableInfo::new(0, Some(Arc::clone(&var)));
    assert_eq!(info.write(value.clone()).unwrap_err().code(), Code::Internal);

    let mut held = vec![info];
    lock_variables(&mut held)?;
    held[0].write(value)?;
    drop(held);
    assert!(var.is_initialized());
    assert!(!var.is_locked());
    Ok(())
}

#[test]
fn snapshot_reads_values_and_releases() -> Result<()> {
    let empty = Var::new(DType::F32);
    let snapshot = snapshot_resource_variables(&[(3, Arc::clone(&empty))])?;
    assert!(!snapshot[&3].present());
    assert!(!empty.is_locked());
    Ok(())
}

#[test]
fn mismatched_variable_write_is_internal() -> Result<()> {
    let context = common::context()?;
    let device = context.find_device(XLA_CPU)?;
    let local = device.local()?;

    // Compiled against a float variable, but run with an int32 one.
    let args = vec![
        XlaCompilerArgument {
            kind: ArgumentKind::Resource { initialized: false },
            dtype: DType::F32,
            shape: TensorShape::scalar(),
        },
        XlaCompilerArgument {
            kind: ArgumentKind::Parameter,
            dtype: DType::F32,
            shape: TensorShape::new([2]),
        },
    ];
    let graph = XlaGraph::single_op("AssignVariableOp", &AttrMap::new(), 2, 0);
    let compiled = compile_graph(&graph, &args, kernel_registry())?;
    assert_eq!(compiled.resource_updates.len(), 1);
    let executable = local.client().compile(
        &compiled.module,
        &compiled.xla_input_shapes,
        &ExecutableBuildOptions::for_device(device.ordinal()),
        Some(local.allocator()),
    )?;

    let var = Var::new(DType::I32);
    let value = Tensor::from_vec(TensorShape::new([2]), vec![1.0f32, 2.0])?;
    let inputs = vec![
        KernelInput::Resource(Arc::clone(&var)),
        KernelInput::Tensor(DeviceTensor::from_host(&value, local.allocator())?),
    ];
    let snapshot = snapshot_resource_variables(&[(0, Arc::clone(&var))])?;
    let launch = XlaComputationLaunchContext::new(local, device.ordinal());
    let arguments = launch.populate_inputs(&compiled, &inputs, &snapshot)?;
    let result = executable.run(
        &arguments,
        &ExecutableRunOptions::new(local.compute_stream(), local.allocator()),
    )?;

    let err = launch.populate_outputs(&compiled, result, &inputs).unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "Mismatched type in variable write");
    assert!(!var.is_locked());
    assert!(!var.is_initialized());
    Ok(())
}

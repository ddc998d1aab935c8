mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tfe_rs::eager::{ClusterDef, JobDef, LoopbackChannelFactory, ServerDef, WorkerChannelFactory};
use tfe_rs::{copy_to_device, Code, ContextOptions};

const WORKER0_CPU: &str = "/job:worker/replica:0/task:0/device:CPU:0";
const WORKER1_CPU: &str = "/job:worker/replica:0/task:1/device:CPU:0";

fn cluster(job: &str, tasks: &[u32], self_task: u32) -> ServerDef {
    ServerDef {
        cluster: ClusterDef {
            job: vec![JobDef {
                name: job.to_string(),
                tasks: tasks
                    .iter()
                    .map(|&task| (task, format!("localhost:{}", 2220 + task)))
                    .collect::<BTreeMap<_, _>>(),
            }],
        },
        job_name: job.to_string(),
        task_index: self_task,
        protocol: "grpc".to_string(),
    }
}

#[test]
fn rebinding_renames_local_devices_and_adds_remote_ones() -> Result<()> {
    let context = common::context()?;
    let before = common::matrix(&context)?;
    context.set_server_def(600, cluster("worker", &[0, 1], 0))?;
    assert_eq!(context.keep_alive_secs(), 600);
    assert_eq!(context.server_def().map(|def| def.job_name), Some("worker".to_string()));

    let names: Vec<String> = context.devices().iter().map(|d| d.name().to_string()).collect();
    assert!(names.contains(&WORKER0_CPU.to_string()));
    assert!(names.contains(&WORKER1_CPU.to_string()));
    assert!(!names.iter().any(|name| name.starts_with("/job:localhost")));

    let err = context.find_device(common::HOST_CPU).unwrap_err();
    assert_eq!(err.message(), format!("{} unknown device.", common::HOST_CPU));

    let err = common::run(&context, "Neg", &[&before])
        .unwrap_err()
        .downcast::<tfe_rs::Status>()?;
    assert!(err
        .message()
        .starts_with(&format!("device {} is not part of the current cluster topology", common::HOST_CPU)));

    let after = common::matrix(&context)?;
    assert_eq!(after.device_name(), WORKER0_CPU);
    let remote = copy_to_device(&after, &context, WORKER1_CPU)?;
    assert_eq!(remote.device_name(), WORKER1_CPU);
    assert_eq!(
        remote.resolve().unwrap_err().message(),
        "TFE_TensorHandleResolve may not be called on a remote tensor handle."
    );
    let back = copy_to_device(&remote, &context, WORKER0_CPU)?;
    assert_eq!(common::resolve_floats(&back)?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn ops_run_on_remote_workers() -> Result<()> {
    let channels = Arc::new(LoopbackChannelFactory::new());
    let context = common::context_with(ContextOptions {
        channel_factory: Some(Arc::clone(&channels) as Arc<dyn WorkerChannelFactory>),
        ..ContextOptions::default()
    })?;
    context.set_server_def(0, cluster("localhost", &[0, 1], 0))?;
    let worker = channels
        .worker("localhost", 1, "localhost:2221")
        .ok_or_else(|| anyhow::anyhow!("task 1 was not connected"))?;
    let remote_cpu = "/job:localhost/replica:0/task:1/device:CPU:0";

    let m = common::matrix(&context)?;
    let outputs = common::run_on(&context, "MatMul", remote_cpu, &[&m, &m])?;
    assert_eq!(outputs[0].device_name(), remote_cpu);
    assert!(worker.live_tensors() >= 1);

    let local = copy_to_device(&outputs[0], &context, common::HOST_CPU)?;
    assert_eq!(common::resolve_floats(&local)?, vec![7.0, 10.0, 15.0, 22.0]);

    drop(outputs);
    drop(local);
    assert_eq!(worker.live_tensors(), 0);
    Ok(())
}

#[test]
fn same_task_keeps_local_devices() -> Result<()> {
    let context = common::context()?;
    context.set_server_def(0, cluster("localhost", &[0, 1], 0))?;
    let m = common::matrix(&context)?;
    context.set_server_def(0, cluster("localhost", &[0, 1, 2], 0))?;
    let outputs = common::run(&context, "Neg", &[&m])?;
    assert_eq!(common::resolve_floats(&outputs[0])?, vec![-1.0, -2.0, -3.0, -4.0]);
    context.find_device("/job:localhost/replica:0/task:2/device:CPU:0")?;
    Ok(())
}

#[test]
fn changing_job_retires_previous_names() -> Result<()> {
    let context = common::context()?;
    context.set_server_def(0, cluster("worker", &[0, 1], 0))?;
    let on_worker = common::matrix(&context)?;

    context.set_server_def(0, cluster("trainer", &[0, 1], 0))?;
    assert_eq!(context.find_device(WORKER1_CPU).unwrap_err().code(), Code::InvalidArgument);
    let err = copy_to_device(&on_worker, &context, "/job:trainer/replica:0/task:1/device:CPU:0").unwrap_err();
    assert!(err.message().contains("is not part of the current cluster topology"));

    let fresh = common::matrix(&context)?;
    let remote = copy_to_device(&fresh, &context, "/job:trainer/replica:0/task:1/device:CPU:0")?;
    assert_eq!(remote.device_name(), "/job:trainer/replica:0/task:1/device:CPU:0");
    Ok(())
}

#[test]
fn invalid_server_defs_are_rejected() -> Result<()> {
    let context = common::context()?;
    let mut def = cluster("worker", &[0], 0);
    def.job_name = "ps".to_string();
    let err = context.set_server_def(0, def).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "job ps is not defined in the cluster");

    let mut def = cluster("worker", &[0], 0);
    def.task_index = 3;
    let err = context.set_server_def(0, def).unwrap_err();
    assert_eq!(err.message(), "task 3 is not defined for job worker");

    assert_eq!(
        context.set_server_def_json(0, b"{not json").unwrap_err().code(),
        Code::InvalidArgument
    );
    // Nothing changed.
    context.find_device(common::HOST_CPU)?;
    Ok(())
}
